//! Connection and result configuration.
use std::{net::SocketAddr, time::Duration};

/// Page size requested when a caller leaves `fetch_size` at `0`.
pub const DEFAULT_FETCH_SIZE: u32 = 100;

/// Upper bound on the number of buffered rows that triggers a background prefetch.
pub const PREFETCH_THRESHOLD: u32 = 20;

/// Default deadline for a single request.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollMode {
    /// Single pass. Consumed rows are dropped.
    #[default]
    Forward,
    /// Random access. Every row seen is kept.
    Scrollable,
}

/// How a statement's result is paged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultConfig {
    /// Rows requested per page; `0` selects [`DEFAULT_FETCH_SIZE`].
    pub fetch_size: u32,
    /// Cap on the rows ever surfaced; `0` means unlimited.
    pub max_rows: u64,
    /// Deadline for each page request; zero waits indefinitely.
    pub timeout: Duration,
    pub mode: ScrollMode,
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self {
            fetch_size: 0,
            max_rows: 0,
            timeout: DEFAULT_CALL_TIMEOUT,
            mode: ScrollMode::Forward,
        }
    }
}

impl ResultConfig {
    pub fn fetch_size(mut self, fetch_size: u32) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    pub fn max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mode(mut self, mode: ScrollMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn effective_fetch_size(&self) -> u32 {
        match self.fetch_size {
            0 => DEFAULT_FETCH_SIZE,
            size => size,
        }
    }

    /// Buffered rows at or below which a prefetch starts: `min(20, fetch size)`.
    pub fn prefetch_threshold(&self) -> usize {
        PREFETCH_THRESHOLD.min(self.effective_fetch_size()) as usize
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub address: SocketAddr,
    pub user: String,
    pub password: String,
    /// Passed through to the server untouched.
    pub properties: Vec<(String, String)>,
    pub call_timeout: Duration,
    /// Zero waits for the operating system's connect timeout.
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            user: String::new(),
            password: String::new(),
            properties: Vec::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_string();
        self.password = password.to_string();
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.push((key.to_string(), value.to_string()));
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefetch_threshold_follows_small_fetch_sizes() {
        assert_eq!(ResultConfig::default().prefetch_threshold(), 20);
        assert_eq!(ResultConfig::default().fetch_size(5).prefetch_threshold(), 5);
        assert_eq!(ResultConfig::default().fetch_size(500).prefetch_threshold(), 20);
    }

    #[test]
    fn zero_fetch_size_means_default() {
        let config = ResultConfig::default();
        assert_eq!(config.effective_fetch_size(), DEFAULT_FETCH_SIZE);
    }

    #[test]
    fn connection_builder() {
        let config = ConnectionConfig::new("127.0.0.1:7070".parse().unwrap())
            .credentials("app", "secret")
            .property("schema", "public");

        assert_eq!(config.user, "app");
        assert_eq!(config.properties, vec![("schema".into(), "public".into())]);
    }
}
