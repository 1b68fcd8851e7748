//! Driver-level error taxonomy.
//!
//! Every public dispatcher, session and scroller operation fails with a [`DriverError`].
//! The variants separate four classes a caller usually wants to tell apart:
//!
//! - transport failures, fatal to the connection ([`DriverError::Transport`],
//!   [`DriverError::ConnectionClosed`]),
//! - local deadlines ([`DriverError::Timeout`]),
//! - errors reported by the server for one call ([`DriverError::Service`]),
//! - interrupted background fetches ([`DriverError::Interrupted`]).
//!
//! The remaining variants cover malformed rows, unsupported navigation and misuse of a
//! closed result.
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{ErrorDetail, TransportError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("request {id} timed out after {timeout:?}")]
    Timeout { id: u64, timeout: Duration },

    #[error("server error {code}: {message}")]
    Service {
        code: i32,
        message: String,
        sql_state: Option<String>,
    },

    #[error("background fetch interrupted: {0}")]
    Interrupted(String),

    #[error("malformed value at row {row}, column {column}: {reason}")]
    DataFormat {
        row: u64,
        column: usize,
        reason: String,
    },

    #[error("unsupported operation '{0}'")]
    Unsupported(&'static str),

    #[error("result is closed")]
    ResultClosed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ConnectionClosed)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_service(&self) -> bool {
        matches!(self, Self::Service { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }
}

impl From<TransportError> for DriverError {
    fn from(value: TransportError) -> Self {
        DriverError::Transport(value.to_string())
    }
}

impl From<ErrorDetail> for DriverError {
    fn from(value: ErrorDetail) -> Self {
        DriverError::Service {
            code: value.code,
            message: value.message,
            sql_state: value.sql_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_detail_becomes_service_error() {
        let detail = ErrorDetail {
            code: 42,
            message: "no such table".into(),
            sql_state: Some("42S02".into()),
        };
        let err: DriverError = detail.into();

        assert!(err.is_service());
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "server error 42: no such table");
    }

    #[test]
    fn classifiers() {
        assert!(DriverError::ConnectionClosed.is_transport());
        assert!(
            DriverError::Timeout {
                id: 1,
                timeout: Duration::from_millis(50)
            }
            .is_timeout()
        );
        assert!(DriverError::Interrupted("join".into()).is_interrupted());
    }
}
