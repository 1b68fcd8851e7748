use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, trace, warn};

use crate::{
    config::ResultConfig,
    error::DriverError,
    row::{Frame, Row},
};

use super::ResultSource;

/// One page request running on its own thread.
///
/// The thread only produces a [`Frame`]; it never touches a scroller's buffer. Rows reach
/// the buffer when the owner joins the fetch.
pub(crate) struct Fetcher {
    offset: u64,
    handle: JoinHandle<Result<Frame, DriverError>>,
}

impl Fetcher {
    pub(crate) fn spawn(
        source: Arc<dyn ResultSource>,
        statement_id: u64,
        offset: u64,
        page_size: u32,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        let handle = thread::Builder::new()
            .name(format!("floe-fetch-{statement_id}"))
            .spawn(move || {
                trace!("fetching statement {statement_id} from offset {offset}");
                source.fetch_next_page(statement_id, offset, page_size, timeout)
            })
            .map_err(|e| DriverError::Interrupted(format!("failed to spawn fetch: {e}")))?;

        Ok(Self { offset, handle })
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Waits for the page. A panicked fetch thread is reported as
    /// [`DriverError::Interrupted`]; errors from the source are returned as they are.
    pub(crate) fn join(self) -> Result<Frame, DriverError> {
        match self.handle.join() {
            Ok(frame) => frame,
            Err(_) => Err(DriverError::Interrupted(format!(
                "fetch from offset {} panicked",
                self.offset
            ))),
        }
    }

    /// Waits for the fetch to finish and discards its page. A request already on the wire
    /// cannot be interrupted, so this blocks for up to the fetch timeout.
    pub(crate) fn discard(self) {
        if let Err(e) = self.join() {
            debug!("discarded fetch: {e}");
        }
    }
}

/// Paging state shared by both scroller kinds: where the next page starts, whether the
/// server has more, and the single outstanding fetch.
pub(crate) struct Feed {
    source: Arc<dyn ResultSource>,
    statement_id: u64,
    config: ResultConfig,
    owns_statement: bool,
    next_offset: u64,
    exhausted: bool,
    surfaced: u64,
    fetch: Option<Fetcher>,
    fetches: u64,
    closed: bool,
}

impl Feed {
    /// Builds the feed over the statement's first page. Returns the rows of that page that
    /// may be surfaced under `max_rows`.
    pub(crate) fn new(
        source: Arc<dyn ResultSource>,
        statement_id: u64,
        first: Frame,
        config: ResultConfig,
        owns_statement: bool,
    ) -> (Self, Vec<Row>) {
        let mut feed = Self {
            source,
            statement_id,
            config,
            owns_statement,
            next_offset: first.offset,
            exhausted: false,
            surfaced: 0,
            fetch: None,
            fetches: 0,
            closed: false,
        };
        let rows = feed.accept(first);
        (feed, rows)
    }

    pub(crate) fn config(&self) -> &ResultConfig {
        &self.config
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.fetch.is_some()
    }

    /// Number of page requests started so far.
    pub(crate) fn fetches(&self) -> u64 {
        self.fetches
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn check_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::ResultClosed);
        }
        Ok(())
    }

    /// Starts a background fetch unless one is running or the result is exhausted.
    pub(crate) fn prefetch(&mut self) -> Result<(), DriverError> {
        if self.exhausted || self.fetch.is_some() {
            return Ok(());
        }

        let fetcher = Fetcher::spawn(
            Arc::clone(&self.source),
            self.statement_id,
            self.next_offset,
            self.config.effective_fetch_size(),
            self.config.timeout,
        )?;
        self.fetches += 1;
        debug!(
            "statement {}: prefetching from offset {}",
            self.statement_id,
            fetcher.offset()
        );
        self.fetch = Some(fetcher);
        Ok(())
    }

    /// Joins the outstanding fetch, if any, and returns its rows.
    ///
    /// The fetch handle is cleared whatever the outcome, so a failed page is requested again
    /// by the next call.
    pub(crate) fn join(&mut self) -> Result<Option<Vec<Row>>, DriverError> {
        match self.fetch.take() {
            Some(fetcher) => {
                let frame = fetcher.join()?;
                Ok(Some(self.accept(frame)))
            }
            None => Ok(None),
        }
    }

    /// Returns the next page, starting a fetch if none is running. Returns no rows without
    /// contacting the server once the result is exhausted.
    pub(crate) fn fetch_now(&mut self) -> Result<Vec<Row>, DriverError> {
        self.prefetch()?;
        Ok(self.join()?.unwrap_or_default())
    }

    fn accept(&mut self, frame: Frame) -> Vec<Row> {
        if frame.offset != self.next_offset {
            warn!(
                "statement {}: expected page at offset {}, got {}",
                self.statement_id, self.next_offset, frame.offset
            );
        }

        let Frame {
            offset,
            is_last,
            mut rows,
        } = frame;
        self.next_offset = offset + rows.len() as u64;

        if is_last {
            self.exhausted = true;
        } else if rows.is_empty() {
            warn!(
                "statement {}: empty page at offset {offset} without last flag",
                self.statement_id
            );
            self.exhausted = true;
        }

        let max_rows = self.config.max_rows;
        if max_rows > 0 {
            let room = max_rows.saturating_sub(self.surfaced) as usize;
            if rows.len() >= room {
                rows.truncate(room);
                self.exhausted = true;
            }
        }

        self.surfaced += rows.len() as u64;
        rows
    }

    /// Waits out any outstanding fetch and releases the result on the server. Both the result
    /// and, when owned, the statement are released even if one of them fails; the first error
    /// is returned. Later calls do nothing.
    pub(crate) fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(fetcher) = self.fetch.take() {
            fetcher.discard();
        }

        let timeout = self.config.timeout;
        let result = self.source.close_result(self.statement_id, timeout);
        let statement = if self.owns_statement {
            self.source.close_statement(self.statement_id, timeout)
        } else {
            Ok(())
        };
        debug!("statement {}: result closed", self.statement_id);
        result.and(statement)
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("statement {}: close on drop failed: {e}", self.statement_id);
        }
    }
}
