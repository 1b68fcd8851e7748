//! Result paging engine.
//!
//! A scroller turns the pages a server hands out for one statement into a cursor over the
//! logical row sequence. It starts from the first [`Frame`] returned by execute and asks
//! its [`ResultSource`] for further pages on a background thread while the caller is still
//! consuming buffered rows.
//!
//! Two kinds exist behind the [`Scroller`] trait:
//!
//! - [`ForwardScroller`]: single pass, consumed rows are dropped, so memory stays bounded
//!   to roughly one page. Any positioning other than `next` is unsupported.
//! - [`ScrollableScroller`]: keeps every row seen so it can move backwards and jump to
//!   absolute or relative positions.
//!
//! # Positions
//!
//! [`Scroller::position`] is `-1` before the first row, `0..N-1` on a row and `N` after the
//! last row, where `N` is the number of rows materialized so far. Running off either end
//! parks the cursor on one of the two sentinels; it is not an error.
//!
//! # Background fetches
//!
//! At most one fetch is outstanding per scroller. The fetch thread only produces a page;
//! rows are appended to the buffer by the owning thread after it joins the fetch, so pages
//! always land in server order.
mod fetcher;
mod forward;
mod scrollable;

use std::{sync::Arc, time::Duration};

use crate::{
    config::{ResultConfig, ScrollMode},
    error::DriverError,
    row::{Frame, Row},
};

pub use forward::ForwardScroller;
pub use scrollable::ScrollableScroller;

/// Page provider a scroller pulls from. Implemented by [`Session`](crate::Session).
pub trait ResultSource: Send + Sync {
    /// Fetches the page of `statement_id` starting at `offset`.
    fn fetch_next_page(
        &self,
        statement_id: u64,
        offset: u64,
        page_size: u32,
        timeout: Duration,
    ) -> Result<Frame, DriverError>;

    /// Releases the open result of a statement. Closing twice is not an error.
    fn close_result(&self, statement_id: u64, timeout: Duration) -> Result<(), DriverError>;

    /// Releases a statement. Closing twice is not an error.
    fn close_statement(&self, statement_id: u64, timeout: Duration) -> Result<(), DriverError>;
}

/// Cursor over a statement's result.
///
/// Navigation methods return whether the cursor now sits on a row. The result ends at the
/// page flagged as last, or at the first empty page, whichever comes first.
pub trait Scroller: Send {
    fn mode(&self) -> ScrollMode;

    /// Moves to the next row.
    fn next(&mut self) -> Result<bool, DriverError>;

    /// The row under the cursor, if any.
    fn current(&self) -> Option<&Row>;

    /// `-1` before the first row, the row index on a row, the materialized row count after
    /// the last row.
    fn position(&self) -> i64;

    /// One-based number of the current row; `0` when not on a row.
    fn row_number(&self) -> u64 {
        match self.current() {
            Some(_) => self.position() as u64 + 1,
            None => 0,
        }
    }

    fn is_before_first(&self) -> bool;

    fn is_after_last(&self) -> bool;

    fn is_first(&self) -> bool {
        self.current().is_some() && self.position() == 0
    }

    /// Whether the current row is the final one. May fetch a page to find out.
    fn is_last(&mut self) -> Result<bool, DriverError>;

    fn previous(&mut self) -> Result<bool, DriverError> {
        Err(DriverError::Unsupported("previous"))
    }

    /// Moves to an absolute row. `1` is the first row, `-1` the last, `0` before the first.
    fn absolute(&mut self, _row: i64) -> Result<bool, DriverError> {
        Err(DriverError::Unsupported("absolute"))
    }

    fn relative(&mut self, _offset: i64) -> Result<bool, DriverError> {
        Err(DriverError::Unsupported("relative"))
    }

    fn first(&mut self) -> Result<bool, DriverError> {
        Err(DriverError::Unsupported("first"))
    }

    fn last(&mut self) -> Result<bool, DriverError> {
        Err(DriverError::Unsupported("last"))
    }

    fn before_first(&mut self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("before_first"))
    }

    fn after_last(&mut self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("after_last"))
    }

    /// Rows held in memory.
    fn buffered(&self) -> usize;

    fn fetch_in_flight(&self) -> bool;

    /// Releases the result on the server. A background fetch already running is waited for
    /// and its page discarded, so this may block for up to the configured timeout.
    fn close(&mut self) -> Result<(), DriverError>;

    fn is_closed(&self) -> bool;
}

/// Builds the scroller selected by `config.mode` over a statement's first page.
///
/// With `owns_statement` set, closing the scroller also closes the statement.
pub fn open(
    source: Arc<dyn ResultSource>,
    statement_id: u64,
    first: Frame,
    config: ResultConfig,
    owns_statement: bool,
) -> Box<dyn Scroller> {
    match config.mode {
        ScrollMode::Forward => Box::new(ForwardScroller::new(
            source,
            statement_id,
            first,
            config,
            owns_statement,
        )),
        ScrollMode::Scrollable => Box::new(ScrollableScroller::new(
            source,
            statement_id,
            first,
            config,
            owns_statement,
        )),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::*;
    use crate::value::Value;

    pub(crate) fn row(i: u64) -> Row {
        Row::new(vec![Value::Int64(i as i64), Value::Text(format!("r{i}"))])
    }

    pub(crate) fn rows(range: std::ops::Range<u64>) -> Vec<Row> {
        range.map(row).collect()
    }

    /// Serves a fixed result in pages and records how it is used.
    pub(crate) struct ScriptedSource {
        total: u64,
        delay: Duration,
        fetches: AtomicUsize,
        in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
        pub(crate) closed: Mutex<Vec<&'static str>>,
        failures: AtomicUsize,
        panics: AtomicUsize,
        close_fails: bool,
    }

    impl ScriptedSource {
        pub(crate) fn new(total: u64) -> Self {
            Self {
                total,
                delay: Duration::ZERO,
                fetches: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                closed: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(0),
                panics: AtomicUsize::new(0),
                close_fails: false,
            }
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// The next `count` fetches fail with a service error.
        pub(crate) fn failing(self, count: usize) -> Self {
            self.failures.store(count, Ordering::SeqCst);
            self
        }

        /// The next `count` fetches panic on the fetch thread.
        pub(crate) fn panicking(self, count: usize) -> Self {
            self.panics.store(count, Ordering::SeqCst);
            self
        }

        /// `close_result` fails after recording the call.
        pub(crate) fn failing_close(mut self) -> Self {
            self.close_fails = true;
            self
        }

        /// Fetches currently running.
        pub(crate) fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }

        pub(crate) fn page(&self, offset: u64, size: u64) -> Frame {
            let end = (offset + size).min(self.total);
            let start = offset.min(end);
            Frame::new(start, end >= self.total, rows(start..end))
        }

        pub(crate) fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl ResultSource for ScriptedSource {
        fn fetch_next_page(
            &self,
            _statement_id: u64,
            offset: u64,
            page_size: u32,
            _timeout: Duration,
        ) -> Result<Frame, DriverError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let panicking = self
                .panics
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if panicking {
                panic!("page source crashed at offset {offset}");
            }

            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(DriverError::Service {
                    code: 99,
                    message: "page unavailable".into(),
                    sql_state: None,
                });
            }

            Ok(self.page(offset, page_size as u64))
        }

        fn close_result(&self, _statement_id: u64, _timeout: Duration) -> Result<(), DriverError> {
            self.closed.lock().unwrap().push("result");
            if self.close_fails {
                return Err(DriverError::ConnectionClosed);
            }
            Ok(())
        }

        fn close_statement(
            &self,
            _statement_id: u64,
            _timeout: Duration,
        ) -> Result<(), DriverError> {
            self.closed.lock().unwrap().push("statement");
            Ok(())
        }
    }

    pub(crate) fn config(fetch_size: u32, mode: ScrollMode) -> ResultConfig {
        ResultConfig::default()
            .fetch_size(fetch_size)
            .mode(mode)
            .timeout(Duration::from_secs(5))
    }
}
