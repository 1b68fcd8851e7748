use std::{collections::VecDeque, sync::Arc};

use crate::{
    config::{ResultConfig, ScrollMode},
    error::DriverError,
    row::{Frame, Row},
};

use super::{ResultSource, Scroller, fetcher::Feed};

/// Single-pass scroller.
///
/// Holds a FIFO of rows not yet consumed. A prefetch starts as soon as the queue shrinks to
/// the prefetch threshold, and the fetched page is merged only once the queue runs dry, so
/// at most one page plus one in-flight page is ever held.
pub struct ForwardScroller {
    feed: Feed,
    buffer: VecDeque<Row>,
    current: Option<Row>,
    consumed: u64,
    after_last: bool,
}

impl ForwardScroller {
    pub fn new(
        source: Arc<dyn ResultSource>,
        statement_id: u64,
        first: Frame,
        config: ResultConfig,
        owns_statement: bool,
    ) -> Self {
        let (feed, rows) = Feed::new(source, statement_id, first, config, owns_statement);
        Self {
            feed,
            buffer: rows.into(),
            current: None,
            consumed: 0,
            after_last: false,
        }
    }

    /// Page requests issued so far.
    pub fn fetches(&self) -> u64 {
        self.feed.fetches()
    }

    /// Refills an empty queue from the in-flight fetch, or a new one.
    fn refill(&mut self) -> Result<(), DriverError> {
        while self.buffer.is_empty() && (self.feed.in_flight() || !self.feed.exhausted()) {
            let rows = self.feed.fetch_now()?;
            self.buffer.extend(rows);
        }
        Ok(())
    }
}

impl Scroller for ForwardScroller {
    fn mode(&self) -> ScrollMode {
        ScrollMode::Forward
    }

    fn next(&mut self) -> Result<bool, DriverError> {
        self.feed.check_open()?;
        if self.after_last {
            return Ok(false);
        }

        if self.buffer.len() <= self.feed.config().prefetch_threshold() {
            self.feed.prefetch()?;
        }
        self.refill()?;

        match self.buffer.pop_front() {
            Some(row) => {
                self.current = Some(row);
                self.consumed += 1;
                Ok(true)
            }
            None => {
                self.current = None;
                self.after_last = true;
                Ok(false)
            }
        }
    }

    fn current(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    fn position(&self) -> i64 {
        if self.after_last {
            self.consumed as i64
        } else {
            self.consumed as i64 - 1
        }
    }

    fn is_before_first(&self) -> bool {
        self.consumed == 0 && !self.buffer.is_empty()
    }

    fn is_after_last(&self) -> bool {
        self.after_last && self.consumed > 0
    }

    fn is_last(&mut self) -> Result<bool, DriverError> {
        self.feed.check_open()?;
        if self.current.is_none() {
            return Ok(false);
        }
        self.refill()?;
        Ok(self.buffer.is_empty())
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn fetch_in_flight(&self) -> bool {
        self.feed.in_flight()
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.current = None;
        self.buffer.clear();
        self.feed.close()
    }

    fn is_closed(&self) -> bool {
        self.feed.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scroller::testing::*;

    fn scroller(source: &Arc<ScriptedSource>, first: usize, fetch_size: u32) -> ForwardScroller {
        let first = source.page(0, first as u64);
        ForwardScroller::new(
            source.clone(),
            1,
            first,
            config(fetch_size, ScrollMode::Forward),
            false,
        )
    }

    #[test]
    fn forward_paging() {
        let source = Arc::new(ScriptedSource::new(15));
        let mut scroller = scroller(&source, 10, 10);

        assert!(scroller.is_before_first());
        for i in 0..15 {
            assert!(scroller.next().unwrap(), "row {i}");
            assert_eq!(scroller.current(), Some(&row(i)));
            assert_eq!(scroller.row_number(), i + 1);
        }

        assert!(!scroller.next().unwrap());
        assert!(scroller.current().is_none());
        assert!(scroller.is_after_last());
        assert_eq!(scroller.position(), 15);
        assert_eq!(source.fetches(), 1);
    }

    #[test]
    fn exhausted_scroller_stops_asking() {
        let source = Arc::new(ScriptedSource::new(4));
        let mut scroller = scroller(&source, 4, 10);

        while scroller.next().unwrap() {}
        assert!(!scroller.next().unwrap());
        assert!(!scroller.next().unwrap());
        assert_eq!(source.fetches(), 0);
    }

    #[test]
    fn buffer_stays_within_one_page_of_threshold() {
        let fetch_size = 7;
        let source = Arc::new(ScriptedSource::new(100).with_delay(Duration::from_millis(1)));
        let mut scroller = scroller(&source, fetch_size, fetch_size as u32);
        let bound = scroller.feed.config().prefetch_threshold() + fetch_size;

        while scroller.next().unwrap() {
            assert!(scroller.buffered() <= bound, "{}", scroller.buffered());
        }
        assert_eq!(scroller.row_number(), 0);
        assert_eq!(scroller.position(), 100);
    }

    #[test]
    fn one_fetch_at_a_time() {
        let source = Arc::new(ScriptedSource::new(200).with_delay(Duration::from_millis(2)));
        let mut scroller = scroller(&source, 5, 5);

        let mut seen = 0;
        while scroller.next().unwrap() {
            assert_eq!(scroller.current(), Some(&row(seen)));
            seen += 1;
        }

        assert_eq!(seen, 200);
        assert_eq!(
            source
                .max_in_flight
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn navigation_is_unsupported() {
        let source = Arc::new(ScriptedSource::new(3));
        let mut scroller = scroller(&source, 3, 10);

        assert_eq!(
            scroller.previous().unwrap_err(),
            DriverError::Unsupported("previous")
        );
        assert!(matches!(
            scroller.absolute(1),
            Err(DriverError::Unsupported(_))
        ));
        assert!(matches!(scroller.last(), Err(DriverError::Unsupported(_))));
    }

    #[test]
    fn is_last_peeks_at_the_next_page() {
        let source = Arc::new(ScriptedSource::new(4));
        let mut scroller = scroller(&source, 2, 2);

        assert!(scroller.next().unwrap());
        assert!(scroller.is_first());
        assert!(!scroller.is_last().unwrap());
        assert!(scroller.next().unwrap());
        assert!(!scroller.is_last().unwrap());
        assert!(scroller.next().unwrap());
        assert!(scroller.next().unwrap());
        assert!(scroller.is_last().unwrap());
    }

    #[test]
    fn failed_fetch_is_retried() {
        let source = Arc::new(ScriptedSource::new(6).failing(1));
        let mut scroller = scroller(&source, 3, 3);

        for _ in 0..3 {
            assert!(scroller.next().unwrap());
        }
        assert!(scroller.next().unwrap_err().is_service());
        assert!(!scroller.fetch_in_flight());

        assert!(scroller.next().unwrap());
        assert_eq!(scroller.current(), Some(&row(3)));
    }

    #[test]
    fn panicked_fetch_is_interrupted() {
        let source = Arc::new(ScriptedSource::new(6).panicking(1));
        let mut scroller = scroller(&source, 3, 3);

        for _ in 0..3 {
            assert!(scroller.next().unwrap());
        }
        let err = scroller.next().unwrap_err();
        assert!(err.is_interrupted(), "{err:?}");
        assert!(!err.is_service());
        assert!(!scroller.fetch_in_flight());

        assert!(scroller.next().unwrap());
        assert_eq!(scroller.current(), Some(&row(3)));
    }

    #[test]
    fn empty_page_without_last_flag_ends_the_result() {
        let source = Arc::new(ScriptedSource::new(10));
        let mut scroller = ForwardScroller::new(
            source.clone(),
            1,
            Frame::new(0, false, Vec::new()),
            config(5, ScrollMode::Forward),
            false,
        );

        assert!(!scroller.next().unwrap());
        assert!(!scroller.fetch_in_flight());
        assert_eq!(source.fetches(), 0);
    }

    #[test]
    fn max_rows_truncates() {
        let source = Arc::new(ScriptedSource::new(50));
        let first = source.page(0, 10);
        let mut scroller = ForwardScroller::new(
            source.clone(),
            1,
            first,
            config(10, ScrollMode::Forward).max_rows(13),
            false,
        );

        let mut count = 0;
        while scroller.next().unwrap() {
            count += 1;
        }
        assert_eq!(count, 13);
        assert_eq!(source.fetches(), 1);
    }

    #[test]
    fn close_releases_result_once() {
        let source = Arc::new(ScriptedSource::new(30).with_delay(Duration::from_millis(20)));
        let mut scroller = ForwardScroller::new(
            source.clone(),
            1,
            source.page(0, 10),
            config(10, ScrollMode::Forward),
            true,
        );

        assert!(scroller.next().unwrap());
        assert!(scroller.fetch_in_flight());

        scroller.close().unwrap();
        scroller.close().unwrap();
        drop(scroller);

        assert_eq!(*source.closed.lock().unwrap(), vec!["result", "statement"]);
    }

    #[test]
    fn close_waits_for_the_running_fetch() {
        let source = Arc::new(ScriptedSource::new(30).with_delay(Duration::from_millis(50)));
        let mut scroller = scroller(&source, 10, 10);

        assert!(scroller.next().unwrap());
        assert!(scroller.fetch_in_flight());
        scroller.close().unwrap();

        assert!(!scroller.fetch_in_flight());
        assert_eq!(source.in_flight(), 0);
    }

    #[test]
    fn statement_is_closed_even_if_result_close_fails() {
        let source = Arc::new(ScriptedSource::new(5).failing_close());
        let mut scroller = ForwardScroller::new(
            source.clone(),
            1,
            source.page(0, 5),
            config(5, ScrollMode::Forward),
            true,
        );

        assert_eq!(scroller.close().unwrap_err(), DriverError::ConnectionClosed);
        assert!(scroller.close().is_ok());
        drop(scroller);

        assert_eq!(*source.closed.lock().unwrap(), vec!["result", "statement"]);
    }

    #[test]
    fn closed_scroller_refuses_navigation() {
        let source = Arc::new(ScriptedSource::new(3));
        let mut scroller = scroller(&source, 3, 3);

        scroller.close().unwrap();
        assert!(scroller.is_closed());
        assert_eq!(scroller.next().unwrap_err(), DriverError::ResultClosed);
    }
}
