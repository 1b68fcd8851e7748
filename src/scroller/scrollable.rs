use std::sync::Arc;

use log::debug;

use crate::{
    config::{ResultConfig, ScrollMode},
    error::DriverError,
    row::{Frame, Row},
};

use super::{ResultSource, Scroller, fetcher::Feed};

/// Random-access scroller.
///
/// Every materialized row is kept, so memory grows with the part of the result visited.
/// `index` is `-1` before the first row and `rows.len()` after the last.
///
/// [`Scroller::last`], [`Scroller::after_last`] and [`Scroller::absolute`] with a negative
/// row have to read the whole remaining result first, since the end can only be located
/// once the final page has arrived. They take time and memory proportional to the result
/// size.
pub struct ScrollableScroller {
    feed: Feed,
    rows: Vec<Row>,
    index: i64,
}

impl ScrollableScroller {
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
            rows,
            index: -1,
        }
    }

    /// Page requests issued so far.
    pub fn fetches(&self) -> u64 {
        self.feed.fetches()
    }

    fn len(&self) -> i64 {
        self.rows.len() as i64
    }

    fn on_row(&self) -> bool {
        self.index >= 0 && self.index < self.len()
    }

    fn merge_in_flight(&mut self) -> Result<(), DriverError> {
        if let Some(rows) = self.feed.join()? {
            self.rows.extend(rows);
        }
        Ok(())
    }

    /// Fetches until `target` is a materialized index or the result is exhausted. Returns
    /// whether `target` exists.
    fn materialize_to(&mut self, target: i64) -> Result<bool, DriverError> {
        if target < self.len() {
            return Ok(true);
        }
        self.merge_in_flight()?;
        while self.len() <= target && !self.feed.exhausted() {
            let rows = self.feed.fetch_now()?;
            self.rows.extend(rows);
        }
        Ok(target < self.len())
    }

    fn drain(&mut self) -> Result<(), DriverError> {
        self.merge_in_flight()?;
        while !self.feed.exhausted() {
            let rows = self.feed.fetch_now()?;
            self.rows.extend(rows);
        }
        debug!("materialized all {} rows", self.rows.len());
        Ok(())
    }

    fn move_to(&mut self, target: i64) -> Result<bool, DriverError> {
        if target < 0 {
            self.index = -1;
            return Ok(false);
        }
        if self.materialize_to(target)? {
            self.index = target;
            Ok(true)
        } else {
            self.index = self.len();
            Ok(false)
        }
    }
}

impl Scroller for ScrollableScroller {
    fn mode(&self) -> ScrollMode {
        ScrollMode::Scrollable
    }

    fn next(&mut self) -> Result<bool, DriverError> {
        self.feed.check_open()?;
        if self.index >= self.len() {
            return Ok(false);
        }

        let ahead = self.len() - self.index - 1;
        if ahead <= self.feed.config().prefetch_threshold() as i64 {
            self.feed.prefetch()?;
        }

        let target = self.index + 1;
        if target >= self.len() {
            self.materialize_to(target)?;
        }
        self.index = target.min(self.len());
        Ok(self.on_row())
    }

    fn current(&self) -> Option<&Row> {
        if self.on_row() {
            self.rows.get(self.index as usize)
        } else {
            None
        }
    }

    fn position(&self) -> i64 {
        self.index
    }

    fn is_before_first(&self) -> bool {
        self.index < 0 && !self.rows.is_empty()
    }

    fn is_after_last(&self) -> bool {
        self.index >= self.len() && !self.rows.is_empty()
    }

    fn is_last(&mut self) -> Result<bool, DriverError> {
        self.feed.check_open()?;
        if !self.on_row() {
            return Ok(false);
        }
        Ok(!self.materialize_to(self.index + 1)?)
    }

    fn previous(&mut self) -> Result<bool, DriverError> {
        self.relative(-1)
    }

    fn absolute(&mut self, row: i64) -> Result<bool, DriverError> {
        self.feed.check_open()?;
        match row {
            0 => {
                self.index = -1;
                Ok(false)
            }
            row if row > 0 => self.move_to(row - 1),
            row => {
                self.drain()?;
                self.move_to(self.len() + row)
            }
        }
    }

    fn relative(&mut self, offset: i64) -> Result<bool, DriverError> {
        self.feed.check_open()?;
        if offset == 0 {
            return Ok(self.on_row());
        }

        let target = self.index.saturating_add(offset);
        if target >= 0 && target < self.len() {
            self.index = target;
            return Ok(true);
        }
        self.move_to(target)
    }

    fn first(&mut self) -> Result<bool, DriverError> {
        self.absolute(1)
    }

    fn last(&mut self) -> Result<bool, DriverError> {
        self.absolute(-1)
    }

    fn before_first(&mut self) -> Result<(), DriverError> {
        self.absolute(0).map(|_| ())
    }

    fn after_last(&mut self) -> Result<(), DriverError> {
        self.feed.check_open()?;
        self.drain()?;
        self.index = self.len();
        Ok(())
    }

    fn buffered(&self) -> usize {
        self.rows.len()
    }

    fn fetch_in_flight(&self) -> bool {
        self.feed.in_flight()
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.rows.clear();
        self.index = -1;
        self.feed.close()
    }

    fn is_closed(&self) -> bool {
        self.feed.is_closed()
    }
}
