//! Typed client session.
//!
//! A [`Session`] owns one connection and its [`Dispatcher`]. It turns each operation into
//! a request, waits for the matching response under the configured call timeout and
//! unpacks it. Executing a statement returns a [`QueryResult`] whose scroller pulls later
//! pages back through the session, which implements [`ResultSource`].
//!
//! Sessions are cheap to clone; clones share the connection.
use std::{
    collections::VecDeque,
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use log::{debug, info};

use crate::{
    config::{ConnectionConfig, ResultConfig},
    error::DriverError,
    protocol::{Dispatcher, Request, Response, StreamReceiver, channel},
    row::{Column, Frame, Row, WireFrame},
    scroller::{self, ResultSource, Scroller},
    value::Value,
};

/// A statement prepared on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub statement_id: u64,
    pub columns: Vec<Column>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    dispatcher: Dispatcher,
    config: ConnectionConfig,
    connection_id: u64,
    /// Column count of every statement with a known shape, used to materialize pages.
    arities: DashMap<u64, usize>,
    closed: AtomicBool,
}

fn unexpected(operation: &str, response: Response) -> DriverError {
    DriverError::Protocol(format!("unexpected reply to {operation}: {response:?}"))
}

impl Session {
    /// Connects to the server and opens a connection with the configured credentials.
    pub fn connect(config: ConnectionConfig) -> Result<Self, DriverError> {
        let stream = if config.connect_timeout.is_zero() {
            TcpStream::connect(config.address)
        } else {
            TcpStream::connect_timeout(&config.address, config.connect_timeout)
        }
        .map_err(|e| DriverError::Transport(format!("connect to {}: {e}", config.address)))?;

        let dispatcher = Dispatcher::connect(stream)?;
        let response = dispatcher.call(
            Request::OpenConnection {
                user: config.user.clone(),
                password: config.password.clone(),
                properties: config.properties.clone(),
            },
            config.call_timeout,
        )?;
        let connection_id = match response {
            Response::Connected { connection_id } => connection_id,
            other => return Err(unexpected("open_connection", other)),
        };
        info!("connected to {} as connection {connection_id}", config.address);

        Ok(Self {
            inner: Arc::new(Inner {
                dispatcher,
                config,
                connection_id,
                arities: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && self.inner.dispatcher.is_open()
    }

    fn call(&self, request: Request, timeout: Duration) -> Result<Response, DriverError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionClosed);
        }
        self.inner.dispatcher.call(request, timeout)
    }

    fn call_ok(&self, request: Request, timeout: Duration) -> Result<(), DriverError> {
        let operation = request.name();
        match self.call(request, timeout)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(operation, other)),
        }
    }

    pub fn ping(&self) -> Result<(), DriverError> {
        match self.call(Request::Ping, self.inner.config.call_timeout)? {
            Response::Pong => Ok(()),
            other => Err(unexpected("ping", other)),
        }
    }

    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement, DriverError> {
        let request = Request::Prepare { sql: sql.into() };
        match self.call(request, self.inner.config.call_timeout)? {
            Response::Prepared {
                statement_id,
                columns,
            } => {
                self.inner.arities.insert(statement_id, columns.len());
                Ok(PreparedStatement {
                    statement_id,
                    columns,
                })
            }
            other => Err(unexpected("prepare", other)),
        }
    }

    /// Executes a prepared statement and returns a cursor over its result.
    ///
    /// The statement stays open after the result is closed.
    pub fn execute(
        &self,
        statement: &PreparedStatement,
        parameters: &[Value],
        config: &ResultConfig,
    ) -> Result<QueryResult, DriverError> {
        let request = Request::Execute {
            statement_id: statement.statement_id,
            parameters: parameters.iter().map(Value::to_wire).collect(),
            fetch_size: config.effective_fetch_size(),
            max_rows: config.max_rows,
        };
        let response = self.call(request, config.timeout)?;
        self.open_result("execute", response, config, false)
    }

    /// Prepares and executes `sql` in one round trip. Closing the result also closes the
    /// statement.
    pub fn query(&self, sql: &str, config: &ResultConfig) -> Result<QueryResult, DriverError> {
        let request = Request::PrepareAndExecute {
            sql: sql.into(),
            fetch_size: config.effective_fetch_size(),
            max_rows: config.max_rows,
        };
        let response = self.call(request, config.timeout)?;
        self.open_result("prepare_and_execute", response, config, true)
    }

    fn open_result(
        &self,
        operation: &str,
        response: Response,
        config: &ResultConfig,
        owns_statement: bool,
    ) -> Result<QueryResult, DriverError> {
        let (statement_id, columns, frame) = match response {
            Response::ResultSet {
                statement_id,
                columns,
                frame,
            } => (statement_id, columns, frame),
            other => return Err(unexpected(operation, other)),
        };

        self.inner.arities.insert(statement_id, columns.len());
        let first = Frame::materialize(&frame, columns.len())?;
        debug!(
            "statement {statement_id}: first page holds {} rows (last: {})",
            first.rows.len(),
            first.is_last
        );

        let source: Arc<dyn ResultSource> = Arc::new(self.clone());
        let scroller = scroller::open(
            source,
            statement_id,
            first,
            config.clone(),
            owns_statement,
        );
        Ok(QueryResult {
            statement_id,
            columns,
            scroller,
        })
    }

    /// Executes `sql` with the server pushing every page unasked.
    pub fn query_stream(&self, sql: &str, fetch_size: u32) -> Result<RowStream, DriverError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionClosed);
        }

        let (sink, receiver) = channel();
        let request = Request::ExecuteStream {
            sql: sql.into(),
            fetch_size,
        };
        let id = self.inner.dispatcher.stream(request, Box::new(sink))?;
        Ok(RowStream {
            session: self.clone(),
            id,
            receiver,
            columns: None,
            rows: VecDeque::new(),
        })
    }

    /// Requests one page of an executed statement's result.
    pub fn fetch(
        &self,
        statement_id: u64,
        offset: u64,
        fetch_size: u32,
        timeout: Duration,
    ) -> Result<Frame, DriverError> {
        let request = Request::Fetch {
            statement_id,
            offset,
            fetch_size,
        };
        let frame = match self.call(request, timeout)? {
            Response::Frame(frame) => frame,
            other => return Err(unexpected("fetch", other)),
        };

        let arity = self
            .inner
            .arities
            .get(&statement_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| {
                DriverError::Protocol(format!("no column count known for statement {statement_id}"))
            })?;
        Frame::materialize(&frame, arity)
    }

    pub fn commit(&self) -> Result<(), DriverError> {
        self.call_ok(Request::Commit, self.inner.config.call_timeout)
    }

    pub fn rollback(&self) -> Result<(), DriverError> {
        self.call_ok(Request::Rollback, self.inner.config.call_timeout)
    }

    pub fn close_statement(&self, statement: PreparedStatement) -> Result<(), DriverError> {
        ResultSource::close_statement(
            self,
            statement.statement_id,
            self.inner.config.call_timeout,
        )
    }

    /// Says goodbye to the server and closes the connection. Results still open on this
    /// session fail from then on. Calling it again does nothing.
    pub fn close(&self) -> Result<(), DriverError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let goodbye = self
            .inner
            .dispatcher
            .call(Request::CloseConnection, self.inner.config.call_timeout);
        self.inner.dispatcher.close();
        info!("connection {} closed", self.inner.connection_id);

        match goodbye {
            Ok(Response::Ok) => Ok(()),
            Ok(other) => Err(unexpected("close_connection", other)),
            Err(e) => Err(e),
        }
    }
}

impl ResultSource for Session {
    fn fetch_next_page(
        &self,
        statement_id: u64,
        offset: u64,
        page_size: u32,
        timeout: Duration,
    ) -> Result<Frame, DriverError> {
        self.fetch(statement_id, offset, page_size, timeout)
    }

    fn close_result(&self, statement_id: u64, timeout: Duration) -> Result<(), DriverError> {
        self.call_ok(Request::CloseResult { statement_id }, timeout)
    }

    fn close_statement(&self, statement_id: u64, timeout: Duration) -> Result<(), DriverError> {
        self.inner.arities.remove(&statement_id);
        self.call_ok(Request::CloseStatement { statement_id }, timeout)
    }
}

/// Result of an executed statement.
///
/// Iterating yields rows through the underlying scroller; use [`QueryResult::scroller`]
/// for positioning.
pub struct QueryResult {
    statement_id: u64,
    columns: Vec<Column>,
    scroller: Box<dyn Scroller>,
}

impl QueryResult {
    pub fn statement_id(&self) -> u64 {
        self.statement_id
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn scroller(&mut self) -> &mut dyn Scroller {
        self.scroller.as_mut()
    }

    pub fn close(&mut self) -> Result<(), DriverError> {
        self.scroller.close()
    }
}

impl Iterator for QueryResult {
    type Item = Result<Row, DriverError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.scroller.next() {
            Ok(true) => self.scroller.current().cloned().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Rows of a streamed statement, in server order.
///
/// Waiting for the next page is bounded by the session's call timeout; a zero call timeout
/// waits indefinitely.
pub struct RowStream {
    session: Session,
    id: u64,
    receiver: StreamReceiver,
    columns: Option<Vec<Column>>,
    rows: VecDeque<Row>,
}

impl RowStream {
    /// Column descriptions, known once the first page has arrived.
    pub fn columns(&self) -> Option<&[Column]> {
        self.columns.as_deref()
    }

    /// Stops the stream. Pages the server still sends are dropped.
    pub fn cancel(&mut self) -> bool {
        self.rows.clear();
        self.session.inner.dispatcher.cancel(self.id)
    }

    fn accept(&mut self, frame: &WireFrame) -> Result<(), DriverError> {
        let arity = match &self.columns {
            Some(columns) => columns.len(),
            None => {
                return Err(DriverError::Protocol(
                    "page arrived before the result set".into(),
                ));
            }
        };
        self.rows.extend(Frame::materialize(frame, arity)?.rows);
        Ok(())
    }
}

impl Iterator for RowStream {
    type Item = Result<Row, DriverError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.rows.pop_front() {
                return Some(Ok(row));
            }

            let timeout = self.session.inner.config.call_timeout;
            let received = if timeout.is_zero() {
                self.receiver.next()?
            } else {
                match self.receiver.recv_timeout(timeout) {
                    Ok(Some(response)) => Ok(response),
                    Ok(None) => return None,
                    Err(DriverError::Timeout { timeout, .. }) => {
                        Err(DriverError::Timeout { id: self.id, timeout })
                    }
                    Err(e) => Err(e),
                }
            };

            let accepted = match received {
                Ok(Response::ResultSet { columns, frame, .. }) => {
                    self.columns = Some(columns);
                    self.accept(&frame)
                }
                Ok(Response::Frame(frame)) => self.accept(&frame),
                Ok(other) => Err(unexpected("execute_stream", other)),
                Err(e) => Err(e),
            };
            if let Err(e) = accepted {
                return Some(Err(e));
            }
        }
    }
}
