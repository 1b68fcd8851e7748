//! Reference server for the floe protocol.
//!
//! Serves statements against an in-memory [`Dataset`] and pages the results exactly the
//! way the driver expects: a first frame with the execute reply, further frames on
//! `Fetch`, and the whole result pushed as a stream on `ExecuteStream`. It is meant for
//! tests and local experiments, not as a database.
use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    row::{Column, Row, WireFrame},
    value::{CellKind, Value},
};

use super::{
    ErrorDetail, ProtocolTransport, Request, Response, ResponseEnvelope, ThreadPool,
    transport::TransportError,
};

/// Page size used when a request asks for `0` rows.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("server IO error: {0}")]
    Io(#[from] io::Error),
}

/// Rows and column descriptions of a statement's full result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

/// Source of statement results.
pub trait Dataset: Send + Sync {
    fn query(&self, sql: &str, parameters: &[Value]) -> Result<Table, ErrorDetail>;
}

/// Named tables answering `select * from <name>` (or just `<name>`).
#[derive(Debug, Default)]
pub struct MemoryDataset {
    tables: HashMap<String, Table>,
}

impl MemoryDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, table: Table) -> Self {
        self.tables.insert(name.to_lowercase(), table);
        self
    }

    /// `(id BIGINT, label TEXT)` rows numbered from `0` to `count - 1`.
    pub fn series(count: u64) -> Table {
        Table {
            columns: vec![
                Column {
                    name: "id".into(),
                    kind: CellKind::Int64,
                    nullable: false,
                },
                Column {
                    name: "label".into(),
                    kind: CellKind::Text,
                    nullable: true,
                },
            ],
            rows: (0..count)
                .map(|i| Row::new(vec![Value::Int64(i as i64), Value::Text(format!("r{i}"))]))
                .collect(),
        }
    }
}

impl Dataset for MemoryDataset {
    fn query(&self, sql: &str, _parameters: &[Value]) -> Result<Table, ErrorDetail> {
        let sql = sql.trim().trim_end_matches(';').to_lowercase();
        let parts: Vec<&str> = sql.split_whitespace().collect();

        let name = match parts.as_slice() {
            [name] => *name,
            ["select", "*", "from", name] => *name,
            [] => return Err(ErrorDetail::new(1, "empty statement").with_sql_state("42000")),
            _ => {
                return Err(ErrorDetail::new(1, format!("unsupported statement '{sql}'"))
                    .with_sql_state("42000"));
            }
        };

        self.tables.get(name).cloned().ok_or_else(|| {
            ErrorDetail::new(2, format!("unknown table '{name}'")).with_sql_state("42S02")
        })
    }
}

pub struct ResultServer {
    address: SocketAddr,
    dataset: Arc<dyn Dataset>,
    pool: ThreadPool,
}

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

impl ResultServer {
    pub fn new(
        address: SocketAddr,
        dataset: Arc<dyn Dataset>,
        workers: usize,
    ) -> Result<Self, ServerError> {
        Ok(Self {
            address,
            dataset,
            pool: ThreadPool::new(workers)?,
        })
    }

    pub fn listen(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.address)?;
        self.serve(listener)
    }

    /// Accepts connections on an already bound listener until it fails.
    pub fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        info!("listening at {}", listener.local_addr()?);

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let dataset = Arc::clone(&self.dataset);
                    self.pool.execute(move || {
                        if let Err(e) = handle_connection(stream, dataset) {
                            warn!("connection ended with error: {e}");
                        }
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

struct Statement {
    sql: String,
    result: Option<Table>,
}

#[derive(Default)]
struct Connection {
    statements: HashMap<u64, Statement>,
    next_statement: u64,
}

impl Connection {
    fn prepare(&mut self, sql: String) -> u64 {
        self.next_statement += 1;
        self.statements
            .insert(self.next_statement, Statement { sql, result: None });
        self.next_statement
    }

    fn execute(
        &mut self,
        dataset: &dyn Dataset,
        statement_id: u64,
        parameters: &[Value],
        fetch_size: u32,
        max_rows: u64,
    ) -> Result<Response, ErrorDetail> {
        let statement = self
            .statements
            .get_mut(&statement_id)
            .ok_or_else(|| unknown(statement_id))?;
        let mut table = dataset.query(&statement.sql, parameters)?;
        if max_rows > 0 && table.rows.len() as u64 > max_rows {
            table.rows.truncate(max_rows as usize);
        }

        let frame = page(&table, 0, fetch_size);
        let columns = table.columns.clone();
        statement.result = Some(table);

        Ok(Response::ResultSet {
            statement_id,
            columns,
            frame,
        })
    }

    fn fetch(
        &self,
        statement_id: u64,
        offset: u64,
        fetch_size: u32,
    ) -> Result<Response, ErrorDetail> {
        let statement = self
            .statements
            .get(&statement_id)
            .ok_or_else(|| unknown(statement_id))?;
        let table = statement.result.as_ref().ok_or_else(|| {
            ErrorDetail::new(4, format!("statement {statement_id} has no open result"))
                .with_sql_state("24000")
        })?;
        Ok(Response::Frame(page(table, offset, fetch_size)))
    }
}

fn unknown(statement_id: u64) -> ErrorDetail {
    ErrorDetail::new(3, format!("unknown statement {statement_id}")).with_sql_state("HY010")
}

/// Cuts one page out of a full result.
fn page(table: &Table, offset: u64, fetch_size: u32) -> WireFrame {
    let size = match fetch_size {
        0 => DEFAULT_PAGE_SIZE,
        size => size,
    } as usize;
    let total = table.rows.len();
    let start = (offset as usize).min(total);
    let end = start.saturating_add(size).min(total);

    WireFrame {
        offset: start as u64,
        is_last: end >= total,
        rows: table.rows[start..end].iter().map(Row::to_wire).collect(),
    }
}

fn handle_connection(stream: TcpStream, dataset: Arc<dyn Dataset>) -> Result<(), ServerError> {
    let peer = stream.peer_addr()?;
    let mut transport = ProtocolTransport::new(stream);
    let mut connection = Connection::default();

    while let Some(envelope) = transport.read_request()? {
        let id = envelope.id;
        debug!("{peer}: received {} request {id}", envelope.request.name());

        let reply = |transport: &mut ProtocolTransport<TcpStream>,
                     last: bool,
                     result: Result<Response, ErrorDetail>| {
            let response = match result {
                Ok(response) => response,
                Err(detail) => Response::Err(detail),
            };
            transport.write_response(&ResponseEnvelope { id, last, response })
        };

        match envelope.request {
            Request::CloseConnection => {
                reply(&mut transport, true, Ok(Response::Ok))?;
                return Ok(());
            }
            Request::OpenConnection { user, .. } => {
                let connection_id = CONNECTION_IDS.fetch_add(1, Ordering::Relaxed);
                info!("{peer}: '{user}' opened connection {connection_id}");
                reply(&mut transport, true, Ok(Response::Connected { connection_id }))?;
            }
            Request::Prepare { sql } => {
                let result = dataset.query(&sql, &[]).map(|table| {
                    let statement_id = connection.prepare(sql);
                    Response::Prepared {
                        statement_id,
                        columns: table.columns,
                    }
                });
                reply(&mut transport, true, result)?;
            }
            Request::Execute {
                statement_id,
                parameters,
                fetch_size,
                max_rows,
            } => {
                let parameters = parameters
                    .iter()
                    .map(Value::try_from)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ErrorDetail::new(5, format!("bad parameter: {e}")));
                let result = parameters.and_then(|parameters| {
                    connection.execute(
                        dataset.as_ref(),
                        statement_id,
                        &parameters,
                        fetch_size,
                        max_rows,
                    )
                });
                reply(&mut transport, true, result)?;
            }
            Request::PrepareAndExecute {
                sql,
                fetch_size,
                max_rows,
            } => {
                let statement_id = connection.prepare(sql);
                let result =
                    connection.execute(dataset.as_ref(), statement_id, &[], fetch_size, max_rows);
                if result.is_err() {
                    connection.statements.remove(&statement_id);
                }
                reply(&mut transport, true, result)?;
            }
            Request::Fetch {
                statement_id,
                offset,
                fetch_size,
            } => {
                let result = connection.fetch(statement_id, offset, fetch_size);
                reply(&mut transport, true, result)?;
            }
            Request::ExecuteStream { sql, fetch_size } => {
                let statement_id = connection.prepare(sql);
                match connection.execute(dataset.as_ref(), statement_id, &[], fetch_size, 0) {
                    Ok(Response::ResultSet {
                        statement_id,
                        columns,
                        frame,
                    }) => {
                        let mut offset = frame.offset + frame.rows.len() as u64;
                        let mut last = frame.is_last;
                        reply(
                            &mut transport,
                            last,
                            Ok(Response::ResultSet {
                                statement_id,
                                columns,
                                frame,
                            }),
                        )?;
                        while !last {
                            let frame = match connection.fetch(statement_id, offset, fetch_size) {
                                Ok(Response::Frame(frame)) => frame,
                                _ => break,
                            };
                            offset = frame.offset + frame.rows.len() as u64;
                            last = frame.is_last;
                            reply(&mut transport, last, Ok(Response::Frame(frame)))?;
                        }
                    }
                    other => reply(&mut transport, true, other)?,
                }
                connection.statements.remove(&statement_id);
            }
            Request::CloseResult { statement_id } => {
                if let Some(statement) = connection.statements.get_mut(&statement_id) {
                    statement.result = None;
                }
                reply(&mut transport, true, Ok(Response::Ok))?;
            }
            Request::CloseStatement { statement_id } => {
                connection.statements.remove(&statement_id);
                reply(&mut transport, true, Ok(Response::Ok))?;
            }
            Request::Commit | Request::Rollback => {
                reply(&mut transport, true, Ok(Response::Ok))?;
            }
            Request::Ping => reply(&mut transport, true, Ok(Response::Pong))?,
        }
    }

    debug!("{peer}: connection closed");
    Ok(())
}
