use bincode::{Decode, Encode};

use crate::value::WireCell;

/// Client to server message. Every request travels inside a [`RequestEnvelope`].
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Request {
    /// Credentials and properties are passed through untouched.
    OpenConnection {
        user: String,
        password: String,
        properties: Vec<(String, String)>,
    },
    CloseConnection,
    Prepare {
        sql: String,
    },
    Execute {
        statement_id: u64,
        parameters: Vec<WireCell>,
        fetch_size: u32,
        max_rows: u64,
    },
    PrepareAndExecute {
        sql: String,
        fetch_size: u32,
        max_rows: u64,
    },
    Fetch {
        statement_id: u64,
        offset: u64,
        fetch_size: u32,
    },
    /// Asks the server to push every page of the result without further fetches.
    ExecuteStream {
        sql: String,
        fetch_size: u32,
    },
    CloseResult {
        statement_id: u64,
    },
    CloseStatement {
        statement_id: u64,
    },
    Commit,
    Rollback,
    Ping,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

impl Request {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Request::OpenConnection { .. } => "open_connection",
            Request::CloseConnection => "close_connection",
            Request::Prepare { .. } => "prepare",
            Request::Execute { .. } => "execute",
            Request::PrepareAndExecute { .. } => "prepare_and_execute",
            Request::Fetch { .. } => "fetch",
            Request::ExecuteStream { .. } => "execute_stream",
            Request::CloseResult { .. } => "close_result",
            Request::CloseStatement { .. } => "close_statement",
            Request::Commit => "commit",
            Request::Rollback => "rollback",
            Request::Ping => "ping",
        }
    }
}
