use bincode::{Decode, Encode};

use crate::row::{Column, WireFrame};

/// Server to client message. Every response travels inside a [`ResponseEnvelope`].
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Response {
    Ok,
    Pong,
    Connected {
        connection_id: u64,
    },
    Prepared {
        statement_id: u64,
        columns: Vec<Column>,
    },
    /// First page of an executed statement.
    ResultSet {
        statement_id: u64,
        columns: Vec<Column>,
        frame: WireFrame,
    },
    Frame(WireFrame),
    Err(ErrorDetail),
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: i32,
    pub message: String,
    pub sql_state: Option<String>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub id: u64,
    /// Marks the final message for `id`. Unary replies always set it.
    pub last: bool,
    pub response: Response,
}

impl ErrorDetail {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            sql_state: None,
        }
    }

    pub fn with_sql_state(mut self, state: impl Into<String>) -> Self {
        self.sql_state = Some(state.into());
        self
    }
}
