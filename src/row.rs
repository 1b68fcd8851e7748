//! Result rows and pages.
//!
//! The server ships pages of rows as [`WireFrame`]s. The session materializes every wire
//! row into a [`Row`] of typed [`Value`]s before handing the resulting [`Frame`] to a
//! scroller, so scrollers never see raw bytes.
use std::{fmt, ops::Index};

use bincode::{Decode, Encode};

use crate::{
    error::DriverError,
    value::{CellKind, Value, WireCell},
};

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: CellKind,
    pub nullable: bool,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct WireRow(pub Vec<WireCell>);

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct WireFrame {
    pub offset: u64,
    pub is_last: bool,
    pub rows: Vec<WireRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row(Vec<Value>);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn get(&self, column: usize) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub fn to_wire(&self) -> WireRow {
        WireRow(self.0.iter().map(Value::to_wire).collect())
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, column: usize) -> &Self::Output {
        &self.0[column]
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

/// One page of a statement's result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    /// Absolute position of the first row within the whole result.
    pub offset: u64,
    pub is_last: bool,
    pub rows: Vec<Row>,
}

impl Frame {
    pub fn new(offset: u64, is_last: bool, rows: Vec<Row>) -> Self {
        Self {
            offset,
            is_last,
            rows,
        }
    }

    /// Materializes every row of a wire frame. `arity` is the statement's column count.
    pub fn materialize(frame: &WireFrame, arity: usize) -> Result<Self, DriverError> {
        let rows = frame
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| materialize(frame.offset + i as u64, row, arity))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            offset: frame.offset,
            is_last: frame.is_last,
            rows,
        })
    }
}

/// Converts a single wire row into a [`Row`].
///
/// `row_index` is only used to locate the failure in a [`DriverError::DataFormat`].
pub fn materialize(row_index: u64, row: &WireRow, arity: usize) -> Result<Row, DriverError> {
    if row.0.len() != arity {
        return Err(DriverError::DataFormat {
            row: row_index,
            column: row.0.len().min(arity),
            reason: format!("expected {arity} cells, found {}", row.0.len()),
        });
    }

    row.0
        .iter()
        .enumerate()
        .map(|(column, cell)| {
            Value::try_from(cell).map_err(|reason| DriverError::DataFormat {
                row: row_index,
                column,
                reason,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Row)
}
