//! Typed cell values and their wire representation.
//!
//! A [`WireCell`] is what travels over the connection: a kind tag plus the raw payload.
//! Fixed-width kinds are little-endian, text is UTF-8 and arrays carry a nested list of
//! wire cells. A [`Value`] is the decoded, in-memory form handed to callers.
use std::fmt;

use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
};

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum CellKind {
    Null,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    Text,
    Bytes,
    Date,
    Time,
    Timestamp,
    Lob,
    Array,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct WireCell {
    pub kind: CellKind,
    pub data: Vec<u8>,
}

/// Reference to a large object kept on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LobHandle {
    pub id: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Decimal { unscaled: i128, scale: u32 },
    Text(String),
    Bytes(Vec<u8>),
    /// Days since the unix epoch.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    /// Microseconds since the unix epoch.
    Timestamp(i64),
    Lob(LobHandle),
    Array(Vec<Value>),
}

const DECIMAL_SIZE: usize = size_of::<i128>() + size_of::<u32>();
const LOB_SIZE: usize = size_of::<u64>() * 2;

fn nested_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N], String> {
    data.try_into()
        .map_err(|_| format!("expected {N} bytes, found {}", data.len()))
}

impl Value {
    pub fn kind(&self) -> CellKind {
        match self {
            Value::Null => CellKind::Null,
            Value::Bool(_) => CellKind::Bool,
            Value::Int8(_) => CellKind::Int8,
            Value::Int16(_) => CellKind::Int16,
            Value::Int32(_) => CellKind::Int32,
            Value::Int64(_) => CellKind::Int64,
            Value::Float32(_) => CellKind::Float32,
            Value::Float64(_) => CellKind::Float64,
            Value::Decimal { .. } => CellKind::Decimal,
            Value::Text(_) => CellKind::Text,
            Value::Bytes(_) => CellKind::Bytes,
            Value::Date(_) => CellKind::Date,
            Value::Time(_) => CellKind::Time,
            Value::Timestamp(_) => CellKind::Timestamp,
            Value::Lob(_) => CellKind::Lob,
            Value::Array(_) => CellKind::Array,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int8(v) => Some(v as i64),
            Value::Int16(v) => Some(v as i64),
            Value::Int32(v) => Some(v as i64),
            Value::Int64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Encodes the value for parameter binding.
    pub fn to_wire(&self) -> WireCell {
        let data = match self {
            Value::Null => Vec::new(),
            Value::Bool(v) => vec![u8::from(*v)],
            Value::Int8(v) => v.to_le_bytes().to_vec(),
            Value::Int16(v) => v.to_le_bytes().to_vec(),
            Value::Int32(v) | Value::Date(v) => v.to_le_bytes().to_vec(),
            Value::Int64(v) | Value::Time(v) | Value::Timestamp(v) => v.to_le_bytes().to_vec(),
            Value::Float32(v) => v.to_le_bytes().to_vec(),
            Value::Float64(v) => v.to_le_bytes().to_vec(),
            Value::Decimal { unscaled, scale } => {
                let mut out = Vec::with_capacity(DECIMAL_SIZE);
                out.extend_from_slice(&unscaled.to_le_bytes());
                out.extend_from_slice(&scale.to_le_bytes());
                out
            }
            Value::Text(s) => s.as_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
            Value::Lob(handle) => {
                let mut out = Vec::with_capacity(LOB_SIZE);
                out.extend_from_slice(&handle.id.to_le_bytes());
                out.extend_from_slice(&handle.length.to_le_bytes());
                out
            }
            Value::Array(items) => {
                let cells: Vec<WireCell> = items.iter().map(Value::to_wire).collect();
                // Vec<WireCell> always encodes into a Vec.
                bincode::encode_to_vec(cells, nested_config()).unwrap_or_default()
            }
        };

        WireCell {
            kind: self.kind(),
            data,
        }
    }
}

impl TryFrom<&WireCell> for Value {
    type Error = String;

    fn try_from(cell: &WireCell) -> Result<Self, Self::Error> {
        let data = cell.data.as_slice();
        Ok(match cell.kind {
            CellKind::Null => {
                if !data.is_empty() {
                    return Err(format!("null cell carries {} bytes", data.len()));
                }
                Value::Null
            }
            CellKind::Bool => match data {
                [0] => Value::Bool(false),
                [1] => Value::Bool(true),
                _ => return Err("invalid boolean payload".into()),
            },
            CellKind::Int8 => Value::Int8(i8::from_le_bytes(fixed(data)?)),
            CellKind::Int16 => Value::Int16(i16::from_le_bytes(fixed(data)?)),
            CellKind::Int32 => Value::Int32(i32::from_le_bytes(fixed(data)?)),
            CellKind::Int64 => Value::Int64(i64::from_le_bytes(fixed(data)?)),
            CellKind::Float32 => Value::Float32(f32::from_le_bytes(fixed(data)?)),
            CellKind::Float64 => Value::Float64(f64::from_le_bytes(fixed(data)?)),
            CellKind::Decimal => {
                let bytes: [u8; DECIMAL_SIZE] = fixed(data)?;
                let (unscaled, scale) = bytes.split_at(size_of::<i128>());
                Value::Decimal {
                    unscaled: i128::from_le_bytes(fixed(unscaled)?),
                    scale: u32::from_le_bytes(fixed(scale)?),
                }
            }
            CellKind::Text => Value::Text(
                String::from_utf8(data.to_vec()).map_err(|e| format!("invalid utf-8: {e}"))?,
            ),
            CellKind::Bytes => Value::Bytes(data.to_vec()),
            CellKind::Date => Value::Date(i32::from_le_bytes(fixed(data)?)),
            CellKind::Time => Value::Time(i64::from_le_bytes(fixed(data)?)),
            CellKind::Timestamp => Value::Timestamp(i64::from_le_bytes(fixed(data)?)),
            CellKind::Lob => {
                let bytes: [u8; LOB_SIZE] = fixed(data)?;
                let (id, length) = bytes.split_at(size_of::<u64>());
                Value::Lob(LobHandle {
                    id: u64::from_le_bytes(fixed(id)?),
                    length: u64::from_le_bytes(fixed(length)?),
                })
            }
            CellKind::Array => {
                let (cells, read): (Vec<WireCell>, usize) =
                    bincode::decode_from_slice(data, nested_config())
                        .map_err(|e| format!("invalid array payload: {e}"))?;
                if read != data.len() {
                    return Err("trailing bytes after array payload".into());
                }
                Value::Array(
                    cells
                        .iter()
                        .map(Value::try_from)
                        .collect::<Result<Vec<_>, _>>()?,
                )
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Decimal { unscaled, scale } => {
                if *scale == 0 {
                    return write!(f, "{unscaled}");
                }
                let sign = if *unscaled < 0 { "-" } else { "" };
                let digits = unscaled.unsigned_abs().to_string();
                let scale = *scale as usize;
                let digits = format!("{digits:0>width$}", width = scale + 1);
                let (int, frac) = digits.split_at(digits.len() - scale);
                write!(f, "{sign}{int}.{frac}")
            }
            Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Date(days) => write!(f, "date({days})"),
            Value::Time(micros) => write!(f, "time({micros})"),
            Value::Timestamp(micros) => write!(f, "timestamp({micros})"),
            Value::Lob(handle) => write!(f, "lob#{}[{}]", handle.id, handle.length),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}
