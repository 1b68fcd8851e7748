pub mod config;
pub mod error;
pub mod protocol;
pub mod row;
pub mod scroller;
pub mod session;
pub mod value;

pub use config::{ConnectionConfig, ResultConfig, ScrollMode};
pub use error::DriverError;
pub use row::{Column, Frame, Row};
pub use scroller::{ResultSource, Scroller};
pub use session::{PreparedStatement, QueryResult, RowStream, Session};
pub use value::Value;
