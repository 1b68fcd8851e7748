//! Client-server communication protocol.
//!
//! This module defines the wire protocol spoken between the floe driver and a database
//! server, and the runtime that lets many requests share one connection.
//!
//! # Binary Format
//!
//! Every message on the stream is a frame:
//!
//! - an 8 byte little-endian unsigned length `L`,
//! - followed by exactly `L` payload bytes.
//!
//! The payload is a `bincode` encoding (little-endian, fixed-width integers) of a
//! [`RequestEnvelope`] or [`ResponseEnvelope`]. Envelopes carry a request `id` chosen by
//! the client; responses echo it and set `last` on the final message for that id.
//!
//! # Key Components
//!
//! - [`ProtocolTransport`]: framing over any `Read`/`Write` stream.
//! - [`Dispatcher`]: id allocation, pending-call table and the background reader that
//!   routes responses back to their callers.
//! - [`ResultServer`]: a reference server over an in-memory [`Dataset`].
//!
//! # See Also
//!
//! - [`session`](crate::session): typed calls built on the dispatcher.
mod dispatcher;
mod request;
mod response;
mod server;
mod thread;
mod transport;

use thread::ThreadPool;

pub use dispatcher::{ChannelSink, Dispatcher, ResponseSink, ShutdownHook, StreamReceiver, channel};
pub use request::{Request, RequestEnvelope};
pub use response::{ErrorDetail, Response, ResponseEnvelope};
pub use server::{DEFAULT_PAGE_SIZE, Dataset, MemoryDataset, ResultServer, ServerError, Table};
pub use transport::{
    LENGTH_PREFIX_SIZE, MAX_FRAME_LEN, ProtocolTransport, TransportError, decode, encode,
};
