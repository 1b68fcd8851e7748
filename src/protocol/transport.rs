use std::io::{self, Read, Write};

use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
    decode_from_slice, encode_to_vec,
};
use log::trace;
use thiserror::Error;

use super::{RequestEnvelope, ResponseEnvelope};

/// Size of the little-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = size_of::<u64>();

/// Largest payload accepted in either direction.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u64),
    #[error("stream ended after {read} of {expected} bytes")]
    Truncated { read: usize, expected: usize },
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

fn config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Serializes a protocol message into a frame payload.
pub fn encode<E: Encode>(message: &E) -> Result<Vec<u8>, TransportError> {
    Ok(encode_to_vec(message, config())?)
}

/// Deserializes a frame payload. The whole payload must be consumed.
pub fn decode<D: Decode<()>>(payload: &[u8]) -> Result<D, TransportError> {
    let (message, read) = decode_from_slice(payload, config())?;
    if read != payload.len() {
        return Err(TransportError::Truncated {
            read,
            expected: payload.len(),
        });
    }
    Ok(message)
}

/// Length-prefixed framing over a byte stream.
///
/// Each frame is an 8 byte little-endian length followed by exactly that many payload
/// bytes. Reading and writing are split over `Read` and `Write` so either half of a
/// connection can be wrapped on its own.
pub struct ProtocolTransport<T> {
    stream: T,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T: Write> ProtocolTransport<T> {
    pub fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let len = payload.len() as u64;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }

        self.stream.write_all(&len.to_le_bytes())?;
        self.stream.write_all(payload)?;
        self.stream.flush()?;
        trace!("sent frame of {len} bytes");
        Ok(())
    }

    pub fn write_request(&mut self, envelope: &RequestEnvelope) -> Result<(), TransportError> {
        self.send(&encode(envelope)?)
    }

    pub fn write_response(&mut self, envelope: &ResponseEnvelope) -> Result<(), TransportError> {
        self.send(&encode(envelope)?)
    }
}

impl<T: Read> ProtocolTransport<T> {
    /// Blocks until a full frame is read.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary. Ending anywhere
    /// else is a [`TransportError::Truncated`].
    pub fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut header = [0_u8; LENGTH_PREFIX_SIZE];
        match self.read_full(&mut header)? {
            0 => return Ok(None),
            LENGTH_PREFIX_SIZE => {}
            read => {
                return Err(TransportError::Truncated {
                    read,
                    expected: LENGTH_PREFIX_SIZE,
                });
            }
        }

        let len = u64::from_le_bytes(header);
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut payload = vec![0_u8; len as usize];
        let read = self.read_full(&mut payload)?;
        if read != payload.len() {
            return Err(TransportError::Truncated {
                read,
                expected: payload.len(),
            });
        }

        trace!("received frame of {len} bytes");
        Ok(Some(payload))
    }

    pub fn read_request(&mut self) -> Result<Option<RequestEnvelope>, TransportError> {
        self.receive()?.map(|payload| decode(&payload)).transpose()
    }

    pub fn read_response(&mut self) -> Result<Option<ResponseEnvelope>, TransportError> {
        self.receive()?.map(|payload| decode(&payload)).transpose()
    }

    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        let mut read = 0;
        while read < buf.len() {
            match self.stream.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(read)
    }
}
