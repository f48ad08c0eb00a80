//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use remotewire::protocol::{Command, Frame, Header};
//! use bytes::Bytes;
//! use uuid::Uuid;
//!
//! let header = Header::new(Command::Success, Uuid::nil(), 42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.call_id(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;
use uuid::Uuid;

use super::wire_format::{CacheKey, Command, Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Create a frame for `command`, deriving the payload length.
    pub fn message(command: Command, key: CacheKey, payload: Bytes) -> Self {
        let header = Header::new(command, key.service_id, key.call_id, payload.len() as u32);
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the command.
    #[inline]
    pub fn command(&self) -> Command {
        self.header.command
    }

    /// Get the service id.
    #[inline]
    pub fn service_id(&self) -> Uuid {
        self.header.service_id
    }

    /// Get the call id.
    #[inline]
    pub fn call_id(&self) -> i32 {
        self.header.call_id
    }

    /// Get the `(service_id, call_id)` key.
    #[inline]
    pub fn key(&self) -> CacheKey {
        self.header.key()
    }

    /// Check if this is a request.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.header.is_request()
    }

    /// Encode the full frame into a contiguous buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_frame(&self.header, &self.payload)
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use remotewire::protocol::{build_frame, Command, Header, HEADER_SIZE};
/// use uuid::Uuid;
///
/// let header = Header::new(Command::Success, Uuid::nil(), 42, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
