//! Protocol module - wire format, framing, and payload layouts.
//!
//! This module implements the binary protocol spoken on every connection:
//! - 25-byte versioned header encoding/decoding
//! - Frame buffer for reassembling length-prefixed frames
//! - Command-specific payload helpers

mod frame;
mod frame_buffer;
pub mod payload;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    CacheKey, Command, Header, ABSOLUTE_MAX_PAYLOAD_SIZE, COUNTED_HEADER_SIZE,
    DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, MAX_LENGTH, MAX_VERSION, PREFIX_SIZE, VERSION_1,
    VERSION_2,
};
