//! Codec module - the pluggable object serializer.
//!
//! The invocation engine only needs four operations from a serializer:
//! arguments in and out, return values in and out. Anything implementing
//! [`Serializer`] can be plugged into a service or a proxy.
//!
//! - [`MsgPackSerializer`] - MessagePack using `rmp-serde` (struct-as-map)
//! - [`JsonSerializer`] - JSON using `serde_json`
//!
//! # Design
//!
//! The trait is generic over the value types, so it is not object safe. A
//! serializer is chosen statically when a service or proxy is built and
//! captured in the per-method closures; the dispatcher itself only ever
//! sees bytes.
//!
//! # Example
//!
//! ```
//! use remotewire::codec::{MsgPackSerializer, Serializer};
//!
//! let codec = MsgPackSerializer;
//! let bytes = codec.serialize_args(&(7i64, "seven")).unwrap();
//! let (n, s): (i64, String) = codec.deserialize_args(&bytes).unwrap();
//! assert_eq!((n, s.as_str()), (7, "seven"));
//! ```

mod json;
mod msgpack;

pub use json::JsonSerializer;
pub use msgpack::MsgPackSerializer;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Converts argument lists and return values to and from wire bytes.
///
/// Implementations must not panic on bad input: every failure is reported
/// through the returned `Result`, because the engine maps each stage to a
/// distinct error frame.
pub trait Serializer: Clone + Send + Sync + 'static {
    /// Name advertised in the `remote.serializer` endpoint property.
    fn name(&self) -> &'static str;

    /// Encode an argument tuple.
    fn serialize_args<A: Serialize + ?Sized>(&self, args: &A) -> Result<Vec<u8>>;

    /// Decode an argument tuple.
    fn deserialize_args<A: DeserializeOwned>(&self, bytes: &[u8]) -> Result<A>;

    /// Encode a return value (or a failure).
    fn serialize_return<R: Serialize + ?Sized>(&self, value: &R) -> Result<Vec<u8>>;

    /// Decode a return value (or a failure).
    fn deserialize_return<R: DeserializeOwned>(&self, bytes: &[u8]) -> Result<R>;
}
