//! Error types for remotewire.
//!
//! Two layers:
//! - [`Error`]: transport and protocol failures inside this process.
//! - [`RemoteError`]: the outcome a caller sees when a remote call does not
//!   produce a value. [`ServiceError`] is the serializable application
//!   failure carried inside FAILURE frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for transport and protocol operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Frame could not be decoded (bad version, bad length).
    #[error("Corrupted frame: {0}")]
    CorruptedFrame(String),

    /// Protocol error (unexpected command, malformed payload, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command byte is not part of the alphabet.
    #[error("Unknown command: {0}")]
    UnknownCommand(u8),

    /// Endpoint description is missing or has a malformed property.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Operation attempted on a closed registration.
    #[error("Registration closed")]
    RegistrationClosed,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound payload is larger than the connection accepts.
    #[error("Payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Configured limit.
        max: u32,
    },

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Application failure raised by a service method.
///
/// This is what travels in FAILURE and ASYNC_PARAM_FAILURE payloads, so it
/// must stay serializable by every [`Serializer`](crate::codec::Serializer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    /// Short classification, e.g. `illegal_argument` or `timeout`.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

impl ServiceError {
    /// Kind used when no classification is given.
    pub const GENERIC: &'static str = "service";

    /// Create a generic service error.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(Self::GENERIC, message)
    }

    /// Create a service error with an explicit kind.
    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<RemoteError> for ServiceError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Failure(e) => e,
            other => ServiceError::with_kind(other.kind(), other.to_string()),
        }
    }
}

/// Outcome of a remote call that did not yield a value.
///
/// Variants map one-to-one onto the failure stages a caller can observe, so
/// a caller can tell whether the target method ever ran.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// No service is exported under the requested id.
    #[error("No service: {0}")]
    NoService(String),

    /// Method index out of range for the service.
    #[error("No method: {0}")]
    NoMethod(String),

    /// Worker pool saturated; the call never ran.
    #[error("Server overloaded: {0}")]
    ServerOverloaded(String),

    /// Server failed to decode the arguments; the call never ran.
    #[error("Failed to deserialize arguments: {0}")]
    ArgsSerialization(String),

    /// The call ran but its return value could not be serialized.
    #[error("Failed to serialize return value: {0}")]
    ReturnSerialization(String),

    /// The call failed and its failure could not be serialized.
    #[error("Failed to serialize failure: {0}")]
    FailureSerialization(String),

    /// Local serializer failed on this side of the wire.
    #[error("Local serialization error: {0}")]
    LocalSerialization(String),

    /// The target method raised an application failure.
    #[error("Remote failure: {0}")]
    Failure(ServiceError),

    /// The call exceeded its timeout.
    #[error("Remote call timed out")]
    Timeout,

    /// The call was cancelled before it completed.
    #[error("Remote call cancelled")]
    Cancelled,

    /// An async argument arrived after its call had finished.
    #[error("Async argument resolved too late")]
    ResolvedTooLate,

    /// The peer could not process an async argument frame.
    #[error("Async parameter error: {0}")]
    AsyncParam(String),

    /// A stream ended abnormally.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Unclassified remote error.
    #[error("Unknown remote error: {0}")]
    Unknown(String),

    /// Connection lost or write failed.
    #[error("Remote communication error: {0}")]
    Communication(String),
}

impl RemoteError {
    /// Stable short name of the variant, used as [`ServiceError::kind`].
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteError::NoService(_) => "no_service",
            RemoteError::NoMethod(_) => "no_method",
            RemoteError::ServerOverloaded(_) => "server_overloaded",
            RemoteError::ArgsSerialization(_) => "args_serialization",
            RemoteError::ReturnSerialization(_) => "return_serialization",
            RemoteError::FailureSerialization(_) => "failure_serialization",
            RemoteError::LocalSerialization(_) => "local_serialization",
            RemoteError::Failure(_) => "failure",
            RemoteError::Timeout => "timeout",
            RemoteError::Cancelled => "cancelled",
            RemoteError::ResolvedTooLate => "resolved_too_late",
            RemoteError::AsyncParam(_) => "async_param",
            RemoteError::Stream(_) => "stream",
            RemoteError::Unknown(_) => "unknown",
            RemoteError::Communication(_) => "communication",
        }
    }

    /// True for failures caused by the transport rather than the peer.
    pub fn is_communication(&self) -> bool {
        matches!(self, RemoteError::Communication(_))
    }
}

impl From<Error> for RemoteError {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(_) | Error::ConnectionClosed | Error::BackpressureTimeout => {
                RemoteError::Communication(err.to_string())
            }
            other => RemoteError::LocalSerialization(other.to_string()),
        }
    }
}
