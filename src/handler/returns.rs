//! Return shapes and their erased, byte-level form.
//!
//! A method's return shape is fixed when it is registered. After the method
//! body runs, its value is converted into a [`Returned`], which the invoker
//! knows how to turn into response frames without knowing any types.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::codec::Serializer;
use crate::error::ServiceError;
use crate::protocol::Command;

/// Declared return shape of a method, checked in this priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// [`Promise`](crate::promise::Promise): respond from its completion callback.
    Promise,
    /// Lazy push stream: respond with a stream key, then stream under credit.
    Stream,
    /// Async computation: respond when it finishes.
    Chained,
    /// [`Deferred`](crate::promise::Deferred): shape recognized when the method returns.
    Future,
    /// Plain value: respond as soon as the method returns.
    Direct,
}

/// Final outcome of a call, already serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Serialized return value.
    Value(Bytes),
    /// The return value could not be serialized.
    ReturnSerialization(String),
    /// Serialized [`ServiceError`].
    Failure(Bytes),
    /// The failure could not be serialized.
    FailureSerialization(String),
    /// The method body panicked.
    Panic(String),
}

impl Outcome {
    /// Serialize a successful result.
    pub fn value<S: Serializer, R: Serialize + ?Sized>(serializer: &S, value: &R) -> Self {
        match serializer.serialize_return(value) {
            Ok(bytes) => Outcome::Value(Bytes::from(bytes)),
            Err(e) => Outcome::ReturnSerialization(e.to_string()),
        }
    }

    /// Serialize an application failure.
    pub fn failure<S: Serializer>(serializer: &S, error: &ServiceError) -> Self {
        match serializer.serialize_return(error) {
            Ok(bytes) => Outcome::Failure(Bytes::from(bytes)),
            Err(e) => Outcome::FailureSerialization(e.to_string()),
        }
    }

    /// Serialize either side of a method result.
    pub fn from_result<S: Serializer, R: Serialize>(
        serializer: &S,
        result: &Result<R, ServiceError>,
    ) -> Self {
        match result {
            Ok(value) => Self::value(serializer, value),
            Err(error) => Self::failure(serializer, error),
        }
    }

    /// Response command and payload for this outcome.
    pub fn into_response(self) -> (Command, ResponseBody) {
        match self {
            Outcome::Value(b) => (Command::Success, ResponseBody::Bytes(b)),
            Outcome::Failure(b) => (Command::Failure, ResponseBody::Bytes(b)),
            Outcome::ReturnSerialization(m) => {
                (Command::ReturnSerializationError, ResponseBody::Message(m))
            }
            Outcome::FailureSerialization(m) => {
                (Command::FailureSerializationError, ResponseBody::Message(m))
            }
            Outcome::Panic(m) => (Command::UnknownError, ResponseBody::Message(m)),
        }
    }
}

/// Payload of a response frame before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Serializer output.
    Bytes(Bytes),
    /// Error-class message (truncated on encode).
    Message(String),
}

/// Callback the invoker hands to a promise-shaped return.
pub type Completion = Box<dyn FnOnce(Outcome) + Send>;

/// Encoded stream elements. `Err` ends the stream with STREAM_ERROR.
pub type ByteStream = BoxStream<'static, Result<Bytes, String>>;

/// What a method body produced, with all types erased.
pub enum Returned {
    /// Already complete.
    Ready(Outcome),
    /// Completes through a callback.
    Promise(Box<dyn FnOnce(Completion) + Send>),
    /// Completes when the future finishes.
    Chained(BoxFuture<'static, Outcome>),
    /// Must be waited on by a worker, at most the given duration.
    Blocking(Box<dyn FnOnce(Duration) -> Outcome + Send>),
    /// Stream of encoded elements.
    Stream(ByteStream),
}

impl Returned {
    /// Shape actually produced, for logging.
    pub fn shape(&self) -> ReturnShape {
        match self {
            Returned::Ready(_) => ReturnShape::Direct,
            Returned::Promise(_) => ReturnShape::Promise,
            Returned::Chained(_) => ReturnShape::Chained,
            Returned::Blocking(_) => ReturnShape::Future,
            Returned::Stream(_) => ReturnShape::Stream,
        }
    }
}

impl fmt::Debug for Returned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Returned::Ready(o) => f.debug_tuple("Ready").field(o).finish(),
            other => write!(f, "{:?}", other.shape()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackSerializer;
    use serde::ser::Error as _;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("refused"))
        }
    }

    #[test]
    fn test_outcome_commands() {
        let codec = MsgPackSerializer;

        let (cmd, body) = Outcome::value(&codec, &30i64).into_response();
        assert_eq!(cmd, Command::Success);
        assert_eq!(body, ResponseBody::Bytes(Bytes::from(vec![30u8])));

        let (cmd, _) = Outcome::value(&codec, &Unserializable).into_response();
        assert_eq!(cmd, Command::ReturnSerializationError);

        let err: Result<i64, _> = Err(ServiceError::new("no"));
        let (cmd, _) = Outcome::from_result(&codec, &err).into_response();
        assert_eq!(cmd, Command::Failure);

        let (cmd, body) = Outcome::Panic("boom".into()).into_response();
        assert_eq!(cmd, Command::UnknownError);
        assert_eq!(body, ResponseBody::Message("boom".into()));
    }
}
