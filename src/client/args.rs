//! Client-side argument encoding.
//!
//! Plain arguments serialize in place. A [`Promise`] argument that is
//! already complete is inlined into the call frame (fast path). A pending
//! one travels as [`AsyncArg::Pending`] and yields a [`FollowUp`]: a future
//! producing the ASYNC_PARAM_DATA / ASYNC_PARAM_FAILURE frame body once the
//! promise completes. The proxy only sends follow-ups after the call frame
//! itself has been flushed.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tracing::warn;

use crate::codec::Serializer;
use crate::error::ServiceError;
use crate::handler::AsyncArg;
use crate::promise::Promise;
use crate::protocol::payload::encode_param;
use crate::protocol::Command;

/// Resolves to the follow-up frame of one async argument, or `None` if
/// nothing can be sent.
pub type FollowUp = BoxFuture<'static, Option<(Command, Bytes)>>;

/// An argument a proxy call accepts.
///
/// Implemented for every serializable type and for [`Promise`], which is
/// not `Serialize`, so the impls do not overlap.
pub trait ClientParam: Send + 'static {
    /// What travels in the argument tuple.
    type Wire: Serialize + Send;

    /// Produce the wire value, registering a follow-up if needed.
    fn prepare<S: Serializer>(self, index: u8, serializer: &S, followups: &mut Vec<FollowUp>) -> Self::Wire;
}

impl<T: Serialize + Send + 'static> ClientParam for T {
    type Wire = T;

    fn prepare<S: Serializer>(self, _index: u8, _serializer: &S, _followups: &mut Vec<FollowUp>) -> T {
        self
    }
}

impl<T: Serialize + Clone + Send + 'static> ClientParam for Promise<T> {
    type Wire = AsyncArg<T>;

    fn prepare<S: Serializer>(self, index: u8, serializer: &S, followups: &mut Vec<FollowUp>) -> AsyncArg<T> {
        match self.try_result() {
            Some(Ok(value)) => AsyncArg::Resolved(value),
            Some(Err(error)) => AsyncArg::Failed(ServiceError::from(error)),
            None => {
                followups.push(follow_up(self, index, serializer.clone()));
                AsyncArg::Pending
            }
        }
    }
}

fn follow_up<T, S>(promise: Promise<T>, index: u8, serializer: S) -> FollowUp
where
    T: Serialize + Clone + Send + 'static,
    S: Serializer,
{
    async move {
        let failure = match promise.value().await {
            Ok(value) => match serializer.serialize_args(&value) {
                Ok(bytes) => return Some((Command::AsyncParamData, encode_param(index, &bytes))),
                Err(e) => ServiceError::with_kind(
                    "local_serialization",
                    format!("Failed to serialize async argument: {}", e),
                ),
            },
            Err(error) => ServiceError::from(error),
        };
        match serializer.serialize_return(&failure) {
            Ok(bytes) => Some((Command::AsyncParamFailure, encode_param(index, &bytes))),
            Err(e) => {
                warn!(param = index, error = %e, "Could not serialize async argument failure");
                None
            }
        }
    }
    .boxed()
}

/// A complete argument list: a tuple of [`ClientParam`]s.
pub trait CallArgs: Send + 'static {
    /// Tuple of wire values.
    type Wire: Serialize + Send;

    /// Produce the wire tuple and collect follow-ups.
    fn prepare<S: Serializer>(self, serializer: &S, followups: &mut Vec<FollowUp>) -> Self::Wire;
}

impl CallArgs for () {
    type Wire = ();

    fn prepare<S: Serializer>(self, _serializer: &S, _followups: &mut Vec<FollowUp>) {}
}

macro_rules! call_args {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: ClientParam),+> CallArgs for ($($name,)+) {
            type Wire = ($($name::Wire,)+);

            fn prepare<S: Serializer>(self, serializer: &S, followups: &mut Vec<FollowUp>) -> Self::Wire {
                ($(self.$index.prepare($index, serializer, followups),)+)
            }
        }
    };
}

call_args!(A: 0);
call_args!(A: 0, B: 1);
call_args!(A: 0, B: 1, C: 2);
call_args!(A: 0, B: 1, C: 2, D: 3);
call_args!(A: 0, B: 1, C: 2, D: 3, E: 4);
call_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
call_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
call_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);
