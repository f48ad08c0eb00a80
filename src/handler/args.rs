//! Server-side argument binding.
//!
//! Arguments arrive as one serialized tuple. Plain parameters deserialize
//! directly. Async-typed parameters ([`Promise`], [`Deferred`]) travel as an
//! [`AsyncArg`]: either the value inlined by the caller (fast path) or a
//! `Pending` marker, in which case a placeholder promise is handed to the
//! method and an [`ArgResolver`] waits for the ASYNC_PARAM_* frame carrying
//! that parameter index.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::Serializer;
use crate::error::{RemoteError, ServiceError};
use crate::promise::{Deferred, Promise, Resolver};

/// Declared shape of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamShape {
    /// Deserialized in place.
    Value,
    /// [`Promise`] parameter.
    Promise,
    /// [`Deferred`] parameter.
    Future,
}

impl ParamShape {
    /// True for parameters that may need an [`ArgResolver`].
    pub fn is_async(self) -> bool {
        !matches!(self, ParamShape::Value)
    }
}

/// Wire form of an async-typed argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AsyncArg<T> {
    /// Value follows in an ASYNC_PARAM_* frame.
    Pending,
    /// Already resolved by the caller.
    Resolved(T),
    /// Already failed on the caller side.
    Failed(ServiceError),
}

/// Completion delivered to an [`ArgResolver`].
#[derive(Debug)]
pub enum ArgCompletion {
    /// ASYNC_PARAM_DATA payload (after the index byte).
    Data(Bytes),
    /// ASYNC_PARAM_FAILURE payload (after the index byte).
    Failure(Bytes),
    /// The call ended, timed out or was cancelled first.
    Abort(RemoteError),
}

type ResolveFn = Box<dyn FnOnce(ArgCompletion) -> Result<(), String> + Send + Sync>;

/// Pending resolution of one async-typed argument.
pub struct ArgResolver {
    resolve: ResolveFn,
}

impl ArgResolver {
    /// Build a resolver for a placeholder promise.
    pub fn for_promise<T, S>(resolver: Resolver<T>, serializer: S) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        S: Serializer,
    {
        let resolve = move |completion: ArgCompletion| match completion {
            ArgCompletion::Data(bytes) => match serializer.deserialize_args::<T>(&bytes) {
                Ok(value) => {
                    resolver.resolve(value);
                    Ok(())
                }
                Err(e) => {
                    let message = format!("Failed to decode async argument: {}", e);
                    resolver.fail(RemoteError::AsyncParam(message.clone()));
                    Err(message)
                }
            },
            ArgCompletion::Failure(bytes) => {
                match serializer.deserialize_return::<ServiceError>(&bytes) {
                    Ok(error) => {
                        resolver.fail(RemoteError::Failure(error));
                        Ok(())
                    }
                    Err(e) => {
                        let message = format!("Failed to decode async argument failure: {}", e);
                        resolver.fail(RemoteError::AsyncParam(message.clone()));
                        Err(message)
                    }
                }
            }
            ArgCompletion::Abort(error) => {
                resolver.fail(error);
                Ok(())
            }
        };
        Self {
            resolve: Box::new(resolve),
        }
    }

    /// Deliver the completion. `Err` carries an ASYNC_PARAM_ERROR message.
    pub fn complete(self, completion: ArgCompletion) -> Result<(), String> {
        (self.resolve)(completion)
    }
}

impl fmt::Debug for ArgResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgResolver").finish_non_exhaustive()
    }
}

/// Collects the resolvers registered while binding one call's arguments.
#[derive(Debug, Default)]
pub struct ArgBinder {
    resolvers: Vec<Option<ArgResolver>>,
}

impl ArgBinder {
    /// Create an empty binder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver for parameter `index`.
    pub fn register(&mut self, index: u8, resolver: ArgResolver) {
        let index = usize::from(index);
        if self.resolvers.len() <= index {
            self.resolvers.resize_with(index + 1, || None);
        }
        self.resolvers[index] = Some(resolver);
    }

    /// Number of resolvers waiting for a frame.
    pub fn pending(&self) -> usize {
        self.resolvers.iter().filter(|r| r.is_some()).count()
    }

    /// Resolvers indexed by parameter position.
    pub fn into_resolvers(self) -> Vec<Option<ArgResolver>> {
        self.resolvers
    }
}

/// A parameter type a service method may declare.
///
/// Implemented for every deserializable type and for the async handles.
/// The async handles are deliberately not `Deserialize`, which keeps these
/// impls from overlapping.
pub trait Param: Sized + Send + 'static {
    /// What travels in the argument tuple.
    type Wire: DeserializeOwned + Send + 'static;

    /// Declared shape.
    const SHAPE: ParamShape;

    /// Turn the wire value into the method's argument.
    fn bind<S: Serializer>(wire: Self::Wire, index: u8, binder: &mut ArgBinder, serializer: &S)
        -> Self;
}

impl<T: DeserializeOwned + Send + 'static> Param for T {
    type Wire = T;
    const SHAPE: ParamShape = ParamShape::Value;

    fn bind<S: Serializer>(wire: T, _index: u8, _binder: &mut ArgBinder, _serializer: &S) -> T {
        wire
    }
}

fn bind_promise<T, S>(
    wire: AsyncArg<T>,
    index: u8,
    binder: &mut ArgBinder,
    serializer: &S,
) -> Promise<T>
where
    T: DeserializeOwned + Send + 'static,
    S: Serializer,
{
    match wire {
        AsyncArg::Resolved(value) => Promise::resolved(value),
        AsyncArg::Failed(error) => Promise::failed(RemoteError::Failure(error)),
        AsyncArg::Pending => {
            let (promise, resolver) = Promise::pending();
            binder.register(index, ArgResolver::for_promise(resolver, serializer.clone()));
            promise
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> Param for Promise<T> {
    type Wire = AsyncArg<T>;
    const SHAPE: ParamShape = ParamShape::Promise;

    fn bind<S: Serializer>(
        wire: AsyncArg<T>,
        index: u8,
        binder: &mut ArgBinder,
        serializer: &S,
    ) -> Self {
        bind_promise(wire, index, binder, serializer)
    }
}

impl<T: DeserializeOwned + Send + 'static> Param for Deferred<T> {
    type Wire = AsyncArg<T>;
    const SHAPE: ParamShape = ParamShape::Future;

    fn bind<S: Serializer>(
        wire: AsyncArg<T>,
        index: u8,
        binder: &mut ArgBinder,
        serializer: &S,
    ) -> Self {
        Deferred::Promise(bind_promise(wire, index, binder, serializer))
    }
}

/// The full argument list of a method: a tuple of [`Param`]s.
pub trait ServiceArgs: Sized + Send + 'static {
    /// Tuple of wire values.
    type Wire: DeserializeOwned + Send + 'static;

    /// Shape of each parameter, in order.
    fn shapes() -> Vec<ParamShape>;

    /// Bind every parameter.
    fn bind<S: Serializer>(wire: Self::Wire, binder: &mut ArgBinder, serializer: &S) -> Self;
}

impl ServiceArgs for () {
    type Wire = ();

    fn shapes() -> Vec<ParamShape> {
        Vec::new()
    }

    fn bind<S: Serializer>(_wire: (), _binder: &mut ArgBinder, _serializer: &S) -> Self {}
}

macro_rules! service_args {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: Param),+> ServiceArgs for ($($name,)+) {
            type Wire = ($($name::Wire,)+);

            fn shapes() -> Vec<ParamShape> {
                vec![$($name::SHAPE),+]
            }

            fn bind<S: Serializer>(wire: Self::Wire, binder: &mut ArgBinder, serializer: &S) -> Self {
                ($($name::bind(wire.$index, $index, binder, serializer),)+)
            }
        }
    };
}

service_args!(A: 0);
service_args!(A: 0, B: 1);
service_args!(A: 0, B: 1, C: 2);
service_args!(A: 0, B: 1, C: 2, D: 3);
service_args!(A: 0, B: 1, C: 2, D: 3, E: 4);
service_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
service_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
service_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackSerializer;

    type Coprime = (i64, i64, Promise<bool>);

    fn bind(bytes: &[u8]) -> (Coprime, ArgBinder) {
        let codec = MsgPackSerializer;
        let wire: <Coprime as ServiceArgs>::Wire = codec.deserialize_args(bytes).unwrap();
        let mut binder = ArgBinder::new();
        let args = Coprime::bind(wire, &mut binder, &codec);
        (args, binder)
    }

    #[test]
    fn test_shapes() {
        assert_eq!(
            Coprime::shapes(),
            vec![ParamShape::Value, ParamShape::Value, ParamShape::Promise]
        );
        assert_eq!(<(Deferred<u8>,)>::shapes(), vec![ParamShape::Future]);
        assert!(<()>::shapes().is_empty());
    }

    #[test]
    fn test_fast_path_registers_nothing() {
        let codec = MsgPackSerializer;
        let bytes = codec
            .serialize_args(&(7i64, 42i64, AsyncArg::Resolved(true)))
            .unwrap();

        let ((a, b, flag), binder) = bind(&bytes);
        assert_eq!((a, b), (7, 42));
        assert_eq!(flag.try_result(), Some(Ok(true)));
        assert_eq!(binder.pending(), 0);
    }

    #[test]
    fn test_pending_arg_resolved_later() {
        let codec = MsgPackSerializer;
        let bytes = codec
            .serialize_args(&(7i64, 42i64, AsyncArg::<bool>::Pending))
            .unwrap();

        let ((_, _, flag), binder) = bind(&bytes);
        assert!(!flag.is_done());
        assert_eq!(binder.pending(), 1);

        let mut resolvers = binder.into_resolvers();
        assert!(resolvers[0].is_none());
        let resolver = resolvers[2].take().unwrap();

        let data = Bytes::from(codec.serialize_args(&true).unwrap());
        resolver.complete(ArgCompletion::Data(data)).unwrap();
        assert_eq!(flag.try_result(), Some(Ok(true)));
    }

    #[test]
    fn test_bad_async_data_reports_error() {
        let codec = MsgPackSerializer;
        let (promise, resolver) = Promise::<bool>::pending();
        let resolver = ArgResolver::for_promise(resolver, codec);

        let result = resolver.complete(ArgCompletion::Data(Bytes::from_static(b"\xc1")));
        assert!(result.is_err());
        assert!(matches!(
            promise.try_result(),
            Some(Err(RemoteError::AsyncParam(_)))
        ));
    }

    #[test]
    fn test_failed_arg_and_abort() {
        let codec = MsgPackSerializer;
        let bytes = codec
            .serialize_args(&(1i64, 2i64, AsyncArg::<bool>::Failed(ServiceError::new("x"))))
            .unwrap();
        let ((_, _, flag), _) = bind(&bytes);
        assert_eq!(
            flag.try_result(),
            Some(Err(RemoteError::Failure(ServiceError::new("x"))))
        );

        let (promise, resolver) = Promise::<bool>::pending();
        ArgResolver::for_promise(resolver, codec)
            .complete(ArgCompletion::Abort(RemoteError::ResolvedTooLate))
            .unwrap();
        assert_eq!(promise.try_result(), Some(Err(RemoteError::ResolvedTooLate)));
    }
}
