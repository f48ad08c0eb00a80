//! Service definitions: the per-method dispatch table of an exported object.
//!
//! A [`ServiceBuilder`] registers typed methods on a target object. Each
//! registration captures the serializer and produces a byte-level entry, so
//! the table built by [`ServiceBuilder::build`] is indexed by the compressed
//! method index and is never consulted reflectively. Indices are assigned
//! sequentially starting from 0.
//!
//! # Example
//!
//! ```
//! use remotewire::codec::MsgPackSerializer;
//! use remotewire::handler::ServiceBuilder;
//! use remotewire::ServiceError;
//!
//! struct Text(String);
//!
//! let definition = ServiceBuilder::new(Text("hello".into()), MsgPackSerializer)
//!     .interface("example.Text")
//!     .method("length", |t: &Text, (): ()| Ok::<_, ServiceError>(t.0.len() as i64))
//!     .build();
//!
//! assert_eq!(definition.method_table()[&0], "length");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::Stream;
use futures::{FutureExt, StreamExt};
use serde::Serialize;

use super::args::{ArgBinder, ParamShape, ServiceArgs};
use super::returns::{Outcome, ReturnShape, Returned};
use crate::codec::Serializer;
use crate::error::ServiceError;
use crate::promise::{Deferred, Promise};

/// Runs the method body; executed on a worker.
pub type Invocation = Box<dyn FnOnce() -> Returned + Send>;

/// Decodes argument bytes into a ready-to-run invocation.
pub type DecodeFn = Box<dyn Fn(&[u8], &mut ArgBinder) -> Result<Invocation, String> + Send + Sync>;

/// Entry for a registered method.
pub struct MethodEntry {
    /// Signature advertised in the method table.
    pub signature: String,
    /// Declared return shape.
    pub shape: ReturnShape,
    /// Declared parameter shapes.
    pub params: Vec<ParamShape>,
    decode: DecodeFn,
}

impl MethodEntry {
    /// Deserialize and bind arguments. `Err` means ARGS_SERIALIZATION_ERROR.
    pub fn decode(&self, args: &[u8], binder: &mut ArgBinder) -> Result<Invocation, String> {
        (self.decode)(args, binder)
    }
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry")
            .field("signature", &self.signature)
            .field("shape", &self.shape)
            .field("params", &self.params)
            .finish()
    }
}

/// Encodes a failure the engine raises itself (e.g. a server-side timeout).
type FailureFn = Box<dyn Fn(&ServiceError) -> Outcome + Send + Sync>;

/// Type-erased dispatch table of one service.
pub struct ServiceDefinition {
    interfaces: Vec<String>,
    serializer: &'static str,
    methods: Vec<MethodEntry>,
    failure: FailureFn,
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("interfaces", &self.interfaces)
            .field("serializer", &self.serializer)
            .field("methods", &self.methods)
            .finish()
    }
}

impl ServiceDefinition {
    /// Interfaces (object classes) the service implements.
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Name of the serializer the methods were built with.
    pub fn serializer(&self) -> &'static str {
        self.serializer
    }

    /// Method by compressed index.
    pub fn method(&self, index: u16) -> Option<&MethodEntry> {
        self.methods.get(usize::from(index))
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// True if no method is registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Serialize a failure with the service's serializer.
    pub fn failure(&self, error: &ServiceError) -> Outcome {
        (self.failure)(error)
    }

    /// `index → signature` table advertised in the endpoint.
    pub fn method_table(&self) -> BTreeMap<u16, String> {
        self.methods
            .iter()
            .enumerate()
            .map(|(i, m)| (i as u16, m.signature.clone()))
            .collect()
    }
}

/// Builds a [`ServiceDefinition`] around a target object.
pub struct ServiceBuilder<T, S> {
    target: Arc<T>,
    serializer: S,
    interfaces: Vec<String>,
    methods: Vec<MethodEntry>,
}

impl<T, S> ServiceBuilder<T, S>
where
    T: Send + Sync + 'static,
    S: Serializer,
{
    /// Start a service around `target`.
    pub fn new(target: T, serializer: S) -> Self {
        Self::from_arc(Arc::new(target), serializer)
    }

    /// Start a service around a shared target.
    pub fn from_arc(target: Arc<T>, serializer: S) -> Self {
        Self {
            target,
            serializer,
            interfaces: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Declare an implemented interface.
    pub fn interface(mut self, name: impl Into<String>) -> Self {
        self.interfaces.push(name.into());
        self
    }

    fn register<A, F>(mut self, signature: &str, shape: ReturnShape, invoke: F) -> Self
    where
        A: ServiceArgs,
        F: Fn(&T, A, &S) -> Returned + Send + Sync + 'static,
    {
        let target = self.target.clone();
        let serializer = self.serializer.clone();
        let invoke = Arc::new(invoke);

        let decode = move |bytes: &[u8], binder: &mut ArgBinder| -> Result<Invocation, String> {
            let wire: A::Wire = serializer
                .deserialize_args(bytes)
                .map_err(|e| e.to_string())?;
            let args = A::bind(wire, binder, &serializer);

            let target = target.clone();
            let serializer = serializer.clone();
            let invoke = invoke.clone();
            let run: Invocation = Box::new(move || invoke(&target, args, &serializer));
            Ok(run)
        };

        self.methods.push(MethodEntry {
            signature: signature.to_string(),
            shape,
            params: A::shapes(),
            decode: Box::new(decode),
        });
        self
    }

    /// Register a method returning a plain value.
    pub fn method<A, R, F>(self, signature: &str, f: F) -> Self
    where
        A: ServiceArgs,
        R: Serialize + Send + 'static,
        F: Fn(&T, A) -> Result<R, ServiceError> + Send + Sync + 'static,
    {
        self.register(signature, ReturnShape::Direct, move |target, args, s| {
            Returned::Ready(Outcome::from_result(s, &f(target, args)))
        })
    }

    /// Register a method returning a [`Promise`].
    pub fn promise_method<A, R, F>(self, signature: &str, f: F) -> Self
    where
        A: ServiceArgs,
        R: Serialize + Send + 'static,
        F: Fn(&T, A) -> Promise<R> + Send + Sync + 'static,
    {
        self.register(signature, ReturnShape::Promise, move |target, args, s| {
            promise_returned(f(target, args), s.clone())
        })
    }

    /// Register a method returning a future.
    pub fn async_method<A, R, F, Fut>(self, signature: &str, f: F) -> Self
    where
        A: ServiceArgs,
        R: Serialize + Send + 'static,
        F: Fn(&T, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ServiceError>> + Send + 'static,
    {
        self.register(signature, ReturnShape::Chained, move |target, args, s| {
            chained_returned(f(target, args), s.clone())
        })
    }

    /// Register a method returning a [`Deferred`].
    pub fn deferred_method<A, R, F>(self, signature: &str, f: F) -> Self
    where
        A: ServiceArgs,
        R: Serialize + Send + 'static,
        F: Fn(&T, A) -> Deferred<R> + Send + Sync + 'static,
    {
        self.register(signature, ReturnShape::Future, move |target, args, s| {
            let s = s.clone();
            match f(target, args) {
                Deferred::Promise(promise) => promise_returned(promise, s),
                Deferred::Future(future) => chained_returned(future, s),
                Deferred::Blocking(wait) => Returned::Blocking(Box::new(move |timeout| {
                    Outcome::from_result(&s, &wait(timeout))
                })),
            }
        })
    }

    /// Register a method returning a push stream.
    ///
    /// The stream is produced lazily under consumer credit. An `Err` item
    /// ends it with STREAM_ERROR.
    pub fn stream_method<A, R, F, St>(self, signature: &str, f: F) -> Self
    where
        A: ServiceArgs,
        R: Serialize + Send + 'static,
        F: Fn(&T, A) -> Result<St, ServiceError> + Send + Sync + 'static,
        St: Stream<Item = Result<R, ServiceError>> + Send + 'static,
    {
        self.register(signature, ReturnShape::Stream, move |target, args, s| {
            match f(target, args) {
                Err(error) => Returned::Ready(Outcome::failure(s, &error)),
                Ok(stream) => {
                    let s = s.clone();
                    Returned::Stream(
                        stream
                            .map(move |item| match item {
                                Ok(value) => s
                                    .serialize_return(&value)
                                    .map(Bytes::from)
                                    .map_err(|e| e.to_string()),
                                Err(error) => Err(error.to_string()),
                            })
                            .boxed(),
                    )
                }
            }
        })
    }

    /// Finish the table.
    pub fn build(self) -> ServiceDefinition {
        let serializer = self.serializer;
        ServiceDefinition {
            interfaces: self.interfaces,
            serializer: serializer.name(),
            methods: self.methods,
            failure: Box::new(move |error| Outcome::failure(&serializer, error)),
        }
    }
}

fn promise_returned<R, S>(promise: Promise<R>, serializer: S) -> Returned
where
    R: Serialize + Send + 'static,
    S: Serializer,
{
    Returned::Promise(Box::new(move |done| {
        promise.on_complete(move |result| {
            let outcome = match result {
                Ok(value) => Outcome::value(&serializer, value),
                Err(error) => Outcome::failure(&serializer, &ServiceError::from(error.clone())),
            };
            done(outcome);
        });
    }))
}

fn chained_returned<R, S, Fut>(future: Fut, serializer: S) -> Returned
where
    R: Serialize + Send + 'static,
    S: Serializer,
    Fut: Future<Output = Result<R, ServiceError>> + Send + 'static,
{
    Returned::Chained(
        async move { Outcome::from_result(&serializer, &future.await) }.boxed(),
    )
}
