//! Single-value asynchronous handles.
//!
//! - [`Promise`] / [`Resolver`]: a completable handle with callbacks. It can
//!   be inspected without awaiting, which is what lets the client inline an
//!   already-resolved argument into the call frame.
//! - [`Deferred`]: the "raw future" return shape. Its concrete variant is
//!   only known when the method returns, so the invoker picks the adapter at
//!   call time.
//!
//! A promise completes at most once. Dropping the last [`Resolver`] without
//! completing it fails the promise with [`RemoteError::Cancelled`].

use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{RemoteError, ServiceError};

type Callback<T> = Box<dyn FnOnce(&Result<T, RemoteError>) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(Result<T, RemoteError>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Notify,
}

impl<T> Inner<T> {
    /// Returns false if already completed.
    fn complete(&self, result: Result<T, RemoteError>) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(result);
                    callbacks
                }
            }
        };

        if !callbacks.is_empty() {
            let state = self.state.lock();
            if let State::Done(result) = &*state {
                // Callbacks run under the lock; they must not touch this promise.
                for callback in callbacks {
                    callback(result);
                }
            }
        }
        self.done.notify_waiters();
        true
    }
}

/// A value that will be available later, or a failure.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> Promise<T> {
    fn with_state(state: State<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                done: Notify::new(),
            }),
        }
    }

    /// Create an unresolved promise and the resolver that completes it.
    pub fn pending() -> (Promise<T>, Resolver<T>) {
        let promise = Self::with_state(State::Pending(Vec::new()));
        let resolver = Resolver {
            inner: Some(promise.inner.clone()),
        };
        (promise, resolver)
    }

    /// Create an already-resolved promise.
    pub fn resolved(value: T) -> Self {
        Self::with_state(State::Done(Ok(value)))
    }

    /// Create an already-failed promise.
    pub fn failed(error: RemoteError) -> Self {
        Self::with_state(State::Done(Err(error)))
    }

    /// True once resolved or failed.
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(_))
    }

    /// Run `callback` when the promise completes (immediately if it has).
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T, RemoteError>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending(callbacks) => callbacks.push(Box::new(callback)),
            State::Done(result) => callback(result),
        }
    }

    /// Spawn `future` and complete a new promise with its output.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, RemoteError>> + Send + 'static,
        T: Send + 'static,
    {
        let (promise, resolver) = Self::pending();
        tokio::spawn(async move {
            resolver.complete(future.await);
        });
        promise
    }
}

impl<T: Clone> Promise<T> {
    /// Snapshot of the outcome, `None` while pending.
    pub fn try_result(&self) -> Option<Result<T, RemoteError>> {
        match &*self.inner.state.lock() {
            State::Pending(_) => None,
            State::Done(result) => Some(result.clone()),
        }
    }

    /// Wait for the outcome.
    pub async fn value(&self) -> Result<T, RemoteError> {
        loop {
            let notified = self.inner.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    /// Wait for the outcome at most `timeout`.
    pub async fn value_within(&self, timeout: Duration) -> Result<T, RemoteError> {
        tokio::time::timeout(timeout, self.value())
            .await
            .unwrap_or(Err(RemoteError::Timeout))
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T, RemoteError>;
    type IntoFuture = BoxFuture<'static, Result<T, RemoteError>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.value().await }.boxed()
    }
}

/// Completes a [`Promise`].
pub struct Resolver<T> {
    inner: Option<Arc<Inner<T>>>,
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl<T> Resolver<T> {
    /// Resolve with a value. Returns false if the promise was already done.
    pub fn resolve(self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Fail with an error. Returns false if the promise was already done.
    pub fn fail(self, error: RemoteError) -> bool {
        self.complete(Err(error))
    }

    /// Complete with an outcome.
    pub fn complete(mut self, result: Result<T, RemoteError>) -> bool {
        match self.inner.take() {
            Some(inner) => inner.complete(result),
            None => false,
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.complete(Err(RemoteError::Cancelled));
        }
    }
}

/// Boxed blocking wait, given the longest time it may block.
pub type BlockingWait<T> = Box<dyn FnOnce(Duration) -> Result<T, ServiceError> + Send>;

/// A future-style result whose concrete shape is decided by the method body.
pub enum Deferred<T> {
    /// A completable handle; the response is written from its callback.
    Promise(Promise<T>),
    /// An async computation; the response is written when it finishes.
    Future(BoxFuture<'static, Result<T, ServiceError>>),
    /// An opaque handle that can only be waited on; a worker blocks on it
    /// for at most the call timeout.
    Blocking(BlockingWait<T>),
}

impl<T> Deferred<T> {
    /// Wrap an async computation.
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, ServiceError>> + Send + 'static,
    {
        Deferred::Future(future.boxed())
    }

    /// Wrap a blocking wait.
    pub fn blocking<F>(wait: F) -> Self
    where
        F: FnOnce(Duration) -> Result<T, ServiceError> + Send + 'static,
    {
        Deferred::Blocking(Box::new(wait))
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Wait for the outcome from async code.
    ///
    /// A `Blocking` variant is moved to the blocking pool and bounded by
    /// `timeout`.
    pub async fn resolve(self, timeout: Duration) -> Result<T, ServiceError> {
        match self {
            Deferred::Promise(promise) => promise.value().await.map_err(ServiceError::from),
            Deferred::Future(future) => future.await,
            Deferred::Blocking(wait) => tokio::task::spawn_blocking(move || wait(timeout))
                .await
                .unwrap_or_else(|e| Err(ServiceError::with_kind("panic", e.to_string()))),
        }
    }
}

impl<T> From<Promise<T>> for Deferred<T> {
    fn from(promise: Promise<T>) -> Self {
        Deferred::Promise(promise)
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferred::Promise(p) => f.debug_tuple("Promise").field(p).finish(),
            Deferred::Future(_) => f.write_str("Future"),
            Deferred::Blocking(_) => f.write_str("Blocking"),
        }
    }
}
