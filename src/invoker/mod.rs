//! Server-side invocation engine.
//!
//! One [`ServiceInvoker`] exists per exported service. It decodes call
//! frames against the service's method table, runs the method on the
//! [`WorkerPool`], adapts the return shape to response frames and tracks
//! every in-flight call until its single terminal transition: completion,
//! timeout, cancellation or connection loss.
//!
//! Both tables are keyed by `(connection, (service_id, call_id))` because
//! call ids are only unique per connection.

mod dispatcher;
mod pool;
mod stream;

pub use dispatcher::ServerDispatcher;
pub use pool::WorkerPool;
pub use stream::DataStream;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::connection::ConnectionId;
use crate::error::{RemoteError, Result, ServiceError};
use crate::handler::{
    ArgBinder, ArgCompletion, ArgResolver, ByteStream, Invocation, Outcome, ResponseContext,
    Returned, ServiceDefinition,
};
use crate::protocol::payload::{decode_call, decode_credit, decode_param, encode_stream_key};
use crate::protocol::{CacheKey, Command, Frame};
use crate::writer::WriterHandle;

/// Key of an in-flight call or open stream.
pub type InvocationKey = (ConnectionId, CacheKey);

/// Bookkeeping for one dispatched call.
struct RemoteInvocation {
    seq: u64,
    ctx: ResponseContext,
    resolvers: Vec<Option<ArgResolver>>,
    worker: Option<AbortHandle>,
    timer: Option<AbortHandle>,
}

impl RemoteInvocation {
    /// Release timers and fail every resolver still waiting.
    fn finish(mut self, error: RemoteError, interrupt: bool) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if interrupt {
            if let Some(worker) = self.worker.take() {
                worker.abort();
            }
        }
        for resolver in self.resolvers.drain(..).flatten() {
            let _ = resolver.complete(ArgCompletion::Abort(error.clone()));
        }
    }
}

/// Dispatcher for one exported service.
pub struct ServiceInvoker {
    service_id: Uuid,
    definition: ServiceDefinition,
    timeout: Duration,
    pool: WorkerPool,
    stream_config: StreamConfig,
    in_flight: DashMap<InvocationKey, RemoteInvocation>,
    streams: DashMap<InvocationKey, Arc<DataStream>>,
    next_seq: AtomicU64,
}

impl ServiceInvoker {
    /// Create an invoker for `definition` exported as `service_id`.
    pub fn new(
        service_id: Uuid,
        definition: ServiceDefinition,
        timeout: Duration,
        pool: WorkerPool,
        stream_config: StreamConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            service_id,
            definition,
            timeout,
            pool,
            stream_config,
            in_flight: DashMap::new(),
            streams: DashMap::new(),
            next_seq: AtomicU64::new(1),
        })
    }

    /// Exported service id.
    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    /// Method table of the service.
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// Call timeout of this export.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of calls currently tracked.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of streams currently tracked.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Handle CALL_WITH_RETURN / CALL_WITHOUT_RETURN.
    pub async fn invoke(self: &Arc<Self>, conn: ConnectionId, frame: Frame, writer: WriterHandle) -> Result<()> {
        let key = frame.key();
        let ctx = ResponseContext::new(key, frame.command() == Command::CallWithReturn, writer);

        let (index, args) = match decode_call(&frame.payload) {
            Ok(call) => call,
            Err(e) => {
                warn!(call_id = key.call_id, error = %e, "Malformed call payload");
                return ctx.reject(Command::ArgsSerializationError, &e.to_string()).await;
            }
        };

        let Some(method) = self.definition.method(index) else {
            warn!(service_id = %self.service_id, method = index, "No such method");
            let message = format!("No method with index {} on service {}", index, self.service_id);
            return ctx.reject(Command::NoMethod, &message).await;
        };

        let mut binder = ArgBinder::new();
        let invocation = match method.decode(&args, &mut binder) {
            Ok(invocation) => invocation,
            Err(message) => {
                warn!(call_id = key.call_id, method = %method.signature, %message, "Failed to decode arguments");
                return ctx.reject(Command::ArgsSerializationError, &message).await;
            }
        };

        let Some(permit) = self.pool.try_acquire() else {
            warn!(call_id = key.call_id, method = %method.signature, "Worker pool saturated");
            return ctx
                .reject(Command::ServerOverloaded, "Server is overloaded, call was not run")
                .await;
        };

        trace!(call_id = key.call_id, method = %method.signature, "Dispatching call");
        let id = (conn, key);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = RemoteInvocation {
            seq,
            ctx: ctx.clone(),
            resolvers: binder.into_resolvers(),
            worker: None,
            timer: None,
        };
        if let Some(previous) = self.in_flight.insert(id, entry) {
            warn!(call_id = key.call_id, "Call id reused while still in flight");
            previous.finish(RemoteError::Cancelled, true);
        }

        let timer = {
            let this = Arc::downgrade(self);
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(this) = this.upgrade() {
                    this.expire(id, seq).await;
                }
            })
            .abort_handle()
        };

        let worker = {
            let this = self.clone();
            tokio::spawn(async move { this.run(id, seq, invocation, permit).await })
            .abort_handle()
        };

        match self.in_flight.get_mut(&id) {
            Some(mut entry) if entry.seq == seq => {
                entry.timer = Some(timer);
                entry.worker = Some(worker);
            }
            _ => timer.abort(),
        }
        Ok(())
    }

    /// The permit travels with the method body. An aborted worker leaves it
    /// inside the blocking closure until the body returns.
    async fn run(self: Arc<Self>, id: InvocationKey, seq: u64, invocation: Invocation, permit: OwnedSemaphorePermit) {
        let (returned, permit) = match tokio::task::spawn_blocking(move || (invocation(), permit)).await {
            Ok((returned, permit)) => (returned, Some(permit)),
            Err(e) => (Returned::Ready(Outcome::Panic(join_message(e))), None),
        };

        match returned {
            Returned::Ready(outcome) => self.complete(id, seq, outcome).await,
            Returned::Chained(future) => {
                let outcome = AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Outcome::Panic("Method future panicked".to_string()));
                self.complete(id, seq, outcome).await;
            }
            Returned::Blocking(wait) => {
                let timeout = self.timeout;
                let outcome = match tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    wait(timeout)
                })
                .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => Outcome::Panic(join_message(e)),
                };
                self.complete(id, seq, outcome).await;
            }
            Returned::Promise(attach) => {
                let this = self.clone();
                let runtime = tokio::runtime::Handle::current();
                attach(Box::new(move |outcome| {
                    runtime.spawn(async move { this.complete(id, seq, outcome).await });
                }));
            }
            Returned::Stream(source) => self.start_stream(id, seq, source).await,
        }
    }

    /// Terminal transition on normal or abnormal completion.
    async fn complete(&self, id: InvocationKey, seq: u64, outcome: Outcome) {
        let Some((_, entry)) = self.in_flight.remove_if(&id, |_, e| e.seq == seq) else {
            debug!(call_id = id.1.call_id, "Result of a call that already ended, dropped");
            return;
        };
        let ctx = entry.ctx.clone();
        entry.finish(RemoteError::ResolvedTooLate, false);
        if let Err(e) = ctx.outcome(outcome).await {
            debug!(call_id = id.1.call_id, error = %e, "Could not write response");
        }
    }

    async fn expire(&self, id: InvocationKey, seq: u64) {
        let Some((_, entry)) = self.in_flight.remove_if(&id, |_, e| e.seq == seq) else {
            return;
        };
        warn!(
            service_id = %self.service_id,
            call_id = id.1.call_id,
            timeout_ms = self.timeout.as_millis() as u64,
            "Call timed out"
        );
        let ctx = entry.ctx.clone();
        entry.finish(RemoteError::Timeout, true);

        let error = ServiceError::with_kind(
            "timeout",
            format!("Call did not complete within {} ms", self.timeout.as_millis()),
        );
        if let Err(e) = ctx.outcome(self.definition.failure(&error)).await {
            debug!(call_id = id.1.call_id, error = %e, "Could not write timeout");
        }
    }

    /// Handle CANCEL. Writes nothing.
    pub fn cancel(&self, conn: ConnectionId, key: CacheKey) {
        match self.in_flight.remove(&(conn, key)) {
            Some((_, entry)) => {
                debug!(call_id = key.call_id, "Call cancelled");
                entry.finish(RemoteError::Timeout, true);
            }
            None => trace!(call_id = key.call_id, "Cancel for a call that is not in flight"),
        }
    }

    /// Handle ASYNC_PARAM_DATA / ASYNC_PARAM_FAILURE.
    pub async fn resolve_param(&self, conn: ConnectionId, frame: Frame, writer: WriterHandle) -> Result<()> {
        let key = frame.key();
        let ctx = ResponseContext::new(key, true, writer);

        let (index, data) = match decode_param(&frame.payload) {
            Ok(param) => param,
            Err(e) => return ctx.error(Command::AsyncParamError, &e.to_string()).await,
        };

        let resolver = self.in_flight.get_mut(&(conn, key)).and_then(|mut entry| {
            entry
                .resolvers
                .get_mut(usize::from(index))
                .and_then(Option::take)
        });

        let Some(resolver) = resolver else {
            warn!(call_id = key.call_id, param = index, "Async argument for a call that is not waiting for it");
            let message = RemoteError::ResolvedTooLate.to_string();
            return ctx.error(Command::AsyncParamError, &message).await;
        };

        let completion = match frame.command() {
            Command::AsyncParamFailure => ArgCompletion::Failure(data),
            _ => ArgCompletion::Data(data),
        };
        match resolver.complete(completion) {
            Ok(()) => Ok(()),
            Err(message) => {
                warn!(call_id = key.call_id, param = index, %message, "Async argument rejected");
                ctx.error(Command::AsyncParamError, &message).await
            }
        }
    }

    async fn start_stream(self: &Arc<Self>, id: InvocationKey, seq: u64, source: ByteStream) {
        let Some((_, entry)) = self.in_flight.remove_if(&id, |_, e| e.seq == seq) else {
            return;
        };
        let ctx = entry.ctx.clone();
        entry.finish(RemoteError::ResolvedTooLate, false);

        let stream = Arc::new(DataStream::new(ctx.clone(), source));
        if let Some((_, previous)) = self.streams.remove(&id) {
            previous.abort();
        }
        self.streams.insert(id, stream.clone());

        // Discard the stream if the client never opens it.
        let this = Arc::downgrade(self);
        let timeout = self.timeout;
        let pending = Arc::downgrade(&stream);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let (Some(this), Some(stream)) = (this.upgrade(), pending.upgrade()) else {
                return;
            };
            let removed = this
                .streams
                .remove_if(&id, |_, s| Arc::ptr_eq(s, &stream) && !s.is_open());
            if removed.is_some() {
                debug!(call_id = id.1.call_id, "Stream was never opened, discarded");
                stream.abort();
            }
        });

        if let Err(e) = ctx.success(encode_stream_key(id.1)).await {
            debug!(call_id = id.1.call_id, error = %e, "Could not write stream key");
        }
    }

    fn stream(&self, id: &InvocationKey) -> Option<Arc<DataStream>> {
        self.streams.get(id).map(|s| s.value().clone())
    }

    fn finisher(self: &Arc<Self>, id: InvocationKey, stream: &Arc<DataStream>) -> impl FnOnce() + Send + 'static {
        let this: Weak<Self> = Arc::downgrade(self);
        let stream = Arc::downgrade(stream);
        move || {
            if let (Some(this), Some(stream)) = (this.upgrade(), stream.upgrade()) {
                this.streams.remove_if(&id, |_, s| Arc::ptr_eq(s, &stream));
            }
        }
    }

    /// Handle CLIENT_OPEN.
    pub async fn open_stream(self: &Arc<Self>, conn: ConnectionId, frame: Frame, writer: WriterHandle) -> Result<()> {
        let id = (conn, frame.key());
        let ctx = ResponseContext::new(id.1, true, writer);

        let credit = match decode_credit(&frame.payload) {
            Ok(credit) => credit.unwrap_or(self.stream_config.initial_credit),
            Err(e) => return ctx.error(Command::UnknownError, &e.to_string()).await,
        };
        let Some(stream) = self.stream(&id) else {
            warn!(call_id = id.1.call_id, "Open for an unknown stream");
            return ctx.error(Command::UnknownError, "Unknown stream").await;
        };

        let on_finish = self.finisher(id, &stream);
        if stream.open(credit, &self.stream_config, on_finish) {
            debug!(call_id = id.1.call_id, credit, "Stream opened");
        } else {
            stream.grant(credit);
        }
        Ok(())
    }

    /// Handle CLIENT_BACK_PRESSURE.
    pub async fn stream_credit(&self, conn: ConnectionId, frame: Frame, writer: WriterHandle) -> Result<()> {
        let id = (conn, frame.key());
        let ctx = ResponseContext::new(id.1, true, writer);

        let credit = match decode_credit(&frame.payload) {
            Ok(Some(credit)) => credit,
            Ok(None) => return ctx.error(Command::UnknownError, "Back pressure frame without credit").await,
            Err(e) => return ctx.error(Command::UnknownError, &e.to_string()).await,
        };
        let Some(stream) = self.stream(&id) else {
            warn!(call_id = id.1.call_id, credit, "Back pressure for an unknown stream");
            return ctx.error(Command::UnknownError, "Unknown stream").await;
        };

        if credit < 0 && !stream.is_open() {
            self.streams.remove_if(&id, |_, s| Arc::ptr_eq(s, &stream));
            stream.abort();
            return ctx.stream_close().await;
        }
        stream.grant(credit);
        trace!(call_id = id.1.call_id, credit, available = stream.credit(), "Stream credit");
        Ok(())
    }

    /// Handle CLIENT_CLOSE. Unknown keys are not an error.
    pub async fn close_stream(&self, conn: ConnectionId, key: CacheKey, writer: WriterHandle) -> Result<()> {
        let id = (conn, key);
        let Some(stream) = self.stream(&id) else {
            trace!(call_id = key.call_id, "Close for an unknown stream ignored");
            return Ok(());
        };

        if stream.is_open() {
            stream.close();
            return Ok(());
        }
        self.streams.remove_if(&id, |_, s| Arc::ptr_eq(s, &stream));
        stream.abort();
        ResponseContext::new(key, true, writer).stream_close().await
    }

    /// Drop everything owned by a lost connection. Writes nothing.
    pub fn connection_closed(&self, conn: ConnectionId) {
        let calls: Vec<InvocationKey> = self
            .in_flight
            .iter()
            .filter(|e| e.key().0 == conn)
            .map(|e| *e.key())
            .collect();
        for id in calls {
            if let Some((_, entry)) = self.in_flight.remove(&id) {
                entry.finish(RemoteError::Cancelled, true);
            }
        }

        let streams: Vec<InvocationKey> = self
            .streams
            .iter()
            .filter(|e| e.key().0 == conn)
            .map(|e| *e.key())
            .collect();
        for id in streams {
            if let Some((_, stream)) = self.streams.remove(&id) {
                stream.abort();
            }
        }
    }

    /// Stop serving: fail pending calls with NO_SERVICE and open streams
    /// with STREAM_ERROR.
    pub async fn close(&self) {
        let calls: Vec<InvocationKey> = self.in_flight.iter().map(|e| *e.key()).collect();
        for id in calls {
            if let Some((_, entry)) = self.in_flight.remove(&id) {
                let ctx = entry.ctx.clone();
                entry.finish(RemoteError::Cancelled, true);
                let _ = ctx.reject(Command::NoService, "Service was unregistered").await;
            }
        }

        let streams: Vec<InvocationKey> = self.streams.iter().map(|e| *e.key()).collect();
        for id in streams {
            if let Some((_, stream)) = self.streams.remove(&id) {
                stream.abort();
                let _ = stream.context().stream_error("Service was unregistered").await;
            }
        }
    }
}

fn join_message(e: JoinError) -> String {
    if e.is_panic() {
        let panic = e.into_panic();
        if let Some(s) = panic.downcast_ref::<&str>() {
            return format!("Method panicked: {}", s);
        }
        if let Some(s) = panic.downcast_ref::<String>() {
            return format!("Method panicked: {}", s);
        }
        return "Method panicked".to_string();
    }
    "Method was cancelled".to_string()
}
