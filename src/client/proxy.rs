//! Import-side service proxy.
//!
//! A [`ServiceProxy`] forwards calls over a [`Connection`] using the
//! endpoint's method table, so a call frame carries the 2-byte method index
//! instead of a signature. Methods are looked up by full signature first,
//! then by bare name (the part before `(`).
//!
//! # Example
//!
//! ```no_run
//! use remotewire::client::ServiceProxy;
//! use remotewire::codec::MsgPackSerializer;
//! use remotewire::promise::Promise;
//! use remotewire::RemoteError;
//!
//! # async fn run(proxy: ServiceProxy<MsgPackSerializer>) -> Result<(), RemoteError> {
//! let length: i64 = proxy.call("length", ()).await?;
//!
//! let (strict, resolver) = Promise::pending();
//! let pending = proxy.call_promise::<_, bool>("coprime", (7i64, 42i64, strict));
//! resolver.resolve(false);
//! let coprime = pending.await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::args::{CallArgs, FollowUp};
use super::correlation::Reply;
use super::stream::{DecodeFn, RemoteStream};
use crate::codec::Serializer;
use crate::config::{StreamConfig, DEFAULT_CALL_TIMEOUT};
use crate::connection::Connection;
use crate::error::{Error, RemoteError, ServiceError};
use crate::promise::Promise;
use crate::protocol::payload::{decode_stream_key, encode_call, encode_credit, encode_param};
use crate::protocol::{CacheKey, Command, Frame};
use crate::writer::{wait_flushed, FlushReceiver, OutboundFrame, WriterHandle};

/// Local stand-in for a remote service.
pub struct ServiceProxy<S> {
    service_id: Uuid,
    methods: Arc<HashMap<String, u16>>,
    serializer: S,
    timeout: Duration,
    stream: StreamConfig,
    connection: Arc<Connection>,
    open: Arc<AtomicBool>,
}

impl<S: Clone> Clone for ServiceProxy<S> {
    fn clone(&self) -> Self {
        Self {
            service_id: self.service_id,
            methods: self.methods.clone(),
            serializer: self.serializer.clone(),
            timeout: self.timeout,
            stream: self.stream.clone(),
            connection: self.connection.clone(),
            open: self.open.clone(),
        }
    }
}

impl<S> fmt::Debug for ServiceProxy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("service_id", &self.service_id)
            .field("methods", &self.methods.len())
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl<S: Serializer> ServiceProxy<S> {
    /// Create a proxy for `service_id` reachable over `connection`.
    pub fn new(
        connection: Arc<Connection>,
        service_id: Uuid,
        methods: &BTreeMap<u16, String>,
        serializer: S,
    ) -> Self {
        let mut table = HashMap::with_capacity(methods.len() * 2);
        for (index, signature) in methods {
            if let Some((name, _)) = signature.split_once('(') {
                table.entry(name.to_string()).or_insert(*index);
            }
            table.insert(signature.clone(), *index);
        }
        Self {
            service_id,
            methods: Arc::new(table),
            serializer,
            timeout: DEFAULT_CALL_TIMEOUT,
            stream: StreamConfig::default(),
            connection,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Bound every call-with-return by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Credit settings for streaming calls.
    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.stream = config;
        self
    }

    /// Remote service id.
    pub fn service_id(&self) -> Uuid {
        self.service_id
    }

    /// Call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Connection the proxy calls over.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// False once the owning import was closed.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.connection.is_closed()
    }

    pub(crate) fn invalidate(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Compressed index of a method.
    pub fn method_index(&self, method: &str) -> Result<u16, RemoteError> {
        self.methods
            .get(method)
            .copied()
            .ok_or_else(|| RemoteError::NoMethod(format!("{} is not in the endpoint's method table", method)))
    }

    /// Call a method and wait for its value.
    pub async fn call<A, R>(&self, method: &str, args: A) -> Result<R, RemoteError>
    where
        A: CallArgs,
        R: DeserializeOwned,
    {
        let payload = self.call_raw(method, args).await?;
        self.serializer
            .deserialize_return(&payload)
            .map_err(|e| RemoteError::LocalSerialization(format!("Failed to decode return value: {}", e)))
    }

    /// Fire-and-forget call. Returns once the call frame was written.
    pub async fn call_no_return<A: CallArgs>(&self, method: &str, args: A) -> Result<(), RemoteError> {
        self.send_call(Command::CallWithoutReturn, method, args)
            .await
            .map(|_| ())
    }

    /// Call a method and get a promise of its value.
    pub fn call_promise<A, R>(&self, method: &str, args: A) -> Promise<R>
    where
        A: CallArgs,
        R: DeserializeOwned + Clone + Send + 'static,
    {
        let proxy = self.clone();
        let method = method.to_string();
        Promise::spawn(async move { proxy.call(&method, args).await })
    }

    /// Call a stream-returning method and open the stream.
    pub async fn call_stream<A, R>(&self, method: &str, args: A) -> Result<RemoteStream<R>, RemoteError>
    where
        A: CallArgs,
        R: DeserializeOwned + Send + 'static,
    {
        let payload = self.call_raw(method, args).await?;
        let key = decode_stream_key(&payload)
            .map_err(|e| RemoteError::LocalSerialization(format!("Bad stream key: {}", e)))?;

        let correlator = self.connection.correlator().clone();
        let events = correlator.register_stream(key.call_id)?;
        let writer = self.connection.writer().clone();
        let open = Frame::message(Command::ClientOpen, key, encode_credit(self.stream.initial_credit));
        if let Err(e) = writer.send_frame(open).await {
            correlator.remove(key.call_id);
            return Err(e.into());
        }
        debug!(call_id = key.call_id, credit = self.stream.initial_credit, "Stream opened");

        let serializer = self.serializer.clone();
        let decode: DecodeFn<R> = Box::new(move |bytes: &[u8]| {
            serializer
                .deserialize_return(bytes)
                .map_err(|e| RemoteError::LocalSerialization(format!("Failed to decode stream element: {}", e)))
        });
        Ok(RemoteStream::new(
            key,
            events,
            decode,
            writer,
            correlator,
            self.stream.credit_batch,
        ))
    }

    async fn call_raw<A: CallArgs>(&self, method: &str, args: A) -> Result<Bytes, RemoteError> {
        let (key, reply) = self.send_call(Command::CallWithReturn, method, args).await?;
        let reply = reply.ok_or_else(|| RemoteError::Unknown("Call was not registered".to_string()))?;

        match self.await_reply(key, reply).await? {
            Reply::Success(payload) => Ok(payload),
            Reply::Failure(payload) => Err(match self.serializer.deserialize_return::<ServiceError>(&payload) {
                Ok(error) => RemoteError::Failure(error),
                Err(e) => RemoteError::LocalSerialization(format!("Failed to decode failure: {}", e)),
            }),
            Reply::Error(error) => Err(error),
        }
    }

    async fn send_call<A: CallArgs>(
        &self,
        command: Command,
        method: &str,
        args: A,
    ) -> Result<(CacheKey, Option<oneshot::Receiver<Reply>>), RemoteError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(RemoteError::Communication("Import is closed".to_string()));
        }
        let index = self.method_index(method)?;

        let mut followups = Vec::new();
        let wire = CallArgs::prepare(args, &self.serializer, &mut followups);
        let args = self
            .serializer
            .serialize_args(&wire)
            .map_err(|e| RemoteError::LocalSerialization(format!("Failed to serialize arguments: {}", e)))?;

        let correlator = self.connection.correlator();
        let key = CacheKey::new(self.service_id, correlator.next_call_id());
        let reply = match command {
            Command::CallWithReturn => Some(correlator.register(key.call_id)?),
            _ => None,
        };
        trace!(call_id = key.call_id, method, index, follow_ups = followups.len(), "Calling");

        let writer = self.connection.writer();
        let frame = Frame::message(command, key, encode_call(index, &args));
        let (frame, flushed) = OutboundFrame::from(frame).with_flush_notifier();
        if let Err(e) = writer.send(frame).await {
            correlator.remove(key.call_id);
            if let Error::PayloadTooLarge { size, max } = e {
                return Err(RemoteError::LocalSerialization(format!(
                    "Serialized arguments of {} bytes exceed maximum payload {}",
                    size, max
                )));
            }
            return Err(e.into());
        }

        if reply.is_none() {
            wait_flushed(flushed).await?;
            if !followups.is_empty() {
                tokio::spawn(send_follow_ups(writer.clone(), key, None, followups, self.serializer.clone()));
            }
        } else if !followups.is_empty() {
            tokio::spawn(send_follow_ups(writer.clone(), key, Some(flushed), followups, self.serializer.clone()));
        }
        Ok((key, reply))
    }

    async fn await_reply(&self, key: CacheKey, reply: oneshot::Receiver<Reply>) -> Result<Reply, RemoteError> {
        match tokio::time::timeout(self.timeout, reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RemoteError::Communication(
                "Connection dropped the call".to_string(),
            )),
            Err(_) => {
                self.connection.correlator().remove(key.call_id);
                warn!(
                    service_id = %key.service_id,
                    call_id = key.call_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Call timed out, cancelling"
                );
                let cancel = Frame::message(Command::Cancel, key, Bytes::new());
                if let Err(e) = self.connection.writer().send_frame(cancel).await {
                    debug!(call_id = key.call_id, error = %e, "Could not send cancel");
                }
                Err(RemoteError::Timeout)
            }
        }
    }
}

/// Send async-argument frames as their promises complete, never before the
/// call frame is flushed.
async fn send_follow_ups<S: Serializer>(
    writer: WriterHandle,
    key: CacheKey,
    flushed: Option<FlushReceiver>,
    followups: Vec<FollowUp>,
    serializer: S,
) {
    if let Some(flushed) = flushed {
        if let Err(e) = wait_flushed(flushed).await {
            debug!(call_id = key.call_id, error = %e, "Call frame not flushed, dropping async arguments");
            return;
        }
    }

    let mut pending: FuturesUnordered<FollowUp> = followups.into_iter().collect();
    while let Some(next) = pending.next().await {
        let Some((command, payload)) = next else {
            continue;
        };
        trace!(call_id = key.call_id, ?command, "Sending async argument");
        let index = payload.first().copied();
        match writer.send_frame(Frame::message(command, key, payload)).await {
            Ok(()) => {}
            Err(Error::PayloadTooLarge { size, max }) => {
                warn!(call_id = key.call_id, size, max, "Async argument too large, failing it");
                let Some(index) = index else { continue };
                let failure = ServiceError::with_kind(
                    "local_serialization",
                    format!("Async argument of {} bytes exceeds maximum payload {}", size, max),
                );
                let Ok(bytes) = serializer.serialize_return(&failure) else {
                    continue;
                };
                let frame = Frame::message(Command::AsyncParamFailure, key, encode_param(index, &bytes));
                if let Err(e) = writer.send_frame(frame).await {
                    debug!(call_id = key.call_id, error = %e, "Could not send async argument failure");
                    return;
                }
            }
            Err(e) => {
                debug!(call_id = key.call_id, error = %e, "Could not send async argument");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackSerializer;
    use crate::config::TransportConfig;
    use crate::handler::AsyncArg;
    use crate::invoker::ServerDispatcher;
    use crate::protocol::payload::{decode_call, decode_param};
    use crate::protocol::FrameBuffer;
    use std::collections::VecDeque;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    const SERVICE: Uuid = Uuid::from_u128(0xabc);

    fn proxy(timeout: Duration) -> (ServiceProxy<MsgPackSerializer>, Remote) {
        proxy_with(timeout, &TransportConfig::default())
    }

    fn proxy_with(timeout: Duration, config: &TransportConfig) -> (ServiceProxy<MsgPackSerializer>, Remote) {
        let (local, remote) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(local);
        let conn = Connection::spawn("test", reader, writer, Arc::new(ServerDispatcher::new()), config);
        let methods = BTreeMap::from([
            (0, "length()".to_string()),
            (1, "coprime(long,long,Promise<bool>)".to_string()),
        ]);
        let proxy = ServiceProxy::new(conn, SERVICE, &methods, MsgPackSerializer).with_timeout(timeout);
        (proxy, Remote::new(remote))
    }

    /// Peer side of the duplex, yielding one frame at a time.
    struct Remote {
        stream: DuplexStream,
        buffer: FrameBuffer,
        queued: VecDeque<Frame>,
    }

    impl Remote {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                buffer: FrameBuffer::new(),
                queued: VecDeque::new(),
            }
        }

        async fn next(&mut self) -> Frame {
            let mut buf = vec![0u8; 4096];
            loop {
                if let Some(frame) = self.queued.pop_front() {
                    return frame;
                }
                let n = self.stream.read(&mut buf).await.unwrap();
                self.queued.extend(self.buffer.push(&buf[..n]).unwrap());
            }
        }

        async fn send(&mut self, frame: Frame) {
            self.stream.write_all(&frame.to_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_method_lookup() {
        let (proxy, _remote) = proxy(Duration::from_secs(1));
        assert_eq!(proxy.method_index("length").unwrap(), 0);
        assert_eq!(proxy.method_index("length()").unwrap(), 0);
        assert_eq!(proxy.method_index("coprime").unwrap(), 1);
        assert!(matches!(proxy.method_index("nope"), Err(RemoteError::NoMethod(_))));
    }

    #[tokio::test]
    async fn test_call_resolves_from_success() {
        let (proxy, mut remote) = proxy(Duration::from_secs(5));
        let call = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.call::<_, i64>("length", ()).await }
        });

        let frame = remote.next().await;
        assert_eq!(frame.command(), Command::CallWithReturn);
        let (index, _) = decode_call(&frame.payload).unwrap();
        assert_eq!(index, 0);

        let value = MsgPackSerializer.serialize_return(&30i64).unwrap();
        let response = Frame::message(Command::Success, frame.key(), value.into());
        remote.send(response).await;

        assert_eq!(call.await.unwrap().unwrap(), 30);
    }

    #[tokio::test]
    async fn test_async_argument_follows_call_frame() {
        let (proxy, mut remote) = proxy(Duration::from_secs(5));
        let (strict, resolver) = Promise::<bool>::pending();
        let pending = proxy.call_promise::<_, bool>("coprime", (7i64, 42i64, strict));

        let call = remote.next().await;
        assert_eq!(call.command(), Command::CallWithReturn);
        let (_, args) = decode_call(&call.payload).unwrap();
        let wire: (i64, i64, AsyncArg<bool>) = MsgPackSerializer.deserialize_args(&args).unwrap();
        assert_eq!(wire.2, AsyncArg::Pending);

        resolver.resolve(true);
        let follow_up = remote.next().await;
        assert_eq!(follow_up.command(), Command::AsyncParamData);
        assert_eq!(follow_up.call_id(), call.call_id());
        assert_eq!(decode_param(&follow_up.payload).unwrap().0, 2);

        let error = ServiceError::with_kind("illegal_argument", "7 and 42 are not coprime");
        let failure = MsgPackSerializer.serialize_return(&error).unwrap();
        let response = Frame::message(Command::Failure, call.key(), failure.into());
        remote.send(response).await;

        assert_eq!(pending.await, Err(RemoteError::Failure(error)));
    }

    #[tokio::test]
    async fn test_timeout_sends_cancel() {
        let (proxy, mut remote) = proxy(Duration::from_millis(30));
        let result = proxy.call::<_, i64>("length", ()).await;
        assert_eq!(result, Err(RemoteError::Timeout));

        let call = remote.next().await;
        let cancel = remote.next().await;
        assert_eq!(cancel.command(), Command::Cancel);
        assert_eq!(cancel.call_id(), call.call_id());
        assert_eq!(proxy.connection().correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_arguments_fail_locally() {
        let config = TransportConfig {
            max_payload_size: 128,
            ..TransportConfig::default()
        };
        let (proxy, _remote) = proxy_with(Duration::from_secs(1), &config);

        let result = proxy.call::<_, i64>("length", ("x".repeat(200),)).await;
        assert!(matches!(result, Err(RemoteError::LocalSerialization(_))), "{:?}", result);
        assert_eq!(proxy.connection().correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_async_argument_sent_as_failure() {
        let config = TransportConfig {
            max_payload_size: 128,
            ..TransportConfig::default()
        };
        let (proxy, mut remote) = proxy_with(Duration::from_secs(5), &config);
        let (text, resolver) = Promise::<String>::pending();
        let _pending = proxy.call_promise::<_, bool>("coprime", (7i64, 42i64, text));

        let call = remote.next().await;
        assert_eq!(call.command(), Command::CallWithReturn);

        resolver.resolve("x".repeat(200));
        let follow_up = remote.next().await;
        assert_eq!(follow_up.command(), Command::AsyncParamFailure);
        assert_eq!(follow_up.call_id(), call.call_id());
        let (index, data) = decode_param(&follow_up.payload).unwrap();
        assert_eq!(index, 2);
        let error: ServiceError = MsgPackSerializer.deserialize_return(&data).unwrap();
        assert_eq!(error.kind, "local_serialization");
    }

    #[tokio::test]
    async fn test_closed_proxy_refuses_calls() {
        let (proxy, _remote) = proxy(Duration::from_secs(1));
        proxy.invalidate();
        assert!(!proxy.is_open());
        let result = proxy.call_no_return("length", ()).await;
        assert!(matches!(result, Err(RemoteError::Communication(_))));
    }
}
