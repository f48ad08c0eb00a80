//! One multiplexed connection to a peer.
//!
//! A connection is symmetric: it serves requests for services registered in
//! the shared [`ServerDispatcher`] and correlates responses to calls made
//! through it. The lifecycle:
//! 1. Spawn the writer task over the write half
//! 2. Spawn the read loop over the read half
//! 3. Route request frames to the dispatcher, response frames to the
//!    [`Correlator`]
//! 4. On EOF, I/O error, corrupted frame or writer failure: fail every
//!    pending call with a communication error and release server-side work
//!    owned by this connection
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use remotewire::config::TransportConfig;
//! use remotewire::connection::Connection;
//! use remotewire::invoker::ServerDispatcher;
//!
//! # async fn run(socket: tokio::net::TcpStream) {
//! let (reader, writer) = socket.into_split();
//! let dispatcher = Arc::new(ServerDispatcher::new());
//! let conn = Connection::spawn("peer", reader, writer, dispatcher, &TransportConfig::default());
//!
//! let reason = conn.closed().await;
//! println!("connection ended: {}", reason);
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, trace, warn};

use crate::client::Correlator;
use crate::config::TransportConfig;
use crate::error::{Error, RemoteError, Result};
use crate::invoker::ServerDispatcher;
use crate::promise::{Promise, Resolver};
use crate::protocol::FrameBuffer;
use crate::writer::{spawn_writer_task, WriterHandle};

/// Read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A running connection.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    writer: WriterHandle,
    correlator: Arc<Correlator>,
    dispatcher: Arc<ServerDispatcher>,
    shutdown: Notify,
    closing: AtomicBool,
    closed: Promise<String>,
    closed_resolver: Mutex<Option<Resolver<String>>>,
    writer_task: Mutex<Option<AbortHandle>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Start serving a connected socket.
    pub fn spawn<R, W>(
        peer: impl Into<String>,
        reader: R,
        writer: W,
        dispatcher: Arc<ServerDispatcher>,
        config: &TransportConfig,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(writer, config.writer.clone());
        let writer = writer.with_max_payload(config.max_payload_size);
        let (closed, closed_resolver) = Promise::pending();

        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            peer: peer.into(),
            writer,
            correlator: Arc::new(Correlator::new()),
            dispatcher,
            shutdown: Notify::new(),
            closing: AtomicBool::new(false),
            closed,
            closed_resolver: Mutex::new(Some(closed_resolver)),
            writer_task: Mutex::new(Some(writer_task.abort_handle())),
        });
        debug!(conn = %conn.id, peer = %conn.peer, "Connection established");

        // A failed write kills the connection even when the peer keeps sending.
        let watcher = Arc::downgrade(&conn);
        tokio::spawn(async move {
            let reason = match writer_task.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    error!(error = %e, "Writer task failed");
                    e.to_string()
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) => e.to_string(),
            };
            if let Some(conn) = watcher.upgrade() {
                conn.finish(reason);
            }
        });

        let max_payload = config.max_payload_size;
        let reading = conn.clone();
        tokio::spawn(async move {
            let reason = match reading.clone().read_loop(reader, max_payload).await {
                Ok(()) => "Connection closed".to_string(),
                Err(e) => {
                    warn!(conn = %reading.id, error = %e, "Read loop error");
                    e.to_string()
                }
            };
            reading.finish(reason);
        });

        conn
    }

    /// Main read loop - reads frames and routes them.
    async fn read_loop<R>(self: Arc<Self>, mut reader: R, max_payload: u32) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut frame_buffer = FrameBuffer::with_max_payload(max_payload);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) => return Err(Error::Io(e)),
                },
            };

            for frame in frame_buffer.push(&buf[..n])? {
                if frame.is_request() {
                    match self.dispatcher.dispatch(self.id, frame, &self.writer).await {
                        Ok(()) => {}
                        Err(Error::BackpressureTimeout) => {
                            warn!(conn = %self.id, "Response dropped, writer is saturated");
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    trace!(conn = %self.id, command = ?frame.command(), call_id = frame.call_id(), "Response");
                    self.correlator.handle_response(frame);
                }
            }
        }
    }

    fn finish(&self, reason: String) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(conn = %self.id, peer = %self.peer, %reason, "Connection finished");

        self.shutdown.notify_one();
        self.correlator
            .fail_all(RemoteError::Communication(reason.clone()));
        self.dispatcher.connection_closed(self.id);
        if let Some(task) = self.writer_task.lock().take() {
            task.abort();
        }
        if let Some(resolver) = self.closed_resolver.lock().take() {
            resolver.resolve(reason);
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.finish("Connection closed locally".to_string());
    }

    /// Connection identity.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Handle to the writer task.
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    /// Outbound call correlation.
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// True once the connection has ended.
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Completes with the reason the connection ended.
    pub fn closed_promise(&self) -> Promise<String> {
        self.closed.clone()
    }

    /// Wait until the connection ends and return why.
    pub async fn closed(&self) -> String {
        self.closed
            .value()
            .await
            .unwrap_or_else(|e| e.to_string())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.writer_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Reply;
    use crate::protocol::payload::encode_message;
    use crate::protocol::{CacheKey, Command, Frame};
    use tokio::io::{duplex, AsyncWriteExt};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_response_reaches_correlator() {
        let (local, remote) = duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let conn = Connection::spawn(
            "test",
            reader,
            writer,
            Arc::new(ServerDispatcher::new()),
            &TransportConfig::default(),
        );

        let call_id = conn.correlator().next_call_id();
        let reply = conn.correlator().register(call_id).unwrap();

        let (_remote_reader, mut remote_writer) = tokio::io::split(remote);
        let key = CacheKey::new(Uuid::from_u128(1), call_id);
        let frame = Frame::message(Command::NoMethod, key, encode_message("missing"));
        remote_writer.write_all(&frame.to_bytes()).await.unwrap();

        match reply.await.unwrap() {
            Reply::Error(RemoteError::NoMethod(message)) => assert_eq!(message, "missing"),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_peer_eof_fails_pending_calls() {
        let (local, remote) = duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let conn = Connection::spawn(
            "test",
            reader,
            writer,
            Arc::new(ServerDispatcher::new()),
            &TransportConfig::default(),
        );

        let call_id = conn.correlator().next_call_id();
        let reply = conn.correlator().register(call_id).unwrap();
        drop(remote);

        match reply.await.unwrap() {
            Reply::Error(e) => assert!(e.is_communication()),
            other => panic!("unexpected reply: {:?}", other),
        }
        conn.closed().await;
        assert!(conn.is_closed());
        assert!(conn.correlator().register(conn.correlator().next_call_id()).is_err());
    }

    #[tokio::test]
    async fn test_corrupted_frame_closes() {
        let (local, mut remote) = duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let conn = Connection::spawn(
            "test",
            reader,
            writer,
            Arc::new(ServerDispatcher::new()),
            &TransportConfig::default(),
        );

        remote.write_all(&[9, 0, 0, 21]).await.unwrap();
        let reason = conn.closed().await;
        assert!(reason.contains("Corrupted"), "{}", reason);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, _remote) = duplex(4096);
        let (reader, writer) = tokio::io::split(local);
        let conn = Connection::spawn(
            "test",
            reader,
            writer,
            Arc::new(ServerDispatcher::new()),
            &TransportConfig::default(),
        );

        conn.close();
        conn.close();
        assert_eq!(conn.closed().await, "Connection closed locally");
        assert!(conn.is_closed());
    }
}
