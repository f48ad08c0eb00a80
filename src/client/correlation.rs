//! Call-id correlation for outbound calls.
//!
//! Every call with a response registers a pending entry under its call id.
//! Terminal responses remove the entry; STREAM_DATA looks it up and keeps
//! it. Losing the connection fails every entry with the same
//! communication error.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::RemoteError;
use crate::protocol::payload::decode_message;
use crate::protocol::{Command, Frame};

/// Terminal answer to a call.
#[derive(Debug)]
pub enum Reply {
    /// SUCCESS payload.
    Success(Bytes),
    /// FAILURE payload (a serialized `ServiceError`).
    Failure(Bytes),
    /// Protocol-level rejection or transport failure.
    Error(RemoteError),
}

/// One delivery on an open stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// STREAM_DATA payload.
    Data(Bytes),
    /// STREAM_CLOSE.
    Close,
    /// STREAM_ERROR, UNKNOWN_ERROR or connection loss.
    Error(RemoteError),
}

enum Pending {
    Unary(oneshot::Sender<Reply>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

/// Map an error-class response to the caller-visible error.
pub fn remote_error(command: Command, payload: &[u8]) -> RemoteError {
    let message = decode_message(payload);
    match command {
        Command::NoService => RemoteError::NoService(message),
        Command::NoMethod => RemoteError::NoMethod(message),
        Command::ServerOverloaded => RemoteError::ServerOverloaded(message),
        Command::ArgsSerializationError => RemoteError::ArgsSerialization(message),
        Command::ReturnSerializationError => RemoteError::ReturnSerialization(message),
        Command::FailureSerializationError => RemoteError::FailureSerialization(message),
        Command::AsyncParamError => RemoteError::AsyncParam(message),
        Command::StreamError => RemoteError::Stream(message),
        _ => RemoteError::Unknown(message),
    }
}

/// Pending calls of one connection.
#[derive(Default)]
pub struct Correlator {
    next_id: AtomicI32,
    pending: DashMap<i32, Pending>,
    closed: AtomicBool,
}

impl Correlator {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a call id not currently in use.
    pub fn next_call_id(&self) -> i32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&self, call_id: i32, pending: Pending) -> Result<(), RemoteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        self.pending.insert(call_id, pending);
        // fail_all may have drained between the check and the insert.
        if self.closed.load(Ordering::Acquire) && self.pending.remove(&call_id).is_some() {
            return Err(closed_error());
        }
        Ok(())
    }

    /// Register a call expecting one terminal reply.
    pub fn register(&self, call_id: i32) -> Result<oneshot::Receiver<Reply>, RemoteError> {
        let (tx, rx) = oneshot::channel();
        self.insert(call_id, Pending::Unary(tx))?;
        Ok(rx)
    }

    /// Register an opened stream under its call id.
    pub fn register_stream(&self, call_id: i32) -> Result<mpsc::UnboundedReceiver<StreamEvent>, RemoteError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(call_id, Pending::Stream(tx))?;
        Ok(rx)
    }

    /// Forget a call (timeout or caller gave up). Returns true if it was pending.
    pub fn remove(&self, call_id: i32) -> bool {
        self.pending.remove(&call_id).is_some()
    }

    /// Number of pending calls and streams.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True after [`fail_all`](Self::fail_all).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Route one response frame.
    pub fn handle_response(&self, frame: Frame) {
        let command = frame.command();
        let call_id = frame.call_id();

        match command {
            Command::StreamData => {
                let delivered = match self.pending.get(&call_id).as_deref() {
                    Some(Pending::Stream(tx)) => tx.send(StreamEvent::Data(frame.payload)).is_ok(),
                    _ => false,
                };
                if !delivered {
                    trace!(call_id, "Stream data for an unknown stream, dropped");
                }
            }
            Command::AsyncParamError => {
                // Keyed by the call, which keeps waiting for its own response.
                warn!(
                    call_id,
                    message = %decode_message(frame.payload()),
                    "Peer rejected an async argument"
                );
            }
            _ => self.complete(call_id, command, frame.payload),
        }
    }

    fn complete(&self, call_id: i32, command: Command, payload: Bytes) {
        let Some((_, pending)) = self.pending.remove(&call_id) else {
            debug!(call_id, ?command, "Response for an unknown call, dropped");
            return;
        };
        match pending {
            Pending::Unary(tx) => {
                let reply = match command {
                    Command::Success => Reply::Success(payload),
                    Command::Failure => Reply::Failure(payload),
                    other => Reply::Error(remote_error(other, &payload)),
                };
                let _ = tx.send(reply);
            }
            Pending::Stream(tx) => {
                let event = match command {
                    Command::StreamClose => StreamEvent::Close,
                    other => StreamEvent::Error(remote_error(other, &payload)),
                };
                let _ = tx.send(event);
            }
        }
    }

    /// Fail everything pending and refuse new registrations.
    pub fn fail_all(&self, error: RemoteError) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<i32> = self.pending.iter().map(|e| *e.key()).collect();
        if !ids.is_empty() {
            debug!(pending = ids.len(), %error, "Failing pending calls");
        }
        for id in ids {
            match self.pending.remove(&id) {
                Some((_, Pending::Unary(tx))) => {
                    let _ = tx.send(Reply::Error(error.clone()));
                }
                Some((_, Pending::Stream(tx))) => {
                    let _ = tx.send(StreamEvent::Error(error.clone()));
                }
                None => {}
            }
        }
    }
}

fn closed_error() -> RemoteError {
    RemoteError::Communication("Connection is closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::encode_message;
    use crate::protocol::CacheKey;
    use uuid::Uuid;

    fn frame(command: Command, call_id: i32, payload: &'static [u8]) -> Frame {
        Frame::message(
            command,
            CacheKey::new(Uuid::from_u128(1), call_id),
            Bytes::from_static(payload),
        )
    }

    #[tokio::test]
    async fn test_success_resolves_and_removes() {
        let correlator = Correlator::new();
        let id = correlator.next_call_id();
        let rx = correlator.register(id).unwrap();

        correlator.handle_response(frame(Command::Success, id, b"\x1e"));
        assert!(matches!(rx.await.unwrap(), Reply::Success(b) if b.as_ref() == b"\x1e"));
        assert_eq!(correlator.pending_count(), 0);

        // A duplicate answer is dropped.
        correlator.handle_response(frame(Command::Success, id, b"\x1e"));
    }

    #[tokio::test]
    async fn test_error_class_mapping() {
        let correlator = Correlator::new();
        let id = correlator.next_call_id();
        let rx = correlator.register(id).unwrap();

        let key = CacheKey::new(Uuid::from_u128(1), id);
        correlator.handle_response(Frame::message(
            Command::ServerOverloaded,
            key,
            encode_message("busy"),
        ));
        match rx.await.unwrap() {
            Reply::Error(RemoteError::ServerOverloaded(m)) => assert_eq!(m, "busy"),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_async_param_error_keeps_call() {
        let correlator = Correlator::new();
        let id = correlator.next_call_id();
        let _rx = correlator.register(id).unwrap();

        correlator.handle_response(frame(Command::AsyncParamError, id, b"late"));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_events() {
        let correlator = Correlator::new();
        let id = correlator.next_call_id();
        let mut rx = correlator.register_stream(id).unwrap();

        correlator.handle_response(frame(Command::StreamData, id, b"\x01"));
        correlator.handle_response(frame(Command::StreamData, id, b"\x02"));
        correlator.handle_response(frame(Command::StreamClose, id, b""));
        correlator.handle_response(frame(Command::StreamData, id, b"\x03"));

        assert!(matches!(rx.recv().await, Some(StreamEvent::Data(_))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Data(_))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Close)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let correlator = Correlator::new();
        let a = correlator.register(correlator.next_call_id()).unwrap();
        let mut s = correlator.register_stream(correlator.next_call_id()).unwrap();

        correlator.fail_all(RemoteError::Communication("reset".into()));

        assert!(matches!(a.await.unwrap(), Reply::Error(e) if e.is_communication()));
        assert!(matches!(s.recv().await, Some(StreamEvent::Error(e)) if e.is_communication()));
        assert!(correlator.register(99).is_err());
        assert!(correlator.is_closed());
    }

    #[test]
    fn test_call_ids_unique() {
        let correlator = Correlator::new();
        let first = correlator.next_call_id();
        let _rx = correlator.register(first).unwrap();
        assert_ne!(correlator.next_call_id(), first);
    }
}
