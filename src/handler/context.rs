//! Response context for dispatched calls.
//!
//! Provides methods for answering one request:
//! - `outcome` - SUCCESS / FAILURE / staged serialization errors
//! - `reject` - error-class responses (NO_SERVICE, NO_METHOD, ...)
//! - `stream_data` / `stream_close` / `stream_error` - streaming frames
//!
//! Call responses are only written when the request expects one
//! (CALL_WITH_RETURN). Everything else the engine writes regardless.

use bytes::Bytes;
use tracing::{trace, warn};

use super::returns::{Outcome, ResponseBody};
use crate::error::{Error, Result};
use crate::protocol::payload::encode_message;
use crate::protocol::{CacheKey, Command, Frame};
use crate::writer::WriterHandle;

/// Writes responses for one `(service_id, call_id)` key.
///
/// `ResponseContext` is `Clone` and can be moved into completion callbacks
/// and producer tasks.
#[derive(Clone, Debug)]
pub struct ResponseContext {
    key: CacheKey,
    expects_response: bool,
    writer: WriterHandle,
}

impl ResponseContext {
    /// Create a context for a request.
    pub fn new(key: CacheKey, expects_response: bool, writer: WriterHandle) -> Self {
        Self {
            key,
            expects_response,
            writer,
        }
    }

    /// Key this context answers for.
    #[inline]
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// True for CALL_WITH_RETURN.
    #[inline]
    pub fn expects_response(&self) -> bool {
        self.expects_response
    }

    /// Writer of the connection the request arrived on.
    #[inline]
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    /// Write the response for a finished call.
    pub async fn outcome(&self, outcome: Outcome) -> Result<()> {
        if !self.expects_response {
            if let Outcome::Panic(message) = &outcome {
                warn!(call_id = self.key.call_id, %message, "Fire-and-forget call panicked");
            }
            return Ok(());
        }
        let (command, body) = outcome.into_response();
        let payload = match body {
            ResponseBody::Bytes(bytes) => bytes,
            ResponseBody::Message(message) => encode_message(&message),
        };
        self.send_response(command, payload).await
    }

    /// Write a SUCCESS frame with a raw payload.
    pub async fn success(&self, payload: Bytes) -> Result<()> {
        if !self.expects_response {
            return Ok(());
        }
        self.send_response(Command::Success, payload).await
    }

    /// Write an error-class response, honoring fire-and-forget.
    pub async fn reject(&self, command: Command, message: &str) -> Result<()> {
        if !self.expects_response {
            trace!(?command, call_id = self.key.call_id, "Dropping rejection for fire-and-forget call");
            return Ok(());
        }
        self.error(command, message).await
    }

    /// Write an error-class frame unconditionally.
    pub async fn error(&self, command: Command, message: &str) -> Result<()> {
        debug_assert!(command.is_error_class());
        let mut payload = encode_message(message);
        payload.truncate(self.writer.max_payload() as usize);
        self.send(command, payload).await
    }

    /// Write one stream element.
    pub async fn stream_data(&self, payload: Bytes) -> Result<()> {
        self.send(Command::StreamData, payload).await
    }

    /// End the stream normally.
    pub async fn stream_close(&self) -> Result<()> {
        self.send(Command::StreamClose, Bytes::new()).await
    }

    /// End the stream abnormally.
    pub async fn stream_error(&self, message: &str) -> Result<()> {
        self.error(Command::StreamError, message).await
    }

    /// Send a call response. A SUCCESS or FAILURE payload the peer would
    /// refuse becomes the matching serialization error instead.
    async fn send_response(&self, command: Command, payload: Bytes) -> Result<()> {
        match self.send(command, payload).await {
            Err(Error::PayloadTooLarge { size, max }) => {
                let fallback = if command == Command::Failure {
                    Command::FailureSerializationError
                } else {
                    Command::ReturnSerializationError
                };
                warn!(call_id = self.key.call_id, size, max, ?fallback, "Response payload too large");
                let message = format!("Serialized {:?} payload of {} bytes exceeds maximum {}", command, size, max);
                self.error(fallback, &message).await
            }
            other => other,
        }
    }

    async fn send(&self, command: Command, payload: Bytes) -> Result<()> {
        self.writer
            .send_frame(Frame::message(command, self.key, payload))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;
    use crate::writer::spawn_writer_task_default;
    use tokio::io::{duplex, AsyncReadExt};
    use uuid::Uuid;

    async fn read_frames(server: &mut tokio::io::DuplexStream) -> Vec<Frame> {
        let mut buf = vec![0u8; 4096];
        let n = server.read(&mut buf).await.unwrap();
        FrameBuffer::new().push(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_fire_and_forget_writes_no_call_response() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let key = CacheKey::new(Uuid::from_u128(5), 1);

        let ctx = ResponseContext::new(key, false, writer);
        ctx.outcome(Outcome::Value(Bytes::from_static(b"x")))
            .await
            .unwrap();
        ctx.reject(Command::NoMethod, "nope").await.unwrap();
        ctx.stream_close().await.unwrap();

        let frames = read_frames(&mut server).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command(), Command::StreamClose);
    }

    #[tokio::test]
    async fn test_error_message_truncated() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let key = CacheKey::new(Uuid::from_u128(5), 2);

        let ctx = ResponseContext::new(key, true, writer);
        ctx.reject(Command::NoService, &"x".repeat(1000)).await.unwrap();

        let frames = read_frames(&mut server).await;
        assert_eq!(frames[0].command(), Command::NoService);
        assert_eq!(frames[0].payload().len(), 256);
        assert_eq!(frames[0].key(), key);
    }

    #[tokio::test]
    async fn test_oversized_response_becomes_serialization_error() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let writer = writer.with_max_payload(16);
        let key = CacheKey::new(Uuid::from_u128(5), 3);

        let ctx = ResponseContext::new(key, true, writer);
        ctx.outcome(Outcome::Value(Bytes::from(vec![7u8; 100])))
            .await
            .unwrap();
        let frames = read_frames(&mut server).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command(), Command::ReturnSerializationError);
        assert_eq!(frames[0].key(), key);
        assert_eq!(frames[0].payload().len(), 16);

        ctx.outcome(Outcome::Failure(Bytes::from(vec![7u8; 100])))
            .await
            .unwrap();
        let frames = read_frames(&mut server).await;
        assert_eq!(frames[0].command(), Command::FailureSerializationError);

        ctx.outcome(Outcome::Value(Bytes::from_static(b"small")))
            .await
            .unwrap();
        let frames = read_frames(&mut server).await;
        assert_eq!(frames[0].command(), Command::Success);
        assert_eq!(frames[0].payload(), b"small");
    }
}
