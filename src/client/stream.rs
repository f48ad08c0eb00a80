//! Client side of a streaming return.
//!
//! A [`RemoteStream`] is created after the call's SUCCESS carried a stream
//! key and CLIENT_OPEN has been sent. It yields decoded elements and
//! replenishes credit every `credit_batch` elements. Stopping it early
//! (cancel, close or drop) tells the server to stop producing; elements
//! still in flight are discarded.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::correlation::{Correlator, StreamEvent};
use crate::error::RemoteError;
use crate::protocol::payload::encode_credit;
use crate::protocol::{CacheKey, Command, Frame};
use crate::writer::WriterHandle;

pub(crate) type DecodeFn<R> = Box<dyn Fn(&[u8]) -> Result<R, RemoteError> + Send + Sync>;

/// Elements of a remote push-stream.
pub struct RemoteStream<R> {
    key: CacheKey,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    decode: DecodeFn<R>,
    writer: WriterHandle,
    correlator: Arc<Correlator>,
    credit_batch: i32,
    consumed: i32,
    stopping: bool,
    finished: bool,
}

impl<R> fmt::Debug for RemoteStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("key", &self.key)
            .field("stopping", &self.stopping)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<R> RemoteStream<R> {
    pub(crate) fn new(
        key: CacheKey,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        decode: DecodeFn<R>,
        writer: WriterHandle,
        correlator: Arc<Correlator>,
        credit_batch: i32,
    ) -> Self {
        Self {
            key,
            events,
            decode,
            writer,
            correlator,
            credit_batch: credit_batch.max(1),
            consumed: 0,
            stopping: false,
            finished: false,
        }
    }

    /// Stream key assigned by the server.
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// True once STREAM_CLOSE or STREAM_ERROR was received.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Ask the server to stop producing (CLIENT_BACK_PRESSURE with a
    /// negative credit). The stream ends once STREAM_CLOSE arrives.
    pub async fn cancel(&mut self) -> Result<(), RemoteError> {
        self.stop(Command::ClientBackPressure, encode_credit(-1)).await
    }

    /// Close the stream (CLIENT_CLOSE). The stream ends once STREAM_CLOSE
    /// arrives.
    pub async fn close(&mut self) -> Result<(), RemoteError> {
        self.stop(Command::ClientClose, Bytes::new()).await
    }

    async fn stop(&mut self, command: Command, payload: Bytes) -> Result<(), RemoteError> {
        if self.finished || self.stopping {
            return Ok(());
        }
        self.stopping = true;
        debug!(call_id = self.key.call_id, ?command, "Stopping stream");
        self.writer
            .send_frame(Frame::message(command, self.key, payload))
            .await
            .map_err(RemoteError::from)
    }

    fn control(&self, command: Command, payload: Bytes) {
        let frame = Frame::message(command, self.key, payload);
        if let Err(e) = self.writer.try_send(frame.clone().into()) {
            trace!(call_id = self.key.call_id, error = %e, "Writer busy, sending control frame later");
            let writer = self.writer.clone();
            tokio::spawn(async move {
                let _ = writer.send_frame(frame).await;
            });
        }
    }
}

impl<R> Stream for RemoteStream<R> {
    type Item = Result<R, RemoteError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match this.events.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(StreamEvent::Data(bytes))) => {
                    if this.stopping {
                        continue;
                    }
                    this.consumed += 1;
                    if this.consumed >= this.credit_batch {
                        this.consumed = 0;
                        this.control(Command::ClientBackPressure, encode_credit(this.credit_batch));
                    }
                    return Poll::Ready(Some((this.decode)(&bytes)));
                }
                Poll::Ready(Some(StreamEvent::Close)) | Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(StreamEvent::Error(error))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(error)));
                }
            }
        }
    }
}

impl<R> Drop for RemoteStream<R> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.correlator.remove(self.key.call_id);
        if !self.stopping {
            let frame = Frame::message(Command::ClientClose, self.key, Bytes::new());
            let _ = self.writer.try_send(frame.into());
        }
    }
}
