//! Dedicated writer task for high-throughput frame sending.
//!
//! Every connection owns one writer task that receives frames via an mpsc
//! channel. Callers never lock the socket; frames are batched into single
//! vectored writes.
//!
//! # Architecture
//!
//! ```text
//! Proxy calls   ─┐
//! Invoker tasks ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! Stream tasks  ─┘
//! ```
//!
//! Frames are written in the order they were queued, which gives the
//! per-connection FIFO guarantee. A frame may carry a flush notifier that
//! fires once the batch holding it has been written and flushed (or failed).
//! Callers that must order a follow-up frame after a call frame, or that
//! need to observe write failures, wait on that notifier.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::protocol::{Frame, Header, ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Receives the outcome of writing one frame.
pub type FlushReceiver = oneshot::Receiver<Result<()>>;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for CANCEL, STREAM_CLOSE, etc.).
    pub payload: Bytes,
    /// Notified after the frame is flushed or the write fails.
    flushed: Option<oneshot::Sender<Result<()>>>,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
            flushed: None,
        }
    }

    /// Create a new outbound frame with empty payload.
    #[inline]
    pub fn empty(header: &Header) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Attach a flush notifier and return its receiving end.
    pub fn with_flush_notifier(mut self) -> (Self, FlushReceiver) {
        let (tx, rx) = oneshot::channel();
        self.flushed = Some(tx);
        (self, rx)
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    fn notify(&mut self, outcome: Result<()>) {
        if let Some(tx) = self.flushed.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl From<Frame> for OutboundFrame {
    fn from(frame: Frame) -> Self {
        Self::new(&frame.header, frame.payload)
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    #[serde(with = "crate::config::millis")]
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    /// Channel sender for frames.
    tx: mpsc::Sender<OutboundFrame>,
    /// Pending frame count (for backpressure).
    pending: Arc<AtomicUsize>,
    /// Maximum pending frames.
    max_pending: usize,
    /// Backpressure timeout.
    timeout: Duration,
    /// Largest payload the peer accepts.
    max_payload: u32,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
            max_payload: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Refuse payloads above `max_payload` (capped at the wire limit).
    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload.min(ABSOLUTE_MAX_PAYLOAD_SIZE);
        self
    }

    /// Largest payload this handle queues.
    #[inline]
    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    fn check_size(&self, frame: &OutboundFrame) -> Result<()> {
        if frame.payload.len() > self.max_payload as usize {
            return Err(Error::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.max_payload,
            });
        }
        Ok(())
    }

    /// Send a frame to the writer task.
    ///
    /// This method will wait if backpressure is active, timing out after
    /// the configured duration. Oversized payloads are refused with
    /// [`Error::PayloadTooLarge`] and nothing is queued.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.check_size(&frame)?;
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Increment pending count BEFORE sending
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            Error::ConnectionClosed
        })
    }

    /// Queue a protocol frame.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.send(frame.into()).await
    }

    /// Queue a protocol frame and wait until it has been flushed.
    ///
    /// Returns the write error if the socket failed while writing it.
    pub async fn send_flushed(&self, frame: Frame) -> Result<()> {
        let (frame, flushed) = OutboundFrame::from(frame).with_flush_notifier();
        self.send(frame).await?;
        wait_flushed(flushed).await
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }

            if start.elapsed() > self.timeout {
                return Err(Error::BackpressureTimeout);
            }

            tokio::time::sleep(check_interval).await;
        }
    }

    /// Check if backpressure is currently active.
    ///
    /// Stream producers use this as the writability signal of the socket.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True once the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Try to send a frame without waiting for backpressure.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.check_size(&frame)?;
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(Error::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => Error::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => Error::ConnectionClosed,
            }
        })
    }
}

/// Wait on a flush notifier. A dropped notifier means the writer died.
pub async fn wait_flushed(flushed: FlushReceiver) -> Result<()> {
    flushed.await.unwrap_or(Err(Error::ConnectionClosed))
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The returned `JoinHandle` resolves when the channel closes (all handles
/// dropped) or the first write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let outcome = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);

        match outcome {
            Ok(()) => {
                trace!(frames = batch_size, "Batch flushed");
                for frame in &mut batch {
                    frame.notify(Ok(()));
                }
            }
            Err(e) => {
                error!(error = %e, "Writer failed, closing connection");
                for frame in &mut batch {
                    frame.notify(Err(copy_error(&e)));
                }
                rx.close();
                while let Some(mut frame) = rx.recv().await {
                    pending.fetch_sub(1, Ordering::Release);
                    frame.notify(Err(Error::ConnectionClosed));
                }
                return Err(e);
            }
        }
    }
}

fn copy_error(err: &Error) -> Error {
    match err {
        Error::Io(io) => Error::Io(std::io::Error::new(io.kind(), io.to_string())),
        _ => Error::ConnectionClosed,
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);

    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    let written = writer.write_vectored(&slices).await?;

    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }

    if written == 0 {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    // Partial write, continue with remaining data
    let mut total_written = written;

    while total_written < total_size {
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        let header_start = skipped;
        let header_end = skipped + HEADER_SIZE;

        if skip_bytes < header_end {
            let start_in_header = skip_bytes.saturating_sub(header_start);
            slices.push(IoSlice::new(&frame.header[start_in_header..]));
        }
        skipped = header_end;

        if !frame.payload.is_empty() {
            let payload_start = skipped;
            let payload_end = skipped + frame.payload.len();

            if skip_bytes < payload_end {
                let start_in_payload = skip_bytes.saturating_sub(payload_start);
                slices.push(IoSlice::new(&frame.payload[start_in_payload..]));
            }
            skipped = payload_end;
        }
    }

    slices
}
