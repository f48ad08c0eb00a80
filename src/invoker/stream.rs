//! Server side of the streaming sub-protocol.
//!
//! A [`DataStream`] is created when a stream-returning call succeeds. It
//! holds the element source until the client sends CLIENT_OPEN, then a
//! producer task pushes STREAM_DATA frames, one per unit of credit, pausing
//! while the connection's writer is saturated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::backpressure::{StreamCredit, WritabilityBackoff};
use crate::config::StreamConfig;
use crate::error::Error;
use crate::handler::{ByteStream, ResponseContext};

/// How a producer ended.
#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    Closed,
    Failed(String),
    Lost,
}

/// One open streaming call.
pub struct DataStream {
    ctx: ResponseContext,
    credit: StreamCredit,
    source: Mutex<Option<ByteStream>>,
    opened: AtomicBool,
    producer: Mutex<Option<AbortHandle>>,
}

impl DataStream {
    /// Wrap a source waiting for CLIENT_OPEN.
    pub fn new(ctx: ResponseContext, source: ByteStream) -> Self {
        Self {
            ctx,
            credit: StreamCredit::new(),
            source: Mutex::new(Some(source)),
            opened: AtomicBool::new(false),
            producer: Mutex::new(None),
        }
    }

    /// True once CLIENT_OPEN arrived.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Start the producer with `initial_credit`.
    ///
    /// `on_finish` runs after the final STREAM_CLOSE / STREAM_ERROR frame is
    /// queued. Returns false if the stream was already open.
    pub fn open<F>(self: &Arc<Self>, initial_credit: i32, config: &StreamConfig, on_finish: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.opened.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Some(source) = self.source.lock().take() else {
            return false;
        };

        self.credit.grant(initial_credit);
        let task = tokio::spawn(produce(self.clone(), source, config.clone(), on_finish));
        *self.producer.lock() = Some(task.abort_handle());
        true
    }

    /// Apply a CLIENT_BACK_PRESSURE value.
    pub fn grant(&self, credit: i32) {
        self.credit.grant(credit);
    }

    /// Credit left before the producer pauses.
    pub fn credit(&self) -> i64 {
        self.credit.available()
    }

    /// Ask the producer to stop; it confirms with STREAM_CLOSE.
    pub fn close(&self) {
        self.credit.close();
    }

    /// Stop without writing anything (connection gone).
    pub fn abort(&self) {
        self.credit.close();
        self.source.lock().take();
        if let Some(producer) = self.producer.lock().take() {
            producer.abort();
        }
    }

    /// Context writing this stream's frames.
    pub fn context(&self) -> &ResponseContext {
        &self.ctx
    }
}

async fn produce<F>(stream: Arc<DataStream>, mut source: ByteStream, config: StreamConfig, on_finish: F)
where
    F: FnOnce(),
{
    let ctx = stream.ctx.clone();
    let call_id = ctx.key().call_id;
    let mut backoff = WritabilityBackoff::new(&config);
    let mut sent = 0u64;

    let end = loop {
        if !stream.credit.acquire().await {
            break StreamEnd::Closed;
        }
        let next = tokio::select! {
            biased;
            _ = stream.credit.closed() => break StreamEnd::Closed,
            next = source.next() => next,
        };
        match next {
            None => break StreamEnd::Closed,
            Some(Err(message)) => break StreamEnd::Failed(message),
            Some(Ok(element)) => {
                if stream.credit.is_closed() {
                    break StreamEnd::Closed;
                }
                if backoff.wait_writable(ctx.writer()).await.is_err() {
                    warn!(
                        call_id,
                        retries = backoff.not_writable_count(),
                        "Stream is not writable, giving up"
                    );
                    break StreamEnd::Failed("Stream consumer is not keeping up".to_string());
                }
                match ctx.stream_data(element).await {
                    Ok(()) => {}
                    Err(Error::PayloadTooLarge { size, max }) => {
                        warn!(call_id, size, max, "Stream element too large");
                        break StreamEnd::Failed(format!(
                            "Stream element of {} bytes exceeds maximum {}",
                            size, max
                        ));
                    }
                    Err(_) => break StreamEnd::Lost,
                }
                sent += 1;
                trace!(call_id, sent, "Stream element sent");
            }
        }
    };

    debug!(call_id, sent, end = ?end, "Stream finished");
    let written = match &end {
        StreamEnd::Closed => ctx.stream_close().await,
        StreamEnd::Failed(message) => ctx.stream_error(message).await,
        StreamEnd::Lost => Ok(()),
    };
    if let Err(e) = written {
        debug!(call_id, error = %e, "Could not write end of stream");
    }
    on_finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CacheKey, Command, Frame, FrameBuffer};
    use crate::writer::spawn_writer_task_default;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::sync::oneshot;
    use uuid::Uuid;

    fn numbers(n: u8) -> ByteStream {
        futures::stream::iter((1..=n).map(|i| Ok(Bytes::from(vec![i])))).boxed()
    }

    async fn collect(server: &mut DuplexStream, until: Command) -> Vec<Frame> {
        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 1024];
        loop {
            let n = server.read(&mut buf).await.unwrap();
            frames.extend(buffer.push(&buf[..n]).unwrap());
            if frames.iter().any(|f| f.command() == until) {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn test_stream_produces_then_closes() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let ctx = ResponseContext::new(CacheKey::new(Uuid::from_u128(1), 7), true, writer);

        let stream = Arc::new(DataStream::new(ctx, numbers(3)));
        let (done_tx, done_rx) = oneshot::channel();
        assert!(stream.open(16, &StreamConfig::default(), move || {
            let _ = done_tx.send(());
        }));
        assert!(!stream.open(16, &StreamConfig::default(), || {}));

        let frames = collect(&mut server, Command::StreamClose).await;
        let commands: Vec<_> = frames.iter().map(|f| f.command()).collect();
        assert_eq!(
            commands,
            vec![
                Command::StreamData,
                Command::StreamData,
                Command::StreamData,
                Command::StreamClose
            ]
        );
        assert_eq!(frames[2].payload(), &[3]);
        done_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_credit_limits_production() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let ctx = ResponseContext::new(CacheKey::new(Uuid::from_u128(1), 8), true, writer);

        let stream = Arc::new(DataStream::new(ctx, numbers(10)));
        stream.open(2, &StreamConfig::default(), || {});

        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        let frames = FrameBuffer::new().push(&buf[..n]).unwrap();
        assert_eq!(frames.len(), 2);

        stream.grant(-1);
        let frames = collect(&mut server, Command::StreamClose).await;
        assert!(frames.iter().all(|f| f.command() != Command::StreamData));
    }

    #[tokio::test]
    async fn test_source_error_ends_with_stream_error() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let ctx = ResponseContext::new(CacheKey::new(Uuid::from_u128(1), 9), true, writer);

        let source = futures::stream::iter(vec![Ok(Bytes::from_static(b"a")), Err("broken".to_string())]).boxed();
        let stream = Arc::new(DataStream::new(ctx, source));
        stream.open(8, &StreamConfig::default(), || {});

        let frames = collect(&mut server, Command::StreamError).await;
        let last = frames.last().unwrap();
        assert_eq!(last.payload(), b"broken");
    }

    #[tokio::test]
    async fn test_idle_source_observes_close() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let ctx = ResponseContext::new(CacheKey::new(Uuid::from_u128(1), 10), true, writer);

        let source = futures::stream::iter(vec![Ok(Bytes::from_static(b"a"))])
            .chain(futures::stream::pending())
            .boxed();
        let stream = Arc::new(DataStream::new(ctx, source));
        let (done_tx, done_rx) = oneshot::channel();
        stream.open(8, &StreamConfig::default(), move || {
            let _ = done_tx.send(());
        });

        let frames = collect(&mut server, Command::StreamData).await;
        assert_eq!(frames.len(), 1);
        assert!(stream.credit() < 8);

        stream.grant(-1);
        let frames = tokio::time::timeout(Duration::from_secs(2), collect(&mut server, Command::StreamClose))
            .await
            .unwrap();
        assert_eq!(frames.last().unwrap().command(), Command::StreamClose);
        tokio::time::timeout(Duration::from_secs(2), done_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_element_ends_with_stream_error() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let writer = writer.with_max_payload(64);
        let ctx = ResponseContext::new(CacheKey::new(Uuid::from_u128(1), 11), true, writer);

        let source = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"fits")),
            Ok(Bytes::from(vec![0u8; 65])),
            Ok(Bytes::from_static(b"never")),
        ])
        .boxed();
        let stream = Arc::new(DataStream::new(ctx, source));
        stream.open(8, &StreamConfig::default(), || {});

        let frames = collect(&mut server, Command::StreamError).await;
        let commands: Vec<_> = frames.iter().map(|f| f.command()).collect();
        assert_eq!(commands, vec![Command::StreamData, Command::StreamError]);
        assert_eq!(frames[0].payload(), b"fits");
    }
}
