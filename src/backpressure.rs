//! Flow control for streaming returns.
//!
//! Two independent brakes apply to a stream producer:
//!
//! - [`StreamCredit`]: consumer-driven credit. CLIENT_OPEN grants an initial
//!   window, each STREAM_DATA frame consumes one unit and
//!   CLIENT_BACK_PRESSURE adds more. A negative grant closes the stream.
//! - [`WritabilityBackoff`]: producer-side self-throttling. When the
//!   connection's writer reports back pressure, the producer pauses for an
//!   exponentially growing window (capped) and gives up past a fixed number
//!   of consecutive not-writable checks.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::writer::WriterHandle;

/// Credit window of one stream. Shared between the dispatcher (which grants)
/// and the producer task (which consumes).
#[derive(Debug, Default)]
pub struct StreamCredit {
    credit: AtomicI64,
    closed: AtomicBool,
    changed: Notify,
}

impl StreamCredit {
    /// Create an empty, open window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a CLIENT_BACK_PRESSURE value: non-negative adds credit,
    /// negative closes.
    pub fn grant(&self, credit: i32) {
        if credit < 0 {
            self.close();
            return;
        }
        self.credit.fetch_add(i64::from(credit), Ordering::AcqRel);
        self.changed.notify_waiters();
    }

    /// Stop the stream. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// True once closed by the consumer.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current credit.
    #[inline]
    pub fn available(&self) -> i64 {
        self.credit.load(Ordering::Acquire)
    }

    /// Resolve once the stream is closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Wait for one unit of credit and take it.
    ///
    /// Returns `false` if the stream was closed instead.
    pub async fn acquire(&self) -> bool {
        loop {
            // Register interest before checking so a grant between the
            // check and the await is not lost.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return false;
            }
            let current = self.credit.load(Ordering::Acquire);
            if current > 0
                && self
                    .credit
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return true;
            }
            if current > 0 {
                continue;
            }

            notified.await;
        }
    }
}

/// Exponential pause applied while the socket is not writable.
#[derive(Debug, Clone)]
pub struct WritabilityBackoff {
    not_writable: u32,
    base: Duration,
    cap: Duration,
    max_retries: u32,
}

impl WritabilityBackoff {
    /// Create a backoff from stream settings.
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            not_writable: 0,
            base: config.backoff_base,
            cap: config.backoff_cap,
            max_retries: config.max_retries,
        }
    }

    /// Number of consecutive not-writable checks so far.
    #[inline]
    pub fn not_writable_count(&self) -> u32 {
        self.not_writable
    }

    /// Pause window for the current counter value.
    pub fn delay(&self) -> Duration {
        let shift = self.not_writable.min(16);
        self.base.saturating_mul(1u32 << shift).min(self.cap)
    }

    /// Record one check. Returns the pause to apply, or an error when the
    /// retry ceiling is exceeded.
    pub fn record(&mut self, writable: bool) -> Result<Option<Duration>> {
        if writable {
            self.not_writable = 0;
            return Ok(None);
        }
        if self.not_writable >= self.max_retries {
            return Err(Error::BackpressureTimeout);
        }
        let delay = self.delay();
        self.not_writable += 1;
        Ok(Some(delay))
    }

    /// Wait until `writer` accepts frames again.
    pub async fn wait_writable(&mut self, writer: &WriterHandle) -> Result<()> {
        while let Some(delay) = self.record(!writer.is_backpressure_active())? {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(max_retries: u32) -> StreamConfig {
        StreamConfig {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(8),
            max_retries,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = WritabilityBackoff::new(&config(10));

        let delays: Vec<_> = (0..6)
            .map(|_| backoff.record(false).unwrap().unwrap())
            .collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 8, 8].map(Duration::from_millis).to_vec()
        );
        assert_eq!(backoff.not_writable_count(), 6);

        assert_eq!(backoff.record(true).unwrap(), None);
        assert_eq!(backoff.not_writable_count(), 0);
    }

    #[test]
    fn test_backoff_gives_up() {
        let mut backoff = WritabilityBackoff::new(&config(2));
        backoff.record(false).unwrap();
        backoff.record(false).unwrap();
        assert!(matches!(
            backoff.record(false),
            Err(Error::BackpressureTimeout)
        ));
    }

    #[tokio::test]
    async fn test_credit_acquire_waits_for_grant() {
        let credit = Arc::new(StreamCredit::new());
        credit.grant(1);
        assert!(credit.acquire().await);
        assert_eq!(credit.available(), 0);

        let waiter = {
            let credit = credit.clone();
            tokio::spawn(async move { credit.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        credit.grant(2);
        assert!(waiter.await.unwrap());
        assert_eq!(credit.available(), 1);
    }

    #[tokio::test]
    async fn test_negative_grant_closes() {
        let credit = Arc::new(StreamCredit::new());
        let waiter = {
            let credit = credit.clone();
            tokio::spawn(async move { credit.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        credit.grant(-1);
        assert!(!waiter.await.unwrap());
        assert!(credit.is_closed());
    }

    #[tokio::test]
    async fn test_closed_wakes_on_close() {
        let credit = Arc::new(StreamCredit::new());
        let waiter = {
            let credit = credit.clone();
            tokio::spawn(async move { credit.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        credit.grant(3);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        credit.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
