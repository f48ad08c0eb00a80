//! Transport configuration.
//!
//! Every struct derives `Deserialize` with `#[serde(default)]`, so a host can
//! load partial configuration from any serde format. Durations are given in
//! milliseconds.

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::writer::WriterConfig;

/// Default per-call timeout when an endpoint does not set one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of calls the worker pool runs at once.
pub const DEFAULT_WORKER_CAPACITY: usize = 256;

/// Default credit granted by CLIENT_OPEN.
pub const DEFAULT_INITIAL_CREDIT: i32 = 16;

/// Default number of consumed elements after which the client replenishes.
pub const DEFAULT_CREDIT_BATCH: i32 = 8;

/// Default first pause when the socket is not writable.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1);

/// Default ceiling of the writability pause.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(500);

/// Default number of consecutive not-writable checks before a stream fails.
pub const DEFAULT_MAX_RETRIES: u32 = 20;

/// Flow control settings for streaming returns.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Credit granted on open (client) or assumed when open carries none (server).
    pub initial_credit: i32,
    /// Client sends CLIENT_BACK_PRESSURE after consuming this many elements.
    pub credit_batch: i32,
    /// First pause when the socket reports back pressure.
    #[serde(with = "millis")]
    pub backoff_base: Duration,
    /// Maximum pause between writability checks.
    #[serde(with = "millis")]
    pub backoff_cap: Duration,
    /// Consecutive not-writable checks tolerated before STREAM_ERROR.
    pub max_retries: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            initial_credit: DEFAULT_INITIAL_CREDIT,
            credit_batch: DEFAULT_CREDIT_BATCH,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Top-level configuration of a [`RemoteTransport`](crate::provider::RemoteTransport).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// URIs to listen on, e.g. `tcp://127.0.0.1:0` or `unix:///tmp/rw.sock`.
    pub listen: Vec<String>,
    /// Maximum calls executing at once; more are rejected as overloaded.
    pub worker_capacity: usize,
    /// Call timeout used when an endpoint has no `remote.timeout.ms`.
    #[serde(with = "millis")]
    pub default_timeout: Duration,
    /// Largest accepted frame payload.
    pub max_payload_size: u32,
    /// Intents this transport can satisfy.
    pub intents: Vec<String>,
    /// Per-connection writer settings.
    pub writer: WriterConfig,
    /// Streaming flow control.
    pub stream: StreamConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            worker_capacity: DEFAULT_WORKER_CAPACITY,
            default_timeout: DEFAULT_CALL_TIMEOUT,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            intents: vec!["asyncInvocation".to_string(), "osgi.basic".to_string()],
            writer: WriterConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// Serde adapter for durations written as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.default_timeout, DEFAULT_CALL_TIMEOUT);
        assert_eq!(config.stream.initial_credit, DEFAULT_INITIAL_CREDIT);
        assert!(config.listen.is_empty());
    }

    #[test]
    fn test_partial_json() {
        let config: TransportConfig = serde_json::from_str(
            r#"{
                "listen": ["tcp://127.0.0.1:0"],
                "default_timeout": 1500,
                "stream": { "max_retries": 3 },
                "writer": { "backpressure_timeout": 250 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.listen, vec!["tcp://127.0.0.1:0"]);
        assert_eq!(config.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.stream.max_retries, 3);
        assert_eq!(config.stream.backoff_cap, DEFAULT_BACKOFF_CAP);
        assert_eq!(config.writer.backpressure_timeout, Duration::from_millis(250));
        assert_eq!(config.worker_capacity, DEFAULT_WORKER_CAPACITY);
    }
}
