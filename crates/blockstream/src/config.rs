//! Block stream tuning knobs.
//!
//! Durations are serialized as whole milliseconds under `*_ms` keys.

use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Default window over which end-of-stream responses are counted.
pub const DEFAULT_END_OF_STREAM_WINDOW: Duration = Duration::from_secs(30);

/// Default number of end-of-stream responses tolerated within the window.
pub const DEFAULT_MAX_END_OF_STREAMS: usize = 5;

/// Default delay before reconnecting once the end-of-stream limit is exceeded.
pub const DEFAULT_END_OF_STREAM_SCHEDULE_DELAY: Duration = Duration::from_secs(30);

/// Default delay for the first retry after a transport failure.
pub const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default delay after the peer reports an internal failure.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default delay after the peer ends a stream successfully.
pub const DEFAULT_LONG_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Upper bound of the exponential backoff between handshake attempts.
pub const DEFAULT_MAX_BACKOFF_DELAY: Duration = Duration::from_secs(300);

/// Default interval at which an idle worker polls the block buffer.
pub const DEFAULT_WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default time allowed for a worker to stop when a connection closes.
pub const DEFAULT_WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time allowed for opening a stream to a peer.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Block stream configuration.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BlockStreamConfig {
    #[serde(rename = "end_of_stream_window_ms", with = "serde_duration")]
    pub end_of_stream_window: Duration,

    pub max_end_of_streams: usize,

    #[serde(rename = "end_of_stream_schedule_delay_ms", with = "serde_duration")]
    pub end_of_stream_schedule_delay: Duration,

    #[serde(rename = "initial_retry_delay_ms", with = "serde_duration")]
    pub initial_retry_delay: Duration,

    #[serde(rename = "retry_delay_ms", with = "serde_duration")]
    pub retry_delay: Duration,

    #[serde(rename = "long_retry_delay_ms", with = "serde_duration")]
    pub long_retry_delay: Duration,

    #[serde(rename = "max_backoff_delay_ms", with = "serde_duration")]
    pub max_backoff_delay: Duration,

    #[serde(rename = "worker_poll_interval_ms", with = "serde_duration")]
    pub worker_poll_interval: Duration,

    #[serde(rename = "worker_shutdown_timeout_ms", with = "serde_duration")]
    pub worker_shutdown_timeout: Duration,

    #[serde(rename = "handshake_timeout_ms", with = "serde_duration")]
    pub handshake_timeout: Duration,
}

impl Default for BlockStreamConfig {
    fn default() -> Self {
        Self {
            end_of_stream_window: DEFAULT_END_OF_STREAM_WINDOW,
            max_end_of_streams: DEFAULT_MAX_END_OF_STREAMS,
            end_of_stream_schedule_delay: DEFAULT_END_OF_STREAM_SCHEDULE_DELAY,
            initial_retry_delay: DEFAULT_INITIAL_RETRY_DELAY,
            retry_delay: DEFAULT_RETRY_DELAY,
            long_retry_delay: DEFAULT_LONG_RETRY_DELAY,
            max_backoff_delay: DEFAULT_MAX_BACKOFF_DELAY,
            worker_poll_interval: DEFAULT_WORKER_POLL_INTERVAL,
            worker_shutdown_timeout: DEFAULT_WORKER_SHUTDOWN_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl BlockStreamConfig {
    /// Delay before the next handshake attempt after `failures` consecutive failures.
    ///
    /// Doubles from `initial_retry_delay` and saturates at `max_backoff_delay`.
    #[must_use]
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 2_u32.saturating_pow(failures.min(16));
        self.initial_retry_delay
            .saturating_mul(factor)
            .min(self.max_backoff_delay)
    }
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
