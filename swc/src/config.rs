//! Client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use swc_proto::{DATA_OVERHEAD, DEFAULT_MAX_PAYLOAD, MAX_PAYLOAD_LIMIT};

/// Environment variable overriding the daemon socket path.
pub const ENV_SOCKET: &str = "SWC_SOCKET";

/// Environment variable overriding the acknowledgment timeout, in milliseconds.
pub const ENV_ACK_TIMEOUT_MS: &str = "SWC_ACK_TIMEOUT_MS";

/// Socket the daemon listens on unless configured otherwise.
pub const DEFAULT_ENDPOINT: &str = "/tmp/sockinstctrl";

/// What to do with progress that matches no active session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnsolicitedPolicy {
    /// Drop it with a protocol warning.
    #[default]
    Discard,
    /// Queue it as [`Event::Unsolicited`](crate::Event::Unsolicited).
    Surface,
}

/// Settings for a [`Client`](crate::Client).
///
/// ```
/// use std::time::Duration;
/// use swc::ClientConfig;
///
/// let config = ClientConfig::new("/run/swupdate/sockinstctrl")
///     .ack_timeout(Duration::from_secs(30))
///     .chunk_size(16 * 1024);
/// assert_eq!(config.endpoint.to_str(), Some("/run/swupdate/sockinstctrl"));
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Daemon socket path. Resolved again on every connect.
    pub endpoint: PathBuf,
    /// Extra connect attempts when the socket is missing or refuses.
    pub connect_retries: u32,
    /// Pause between connect attempts.
    pub retry_delay: Duration,
    /// Upper bound for a single blocked write, `None` to block forever.
    pub write_timeout: Option<Duration>,
    /// How long to wait for `ACK` / `DATA_ACK` replies.
    pub ack_timeout: Duration,
    /// Slice length of blocking waits; bounds cancellation latency.
    pub poll_interval: Duration,
    /// Image bytes per `DATA` frame.
    pub chunk_size: usize,
    /// Largest inbound payload accepted.
    pub max_payload: u32,
    /// Events kept before the oldest is dropped.
    pub event_capacity: usize,
    /// Handling of progress without an active session.
    pub unsolicited: UnsolicitedPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: PathBuf::from(DEFAULT_ENDPOINT),
            connect_retries: 3,
            retry_delay: Duration::from_millis(100),
            write_timeout: Some(Duration::from_secs(5)),
            ack_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            chunk_size: 64 * 1024,
            max_payload: DEFAULT_MAX_PAYLOAD,
            event_capacity: 256,
            unsolicited: UnsolicitedPolicy::Discard,
        }
    }
}

impl ClientConfig {
    /// Default settings for the given endpoint.
    pub fn new(endpoint: impl AsRef<Path>) -> Self {
        Self::default().endpoint(endpoint)
    }

    /// Defaults, overridden by [`ENV_SOCKET`] and [`ENV_ACK_TIMEOUT_MS`].
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = std::env::var_os(ENV_SOCKET).filter(|p| !p.is_empty()) {
            config.endpoint = PathBuf::from(path);
        }
        if let Ok(ms) = std::env::var(ENV_ACK_TIMEOUT_MS) {
            match ms.parse::<u64>() {
                Ok(ms) => config.ack_timeout = Duration::from_millis(ms),
                Err(e) => tracing::warn!(value = %ms, error = %e, "ignoring {ENV_ACK_TIMEOUT_MS}"),
            }
        }
        config
    }

    /// Sets the daemon socket path.
    #[must_use]
    pub fn endpoint(mut self, path: impl AsRef<Path>) -> Self {
        self.endpoint = path.as_ref().to_path_buf();
        self
    }

    /// Sets the number of extra connect attempts.
    #[must_use]
    pub const fn connect_retries(mut self, n: u32) -> Self {
        self.connect_retries = n;
        self
    }

    /// Sets the pause between connect attempts.
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the write timeout.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the acknowledgment timeout.
    #[must_use]
    pub const fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the wait slice length.
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the image bytes per `DATA` frame.
    #[must_use]
    pub const fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Sets the inbound payload limit.
    #[must_use]
    pub const fn max_payload(mut self, bytes: u32) -> Self {
        self.max_payload = bytes;
        self
    }

    /// Sets the event queue capacity.
    #[must_use]
    pub const fn event_capacity(mut self, n: usize) -> Self {
        self.event_capacity = n;
        self
    }

    /// Sets the unsolicited progress policy.
    #[must_use]
    pub const fn unsolicited(mut self, policy: UnsolicitedPolicy) -> Self {
        self.unsolicited = policy;
        self
    }

    /// Chunk size actually used: at least one byte, and small enough that a
    /// `DATA` frame fits the payload limit on both sides.
    pub(crate) fn effective_chunk_size(&self) -> usize {
        let limit = self.max_payload.min(MAX_PAYLOAD_LIMIT) as usize;
        self.chunk_size
            .min(limit.saturating_sub(DATA_OVERHEAD))
            .max(1)
    }

    /// Wait slice, never zero.
    pub(crate) fn poll_slice(&self) -> Duration {
        self.poll_interval.max(Duration::from_millis(1))
    }
}
