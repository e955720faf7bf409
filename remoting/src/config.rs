use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::lifecycle::IdlePolicy;

/// Tuning knobs for an [`crate::InvocationEngine`].
///
/// Every field has a default, so a configuration file only needs to mention what it changes.
/// Durations are written in human-readable form, like `"30s"` or `"250ms"`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemotingConfig {
    /// Maximum number of oneway requests being written at the same time.
    pub oneway_permits: usize,

    /// Maximum number of asynchronous calls waiting for a response at the same time.
    pub async_permits: usize,

    /// How long an async or oneway call waits for an admission permit before failing with
    /// [`crate::RemotingError::TooManyRequests`].  Independent of the call's own timeout.
    #[serde(with = "humantime_serde")]
    pub admission_wait: Duration,

    /// Workers in the shared executor used by processors registered without their own.
    pub public_executor_workers: usize,

    /// Jobs the shared executor will queue before rejecting requests as busy.
    pub public_executor_queue: usize,

    /// Workers that run async-call callbacks.
    pub callback_executor_workers: usize,

    pub callback_executor_queue: usize,

    /// Emit an idle event when nothing has been read for this long.  `None` disables it.
    #[serde(with = "humantime_serde")]
    pub reader_idle: Option<Duration>,

    /// Emit an idle event when nothing has been written for this long.  `None` disables it.
    #[serde(with = "humantime_serde")]
    pub writer_idle: Option<Duration>,

    /// Emit an idle event and close the connection when nothing has been read or written for
    /// this long.  `None` disables it.
    #[serde(with = "humantime_serde")]
    pub all_idle: Option<Duration>,

    /// How often each connection checks itself for idleness.
    #[serde(with = "humantime_serde")]
    pub idle_check_interval: Duration,

    /// How often the pending-call registry is swept for calls past their deadline.  This is the
    /// slack on top of a call's timeout before the caller finds out.
    #[serde(with = "humantime_serde")]
    pub timeout_scan_interval: Duration,

    /// Lifecycle events queued for the listener before new ones are dropped.
    pub event_queue_capacity: usize,

    /// Commands queued for writing on one connection before writers have to wait.
    pub outbound_queue_capacity: usize,

    /// Largest frame accepted or produced by [`crate::RemotingCodec`] built from this config.
    pub max_frame_length: usize,

    /// How long [`crate::InvocationEngine::shutdown`] waits for connections and executors to
    /// finish before aborting them.
    #[serde(with = "humantime_serde")]
    pub graceful_shutdown_timeout: Duration,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            oneway_permits: 256,
            async_permits: 64,
            admission_wait: Duration::from_millis(10),
            public_executor_workers: 8,
            public_executor_queue: 10_000,
            callback_executor_workers: 4,
            callback_executor_queue: 10_000,
            reader_idle: None,
            writer_idle: None,
            all_idle: Some(Duration::from_secs(120)),
            idle_check_interval: Duration::from_secs(1),
            timeout_scan_interval: Duration::from_secs(1),
            event_queue_capacity: 10_000,
            outbound_queue_capacity: 16,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            graceful_shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl RemotingConfig {
    pub fn idle_policy(&self) -> IdlePolicy {
        IdlePolicy {
            reader: self.reader_idle,
            writer: self.writer_idle,
            all: self.all_idle,
        }
    }

    pub fn codec(&self) -> crate::RemotingCodec {
        crate::RemotingCodec::new_with_max_length(self.max_frame_length)
    }
}
