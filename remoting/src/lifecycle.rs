//! Connection lifecycle events and idle detection.
//!
//! Each connection's event loop records when it last read and last wrote a frame.  A periodic
//! check on the same loop compares those against the configured idle thresholds, and the loop
//! reports connect, idle, close and exception events to the [`LifecycleNotifier`].  The notifier
//! queues them and a single task delivers them to the registered [`ConnectionEventListener`], so
//! a slow listener never stalls I/O.
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ConnectionHandle;
use crate::error;

/// Which kind of inactivity crossed its threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum IdleKind {
    /// Nothing read for the reader-idle threshold
    Reader,
    /// Nothing written for the writer-idle threshold
    Writer,
    /// Neither read nor written for the all-idle threshold
    All,
}

#[derive(Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionEvent {
    Connect,
    Idle(IdleKind),
    Close,
    Exception(String),
}

/// Receives lifecycle events for every connection an engine serves.
///
/// All methods default to doing nothing.  They are called one at a time, in the order the events
/// were produced, on a task dedicated to event delivery.
pub trait ConnectionEventListener: Send + Sync + 'static {
    fn on_connect(&self, connection: &ConnectionHandle) {
        let _ = connection;
    }

    fn on_idle(&self, connection: &ConnectionHandle, kind: IdleKind) {
        let _ = (connection, kind);
    }

    fn on_close(&self, connection: &ConnectionHandle) {
        let _ = connection;
    }

    fn on_exception(&self, connection: &ConnectionHandle, error: &str) {
        let _ = (connection, error);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionPhase {
    Connected,
    Idle,
    Closed,
}

/// Read/write timestamps of one connection, owned by its event loop.
#[derive(Clone, Debug)]
pub struct ConnectionActivity {
    last_read_at: Instant,
    last_write_at: Instant,
    phase: ConnectionPhase,
    // Idle kinds already reported during the current idle period
    reported_reader: bool,
    reported_writer: bool,
    reported_all: bool,
}

impl ConnectionActivity {
    pub fn new(now: Instant) -> Self {
        Self {
            last_read_at: now,
            last_write_at: now,
            phase: ConnectionPhase::Connected,
            reported_reader: false,
            reported_writer: false,
            reported_all: false,
        }
    }

    pub fn record_read(&mut self, now: Instant) {
        self.last_read_at = now;
        self.reported_reader = false;
        self.reported_all = false;
        self.wake();
    }

    pub fn record_write(&mut self, now: Instant) {
        self.last_write_at = now;
        self.reported_writer = false;
        self.reported_all = false;
        self.wake();
    }

    pub fn mark_closed(&mut self) {
        self.phase = ConnectionPhase::Closed;
    }

    fn wake(&mut self) {
        if self.phase == ConnectionPhase::Idle {
            self.phase = ConnectionPhase::Connected;
        }
    }

    pub fn last_read_at(&self) -> Instant {
        self.last_read_at
    }

    pub fn last_write_at(&self) -> Instant {
        self.last_write_at
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }
}

/// Result of one idle check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdleCheck {
    /// Idle events to emit, each at most once per idle period
    pub idle: Vec<IdleKind>,
    /// Whether the connection has been idle long enough to be closed
    pub close: bool,
}

/// Idle thresholds.  `None` disables a threshold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IdlePolicy {
    pub reader: Option<Duration>,
    pub writer: Option<Duration>,
    pub all: Option<Duration>,
}

impl IdlePolicy {
    pub fn is_disabled(&self) -> bool {
        self.reader.is_none() && self.writer.is_none() && self.all.is_none()
    }

    pub fn evaluate(&self, activity: &mut ConnectionActivity, now: Instant) -> IdleCheck {
        let mut check = IdleCheck::default();
        if activity.phase == ConnectionPhase::Closed {
            return check;
        }

        let read_idle = now.saturating_duration_since(activity.last_read_at);
        let write_idle = now.saturating_duration_since(activity.last_write_at);
        let all_idle = read_idle.min(write_idle);

        if let Some(threshold) = self.reader {
            if read_idle >= threshold && !activity.reported_reader {
                activity.reported_reader = true;
                check.idle.push(IdleKind::Reader);
            }
        }
        if let Some(threshold) = self.writer {
            if write_idle >= threshold && !activity.reported_writer {
                activity.reported_writer = true;
                check.idle.push(IdleKind::Writer);
            }
        }
        if let Some(threshold) = self.all {
            if all_idle >= threshold {
                if !activity.reported_all {
                    activity.reported_all = true;
                    check.idle.push(IdleKind::All);
                }
                check.close = true;
            }
        }

        if !check.idle.is_empty() {
            activity.phase = ConnectionPhase::Idle;
        }
        check
    }
}

type SharedListener = Arc<RwLock<Option<Arc<dyn ConnectionEventListener>>>>;

/// Bounded queue of lifecycle events, drained by one delivery task.
#[derive(Clone)]
pub struct LifecycleNotifier {
    sender: mpsc::Sender<(ConnectionEvent, ConnectionHandle)>,
    listener: SharedListener,
    capacity: usize,
}

impl LifecycleNotifier {
    /// Start the delivery task.  It runs until `cancellation_token` fires, after which it
    /// delivers whatever is already queued and exits.
    pub fn start(capacity: usize, cancellation_token: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let listener: SharedListener = Arc::new(RwLock::new(None));

        tokio::spawn(Self::deliver_events(receiver, listener.clone(), cancellation_token));

        Self {
            sender,
            listener,
            capacity,
        }
    }

    /// Register the listener, replacing any earlier one.
    pub fn listen(&self, listener: Arc<dyn ConnectionEventListener>) {
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    pub fn has_listener(&self) -> bool {
        self.listener.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Queue an event for delivery.  Never waits; if the queue is full the event is dropped.
    ///
    /// Returns `true` if the event was queued.
    pub fn notify(&self, event: ConnectionEvent, connection: &ConnectionHandle) -> bool {
        if !self.has_listener() {
            tracing::trace!(%event, connection_id = %connection.id(), "No listener registered; event not queued");
            return false;
        }

        match self.sender.try_send((event, connection.clone())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full((event, connection))) => {
                tracing::warn!(
                    %event,
                    connection_id = %connection.id(),
                    capacity = self.capacity,
                    "Lifecycle event queue is full; dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed((event, connection))) => {
                tracing::debug!(
                    %event,
                    connection_id = %connection.id(),
                    "Lifecycle event delivery has stopped; dropping event"
                );
                false
            }
        }
    }

    async fn deliver_events(
        mut receiver: mpsc::Receiver<(ConnectionEvent, ConnectionHandle)>,
        listener: SharedListener,
        cancellation_token: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                next = receiver.recv() => next,
                _ = cancellation_token.cancelled() => receiver.try_recv().ok(),
            };
            let Some((event, connection)) = next else {
                break;
            };

            let current = listener.read().unwrap_or_else(|e| e.into_inner()).clone();
            let Some(current) = current else {
                continue;
            };

            let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| match &event {
                ConnectionEvent::Connect => current.on_connect(&connection),
                ConnectionEvent::Idle(kind) => current.on_idle(&connection, *kind),
                ConnectionEvent::Close => current.on_close(&connection),
                ConnectionEvent::Exception(error) => current.on_exception(&connection, error),
            }));

            if let Err(panic) = delivered {
                tracing::error!(
                    %event,
                    connection_id = %connection.id(),
                    panic = %error::panic_err_to_string(panic),
                    "Connection event listener panicked"
                );
            }
        }

        tracing::debug!("Lifecycle event delivery stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(reader: Option<u64>, writer: Option<u64>, all: Option<u64>) -> IdlePolicy {
        IdlePolicy {
            reader: reader.map(Duration::from_secs),
            writer: writer.map(Duration::from_secs),
            all: all.map(Duration::from_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reader_idle_fires_once_per_idle_period() {
        let policy = policy(Some(10), None, None);
        let start = Instant::now();
        let mut activity = ConnectionActivity::new(start);

        assert_eq!(policy.evaluate(&mut activity, start + Duration::from_secs(5)), IdleCheck::default());

        let check = policy.evaluate(&mut activity, start + Duration::from_secs(10));
        assert_eq!(check.idle, vec![IdleKind::Reader]);
        assert!(!check.close);
        assert_eq!(activity.phase(), ConnectionPhase::Idle);

        // Still idle, but already reported
        assert!(policy.evaluate(&mut activity, start + Duration::from_secs(20)).idle.is_empty());

        // A read starts a new period
        activity.record_read(start + Duration::from_secs(21));
        assert_eq!(activity.phase(), ConnectionPhase::Connected);
        let check = policy.evaluate(&mut activity, start + Duration::from_secs(31));
        assert_eq!(check.idle, vec![IdleKind::Reader]);
    }

    #[tokio::test(start_paused = true)]
    async fn all_idle_closes_and_writes_keep_it_open() {
        let policy = policy(None, Some(5), Some(10));
        let start = Instant::now();
        let mut activity = ConnectionActivity::new(start);

        // Reads alone don't reset the writer-idle clock
        activity.record_read(start + Duration::from_secs(4));
        let check = policy.evaluate(&mut activity, start + Duration::from_secs(6));
        assert_eq!(check.idle, vec![IdleKind::Writer]);
        assert!(!check.close);

        // Reads keep the connection from being all-idle
        let check = policy.evaluate(&mut activity, start + Duration::from_secs(12));
        assert!(!check.close);

        let check = policy.evaluate(&mut activity, start + Duration::from_secs(14));
        assert_eq!(check.idle, vec![IdleKind::All]);
        assert!(check.close);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_policy_never_fires() {
        let policy = IdlePolicy::default();
        assert!(policy.is_disabled());
        let start = Instant::now();
        let mut activity = ConnectionActivity::new(start);
        assert_eq!(
            policy.evaluate(&mut activity, start + Duration::from_secs(100_000)),
            IdleCheck::default()
        );
    }

    struct Forward(mpsc::UnboundedSender<ConnectionEvent>);

    impl ConnectionEventListener for Forward {
        fn on_connect(&self, _connection: &ConnectionHandle) {
            let _ = self.0.send(ConnectionEvent::Connect);
        }

        fn on_idle(&self, _connection: &ConnectionHandle, kind: IdleKind) {
            let _ = self.0.send(ConnectionEvent::Idle(kind));
        }

        fn on_close(&self, _connection: &ConnectionHandle) {
            let _ = self.0.send(ConnectionEvent::Close);
        }
    }

    #[tokio::test]
    async fn events_are_delivered_in_order_and_overflow_is_dropped() {
        let notifier = LifecycleNotifier::start(2, CancellationToken::new());
        let (connection, _outbound) = ConnectionHandle::new_test_handle("peer");

        // Without a listener nothing is queued
        assert!(!notifier.notify(ConnectionEvent::Connect, &connection));

        let (tx, mut rx) = mpsc::unbounded_channel();
        notifier.listen(Arc::new(Forward(tx)));

        // The delivery task can't run until this task yields, so the third event finds the queue
        // full
        assert!(notifier.notify(ConnectionEvent::Connect, &connection));
        assert!(notifier.notify(ConnectionEvent::Idle(IdleKind::Reader), &connection));
        assert!(!notifier.notify(ConnectionEvent::Close, &connection));

        assert_eq!(rx.recv().await, Some(ConnectionEvent::Connect));
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Idle(IdleKind::Reader)));

        assert!(notifier.notify(ConnectionEvent::Close, &connection));
        assert_eq!(rx.recv().await, Some(ConnectionEvent::Close));
    }

    #[tokio::test]
    async fn queued_events_are_delivered_after_cancellation() {
        let token = CancellationToken::new();
        let notifier = LifecycleNotifier::start(16, token.clone());
        let (connection, _outbound) = ConnectionHandle::new_test_handle("peer");
        let (tx, mut rx) = mpsc::unbounded_channel();
        notifier.listen(Arc::new(Forward(tx)));

        assert!(notifier.notify(ConnectionEvent::Close, &connection));
        token.cancel();

        assert_eq!(rx.recv().await, Some(ConnectionEvent::Close));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connections_are_not_evaluated() {
        let policy = policy(Some(1), Some(1), Some(1));
        let start = Instant::now();
        let mut activity = ConnectionActivity::new(start);
        activity.mark_closed();
        assert_eq!(
            policy.evaluate(&mut activity, start + Duration::from_secs(5)),
            IdleCheck::default()
        );
    }
}
