//! Error classification, bounded history and recovery signalling.
//!
//! Every failure the core observes becomes an [`ErrorRecord`] handed to
//! [`ErrorReporter::report`]. The reporter keeps the newest records, tells
//! subscribers about each one, and decides whether the failure should be
//! retried:
//!
//! | Kind | Policy |
//! |---|---|
//! | `Connection` | reconnect after `reconnect_delay`, up to `max_reconnect_attempts` |
//! | `Timeout` | same as `Connection` when `reconnect_on_timeout` is set, else logged |
//! | everything else | logged only |
//!
//! The reporter does not reconnect anything itself. It publishes
//! [`ErrorEvent::ReconnectRequested`] and whoever owns the lifecycle acts
//! on it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tether_protocol::{Payload, RequestId, now_millis};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

use crate::ReporterConfig;

const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// ErrorKind / ErrorRecord
// ---------------------------------------------------------------------------

/// What went wrong, coarsely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Connection,
    Timeout,
    Serialization,
    Deserialization,
    Server,
    Client,
    Unknown,
}

impl ErrorKind {
    /// Only connection and timeout failures can be fixed by reconnecting.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "ConnectionError",
            Self::Timeout => "TimeoutError",
            Self::Serialization => "SerializationError",
            Self::Deserialization => "DeserializationError",
            Self::Server => "ServerError",
            Self::Client => "ClientError",
            Self::Unknown => "UnknownError",
        };
        f.write_str(name)
    }
}

/// One reported failure. Immutable once reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    /// Where it happened, free form.
    pub context: Option<String>,
    /// The request this failure belongs to, if any.
    pub request_id: Option<RequestId>,
    /// Milliseconds since the Unix epoch.
    pub occurred_at: u64,
    pub extra: Payload,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
            request_id: None,
            occurred_at: now_millis(),
            extra: Payload::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_request(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_extra(mut self, extra: Payload) -> Self {
        self.extra = extra;
        self
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Notifications published by the [`ErrorReporter`].
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorEvent {
    /// A record was added to the history.
    Occurred(ErrorRecord),
    /// A record was marked resolved; the reconnect budget is reset.
    Resolved(ErrorRecord),
    /// The reconnect delay for `attempt` elapsed. Reconnect now.
    ReconnectRequested { attempt: u32 },
    /// A recoverable error arrived with no reconnect budget left.
    RecoveryExhausted,
}

// ---------------------------------------------------------------------------
// ErrorReporter
// ---------------------------------------------------------------------------

/// Records errors and drives the bounded auto-reconnect policy.
///
/// Cheap to clone; clones share the same history.
#[derive(Clone)]
pub struct ErrorReporter {
    inner: Arc<Inner>,
}

struct Inner {
    config: ReporterConfig,
    state: Mutex<ReporterState>,
    events: broadcast::Sender<ErrorEvent>,
}

struct ReporterState {
    history: VecDeque<ErrorRecord>,
    attempts: u32,
    /// The reconnect request waiting out its delay, tagged with its attempt.
    pending: Option<(u32, AbortHandle)>,
}

impl ReporterState {
    fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl ErrorReporter {
    pub fn new(config: ReporterConfig) -> Self {
        let config = config.validated();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ReporterState {
                    history: VecDeque::with_capacity(config.history_capacity.min(1024)),
                    attempts: 0,
                    pending: None,
                }),
                config,
                events,
            }),
        }
    }

    /// Subscribes to reporter events.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorEvent> {
        self.inner.events.subscribe()
    }

    /// Records `record`, publishes it, and applies the retry policy for
    /// its kind.
    pub fn report(&self, record: ErrorRecord) {
        error!(
            kind = %record.kind,
            message = %record.message,
            context = ?record.context,
            request_id = ?record.request_id.as_ref().map(RequestId::as_str),
            "error reported"
        );

        {
            let mut state = self.lock();
            if state.history.len() >= self.inner.config.history_capacity {
                state.history.pop_front();
            }
            state.history.push_back(record.clone());
        }
        let kind = record.kind;
        self.publish(ErrorEvent::Occurred(record));

        match kind {
            ErrorKind::Connection => self.schedule_recovery(),
            ErrorKind::Timeout if self.inner.config.reconnect_on_timeout => {
                self.schedule_recovery()
            }
            _ => {}
        }
    }

    /// Shorthand for reporting a bare `kind` and `message`.
    pub fn report_kind(&self, kind: ErrorKind, message: impl Into<String>) {
        self.report(ErrorRecord::new(kind, message));
    }

    /// Marks `record` as dealt with and resets the reconnect budget.
    pub fn resolve(&self, record: &ErrorRecord) {
        {
            let mut state = self.lock();
            state.attempts = 0;
            state.cancel_pending();
        }
        info!(kind = %record.kind, message = %record.message, "error resolved");
        self.publish(ErrorEvent::Resolved(record.clone()));
    }

    /// Whether reconnecting could fix `record`.
    pub fn is_recoverable(&self, record: &ErrorRecord) -> bool {
        record.kind.is_recoverable()
    }

    /// Reconnect requests issued since the last [`resolve`](Self::resolve).
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Whether a reconnect request is waiting out its delay.
    pub fn has_pending_request(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Drops any delayed reconnect request and restores the full budget.
    ///
    /// Called when a session ends or a fresh one begins, so a request
    /// scheduled for the old session never reaches the new one. History is
    /// kept.
    pub fn reset_recovery(&self) {
        let mut state = self.lock();
        if state.cancel_pending() {
            debug!(attempts = state.attempts, "pending reconnect request dropped");
        }
        state.attempts = 0;
    }

    // -- history ------------------------------------------------------------

    /// The newest `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ErrorRecord> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Every retained record of `kind`, oldest first.
    pub fn by_kind(&self, kind: ErrorKind) -> Vec<ErrorRecord> {
        self.lock()
            .history
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Every retained record tied to `request_id`.
    pub fn for_request(&self, request_id: &RequestId) -> Vec<ErrorRecord> {
        self.lock()
            .history
            .iter()
            .filter(|r| r.request_id.as_ref() == Some(request_id))
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<ErrorRecord> {
        self.lock().history.back().cloned()
    }

    /// The newest retained record of `kind`.
    pub fn latest_of(&self, kind: ErrorKind) -> Option<ErrorRecord> {
        self.lock()
            .history
            .iter()
            .rev()
            .find(|r| r.kind == kind)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().history.is_empty()
    }

    /// Drops the history. The reconnect budget is left alone.
    pub fn clear(&self) {
        self.lock().history.clear();
    }

    // -- internals ----------------------------------------------------------

    fn schedule_recovery(&self) {
        let config = &self.inner.config;
        if !config.auto_reconnect {
            return;
        }

        let mut state = self.lock();
        if let Some((attempt, _)) = &state.pending {
            trace!(attempt = *attempt, "reconnect request already pending");
            return;
        }
        if state.attempts >= config.max_reconnect_attempts {
            warn!(attempts = state.attempts, "reconnect budget exhausted");
            drop(state);
            self.publish(ErrorEvent::RecoveryExhausted);
            return;
        }
        state.attempts += 1;
        let attempt = state.attempts;
        let delay = config.reconnect_delay;
        debug!(attempt, delay = ?delay, "scheduling reconnect request");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(attempt, "no async runtime, requesting reconnect immediately");
            drop(state);
            self.publish(ErrorEvent::ReconnectRequested { attempt });
            return;
        };

        let inner = Arc::clone(&self.inner);
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                // Reset or resolved while this task was waking up.
                if state.pending.as_ref().map(|(current, _)| *current) != Some(attempt) {
                    return;
                }
                state.pending = None;
            }
            // No receivers is fine.
            let _ = inner.events.send(ErrorEvent::ReconnectRequested { attempt });
        });
        state.pending = Some((attempt, task.abort_handle()));
    }

    fn publish(&self, event: ErrorEvent) {
        let _ = self.inner.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(ReporterConfig::default())
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ErrorReporter")
            .field("records", &state.history.len())
            .field("attempts", &state.attempts)
            .finish()
    }
}
