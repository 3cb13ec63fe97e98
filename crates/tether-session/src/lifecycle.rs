//! The connection lifecycle state machine.
//!
//! ```text
//!                  start_host / start_client
//! Disconnected ───────────────────────────────→ Connecting ──(link up)──→ Connected
//!      ↑                                           │  ↑                      │
//!      │ disconnect()                   (timeout)  │  │ restart    (link lost)│
//!      │                                           ▼  │                      ▼
//!   (any) ←─────────────────────────────────── Failed ←──(budget spent)── Reconnecting
//! ```
//!
//! Every timer the lifecycle starts (timeout watch, reconnect delay) is
//! tagged with the *generation* that was current when it was started.
//! Starting, reconnecting, failing or disconnecting bumps the generation,
//! so a timer left over from an earlier attempt finds a newer generation
//! and does nothing.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_transport::{ConnectionId, Transport};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::{ErrorKind, ErrorRecord, ErrorReporter, LifecycleConfig, SessionError};

const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// ConnectionStatus
// ---------------------------------------------------------------------------

/// Where the connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    /// Returns `true` while a start would be rejected.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side of the link this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Server plus a local client.
    Host,
    Client,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// The most recent start request, replayed by reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub mode: Mode,
    pub address: String,
    pub port: u16,
}

/// Notifications published by the [`ConnectionLifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Every actual transition. Never sent for a no-op.
    StateChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    /// The link came up.
    Connected,
    /// The link was up and isn't anymore.
    Disconnected,
}

// ---------------------------------------------------------------------------
// ConnectionLifecycle
// ---------------------------------------------------------------------------

/// Owns the current [`ConnectionStatus`] and drives the transport through
/// start, timeout detection and bounded reconnects.
///
/// Cheap to clone; clones share one state machine. All methods that start
/// timers must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct ConnectionLifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    config: LifecycleConfig,
    transport: Arc<dyn Transport>,
    reporter: ErrorReporter,
    state: Mutex<State>,
    events: broadcast::Sender<LifecycleEvent>,
}

struct State {
    status: ConnectionStatus,
    target: Option<LinkTarget>,
    attempts: u32,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl State {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation
    }
}

impl ConnectionLifecycle {
    pub fn new(
        config: LifecycleConfig,
        transport: Arc<dyn Transport>,
        reporter: ErrorReporter,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config: config.validated(),
                transport,
                reporter,
                state: Mutex::new(State {
                    status: ConnectionStatus::Disconnected,
                    target: None,
                    attempts: 0,
                    generation: 0,
                    timer: None,
                }),
                events,
            }),
        }
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn mode(&self) -> Option<Mode> {
        self.lock().target.as_ref().map(|t| t.mode)
    }

    pub fn target(&self) -> Option<LinkTarget> {
        self.lock().target.clone()
    }

    /// Reconnects performed since the link was last up.
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().attempts
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    // -- commands -----------------------------------------------------------

    /// Starts hosting on `address:port`.
    ///
    /// # Errors
    /// [`SessionError::AlreadyActive`] while connecting or connected, and
    /// [`SessionError::Transport`] if the transport refuses to start (the
    /// lifecycle is then `Failed`).
    pub fn start_host(&self, address: &str, port: u16) -> Result<(), SessionError> {
        self.start(Self::link_target(Mode::Host, address, port), true)
    }

    /// Starts connecting to the host at `address:port`.
    ///
    /// Errors as for [`start_host`](Self::start_host).
    pub fn start_client(&self, address: &str, port: u16) -> Result<(), SessionError> {
        self.start(Self::link_target(Mode::Client, address, port), true)
    }

    /// Cancels every pending timer, including the reporter's delayed
    /// reconnect request, stops the transport and forgets the mode. Always
    /// ends in `Disconnected`.
    pub fn disconnect(&self) {
        {
            let mut state = self.lock();
            state.next_generation();
            state.attempts = 0;
            state.target = None;
            self.transition(&mut state, ConnectionStatus::Disconnected);
        }
        self.inner.reporter.reset_recovery();
        self.inner.transport.disconnect();
        info!("disconnected");
    }

    /// Reconnects after the configured delay.
    pub fn reconnect(&self) -> Result<(), SessionError> {
        self.reconnect_after(self.inner.config.reconnect_delay)
    }

    /// Reconnects after `delay`, replaying the last start.
    ///
    /// # Errors
    /// [`SessionError::NoStoredMode`] if nothing was ever started, and
    /// [`SessionError::ReconnectExhausted`] once the attempt budget is
    /// spent (the lifecycle is then `Failed`).
    pub fn reconnect_after(&self, delay: Duration) -> Result<(), SessionError> {
        let mut state = self.lock();
        if state.target.is_none() {
            warn!("reconnect requested with no stored mode");
            return Err(SessionError::NoStoredMode);
        }

        let max = self.inner.config.max_reconnect_attempts;
        if state.attempts >= max {
            warn!(attempts = state.attempts, max, "reconnect attempts exhausted");
            state.next_generation();
            self.transition(&mut state, ConnectionStatus::Failed);
            return Err(SessionError::ReconnectExhausted {
                attempts: state.attempts,
            });
        }

        let generation = state.next_generation();
        self.transition(&mut state, ConnectionStatus::Reconnecting);
        info!(attempt = state.attempts + 1, max, delay = ?delay, "reconnect scheduled");

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(lifecycle) = Self::upgrade(&weak) {
                lifecycle.run_reconnect(generation);
            }
        });
        state.timer = Some(task.abort_handle());
        Ok(())
    }

    /// Forces `Failed`, cancelling any pending timer.
    pub fn fail(&self) {
        let mut state = self.lock();
        state.next_generation();
        if self.transition(&mut state, ConnectionStatus::Failed) {
            warn!(attempts = state.attempts, "connection failed");
        }
    }

    // -- transport notifications -------------------------------------------

    /// A remote endpoint connected. Completes a pending start if the link
    /// is now up.
    pub fn on_remote_connected(&self, peer: ConnectionId) {
        let (generation, mode) = {
            let state = self.lock();
            match (&state.status, &state.target) {
                (ConnectionStatus::Connecting, Some(target)) => (state.generation, target.mode),
                _ => return,
            }
        };
        trace!(%peer, "remote connected while connecting");
        if self.link_ready(mode) {
            self.mark_connected(generation);
        }
    }

    /// A remote endpoint went away. Reconnects if that took the link down.
    pub fn on_remote_disconnected(&self, peer: ConnectionId) {
        let mode = {
            let state = self.lock();
            match (&state.status, &state.target) {
                (ConnectionStatus::Connected, Some(target)) => target.mode,
                _ => return,
            }
        };
        if self.link_ready(mode) {
            debug!(%peer, "peer left, link still up");
            return;
        }

        warn!(%peer, %mode, "link lost");
        if let Err(e) = self.reconnect() {
            debug!(error = %e, "no reconnect after link loss");
        }
    }

    // -- internals ----------------------------------------------------------

    fn link_target(mode: Mode, address: &str, port: u16) -> LinkTarget {
        LinkTarget {
            mode,
            address: address.to_string(),
            port,
        }
    }

    fn start(&self, target: LinkTarget, fresh: bool) -> Result<(), SessionError> {
        let generation = {
            let mut state = self.lock();
            if state.status.is_active() {
                warn!(status = %state.status, mode = %target.mode, "start rejected");
                return Err(SessionError::AlreadyActive(state.status));
            }
            if fresh {
                state.attempts = 0;
            }
            let generation = state.next_generation();
            state.target = Some(target.clone());
            self.transition(&mut state, ConnectionStatus::Connecting);
            generation
        };
        if fresh {
            self.inner.reporter.reset_recovery();
        }

        info!(mode = %target.mode, address = %target.address, port = target.port, "starting");
        let transport = &self.inner.transport;
        let started = match target.mode {
            Mode::Host => transport.connect_as_host(&target.address, target.port),
            Mode::Client => transport.connect_as_client(&target.address, target.port),
        };
        if let Err(e) = started {
            self.inner.reporter.report(
                ErrorRecord::new(ErrorKind::Connection, format!("failed to start {}: {e}", target.mode))
                    .with_context("lifecycle.start"),
            );
            self.fail_generation(generation);
            return Err(e.into());
        }

        if self.link_ready(target.mode) {
            self.mark_connected(generation);
        } else {
            self.spawn_watch(generation, target.mode);
        }
        Ok(())
    }

    fn spawn_watch(&self, generation: u64, mode: Mode) {
        let poll = self.inner.config.poll_interval;
        let deadline = Instant::now() + self.inner.config.connect_timeout;
        let weak = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll).await;
                let Some(lifecycle) = Self::upgrade(&weak) else {
                    return;
                };
                if !lifecycle.is_current(generation) {
                    return;
                }
                if lifecycle.link_ready(mode) {
                    lifecycle.mark_connected(generation);
                    return;
                }
                if Instant::now() >= deadline {
                    lifecycle.connect_timed_out(generation);
                    return;
                }
                trace!(%mode, "link not up yet");
            }
        });

        let mut state = self.lock();
        if state.generation == generation {
            state.timer = Some(task.abort_handle());
        } else {
            task.abort();
        }
    }

    fn run_reconnect(&self, generation: u64) {
        let target = {
            let mut state = self.lock();
            if state.generation != generation || state.status != ConnectionStatus::Reconnecting {
                return;
            }
            let Some(target) = state.target.clone() else {
                return;
            };
            state.attempts += 1;
            debug!(attempt = state.attempts, "reconnecting now");
            target
        };

        self.inner.transport.disconnect();
        if let Err(e) = self.start(target, false) {
            debug!(error = %e, "reconnect attempt failed to start");
        }
    }

    fn connect_timed_out(&self, generation: u64) {
        {
            let state = self.lock();
            if state.generation != generation || state.status != ConnectionStatus::Connecting {
                return;
            }
        }
        self.inner.reporter.report(
            ErrorRecord::new(ErrorKind::Connection, "connection timeout")
                .with_context("lifecycle.watch"),
        );
        self.fail_generation(generation);
    }

    fn mark_connected(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.attempts = 0;
        self.transition(&mut state, ConnectionStatus::Connected);
    }

    fn fail_generation(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        self.transition(&mut state, ConnectionStatus::Failed);
    }

    fn link_ready(&self, mode: Mode) -> bool {
        let transport = &self.inner.transport;
        let has_identity = transport.local_client_id().is_some();
        match mode {
            Mode::Host => transport.is_server_active() && has_identity,
            Mode::Client => transport.is_client_connected() && has_identity,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Moves to `to`. Returns `false` (and publishes nothing) if already there.
    fn transition(&self, state: &mut State, to: ConnectionStatus) -> bool {
        let from = state.status;
        if from == to {
            return false;
        }
        state.status = to;
        info!(%from, %to, "connection state changed");

        let events = &self.inner.events;
        let _ = events.send(LifecycleEvent::StateChanged { from, to });
        if from == ConnectionStatus::Connected {
            let _ = events.send(LifecycleEvent::Disconnected);
        }
        if to == ConnectionStatus::Connected {
            let _ = events.send(LifecycleEvent::Connected);
        }
        true
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ConnectionLifecycle")
            .field("status", &state.status)
            .field("target", &state.target)
            .field("attempts", &state.attempts)
            .field("generation", &state.generation)
            .finish()
    }
}
