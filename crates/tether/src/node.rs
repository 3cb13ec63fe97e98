//! `Node`: every Tether component wired around one transport.
//!
//! A node owns the codec, error reporter, connection lifecycle, request
//! router, correlator and stats monitor, and runs two background tasks:
//!
//! 1. **Event pump**: transport events go to the lifecycle (link
//!    re-evaluation), the peer table (connection count) and the
//!    dispatcher (inbound requests and responses).
//! 2. **Recovery**: the reporter's reconnect requests become immediate
//!    lifecycle reconnects, exhaustion becomes `Failed`, and a successful
//!    reconnect resolves the connection error that caused it.
//!
//! ```text
//! transport events ──→ pump ──→ lifecycle / peers / Dispatcher
//! reporter events  ──┐
//!                    ├─→ recovery ──→ lifecycle.reconnect_after / fail
//! lifecycle events ──┘                reporter.resolve
//! ```

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tether_protocol::{Codec, Frame, Request, RequestId, RequestKind, Response};
use tether_rpc::{
    Correlator, CorrelatorParts, Dispatcher, HandlerResult, RequestRouter, ResponseCallback,
};
use tether_session::{
    ConnectionLifecycle, ConnectionStatus, ErrorEvent, ErrorKind, ErrorRecord, ErrorReporter,
    LifecycleEvent,
};
use tether_stats::{NetworkStats, StatsMonitor, StatsRecorder};
use tether_transport::{ConnectionId, EventReceiver, Transport, TransportEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::{TetherConfig, TetherError};

/// Remote endpoints currently linked, shared by the pump and the outlets.
type PeerTable = Arc<Mutex<BTreeSet<ConnectionId>>>;

/// A messaging endpoint: host or client, never both at once.
///
/// Must be created inside a Tokio runtime. Dropping the node stops its
/// background tasks; it does not disconnect the transport.
pub struct Node {
    config: TetherConfig,
    codec: Arc<Codec>,
    reporter: ErrorReporter,
    lifecycle: ConnectionLifecycle,
    router: Arc<RequestRouter>,
    correlator: Correlator,
    monitor: StatsMonitor,
    outlet: Outlet,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Wires a node around `transport`, whose events arrive on `events`.
    pub fn new(config: TetherConfig, transport: Arc<dyn Transport>, events: EventReceiver) -> Self {
        let codec = Arc::new(Codec::new());
        let reporter = ErrorReporter::new(config.errors.clone());
        let lifecycle = ConnectionLifecycle::new(
            config.lifecycle.clone(),
            Arc::clone(&transport),
            reporter.clone(),
        );
        let router = Arc::new(RequestRouter::new(config.rpc.broadcast_kind.clone()));

        let stats_config = config.stats.clone().validated();
        let recorder = StatsRecorder::new(stats_config.ping_smoothing);
        let correlator = Correlator::new(CorrelatorParts {
            config: config.rpc.clone(),
            sender_id: config.local_name.clone(),
            transport: Arc::clone(&transport),
            lifecycle: lifecycle.clone(),
            reporter: reporter.clone(),
            recorder: recorder.clone(),
        });
        let monitor = StatsMonitor::spawn(
            stats_config,
            recorder.clone(),
            lifecycle.subscribe(),
            lifecycle.is_connected(),
        );
        let outlet = Outlet {
            transport: Arc::clone(&transport),
            peers: Arc::new(Mutex::new(BTreeSet::new())),
            recorder: recorder.clone(),
        };

        let dispatcher = Dispatcher::new(
            Arc::clone(&router),
            correlator.clone(),
            transport,
            reporter.clone(),
            recorder,
        );
        let pump = tokio::spawn(pump_transport_events(
            events,
            dispatcher,
            lifecycle.clone(),
            outlet.clone(),
        ));
        let recovery = tokio::spawn(run_recovery(
            reporter.subscribe(),
            lifecycle.subscribe(),
            lifecycle.clone(),
            reporter.clone(),
        ));

        info!(name = %config.local_name, "node created");
        Self {
            config,
            codec,
            reporter,
            lifecycle,
            router,
            correlator,
            monitor,
            outlet,
            tasks: vec![pump, recovery],
        }
    }

    // -- connection ---------------------------------------------------------

    /// Starts hosting on `address:port`.
    ///
    /// # Errors
    /// [`TetherError::Session`] if already connecting or connected, or if
    /// the transport refuses to start.
    pub fn start_host(&self, address: &str, port: u16) -> Result<(), TetherError> {
        Ok(self.lifecycle.start_host(address, port)?)
    }

    /// Starts connecting to the host at `address:port`.
    ///
    /// Errors as for [`start_host`](Self::start_host).
    pub fn start_client(&self, address: &str, port: u16) -> Result<(), TetherError> {
        Ok(self.lifecycle.start_client(address, port)?)
    }

    /// Fails every pending request, then stops the transport. Reconnect
    /// requests still waiting on their delay are dropped with the session.
    pub fn disconnect(&self) {
        let canceled = self.correlator.cancel_all("disconnected");
        self.lifecycle.disconnect();
        self.outlet.clear_peers();
        debug!(canceled, "node disconnected");
    }

    /// Replays the last start after the configured delay.
    ///
    /// # Errors
    /// [`TetherError::Session`] when nothing was started yet or the
    /// reconnect budget is spent.
    pub fn reconnect(&self) -> Result<(), TetherError> {
        Ok(self.lifecycle.reconnect()?)
    }

    pub fn current_state(&self) -> ConnectionStatus {
        self.lifecycle.status()
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    // -- messaging ----------------------------------------------------------

    /// Sends `request` to the server.
    ///
    /// A `callback` runs exactly once, with the response or with a
    /// synthesized `Timeout`/`Failed` one. `timeout` defaults to the
    /// configured request timeout.
    ///
    /// # Errors
    /// [`TetherError::Rpc`] when not connected or the transport refused
    /// the bytes. The callback has already run in both cases.
    pub fn send(
        &self,
        request: Request,
        callback: Option<ResponseCallback>,
        timeout: Option<Duration>,
    ) -> Result<RequestId, TetherError> {
        Ok(self.correlator.send(request, callback, timeout)?)
    }

    /// Sends `request` and waits for its response.
    pub async fn request(&self, request: Request, timeout: Option<Duration>) -> Response {
        self.correlator.request(request, timeout).await
    }

    /// Answers inbound requests of `kind` with `handler`.
    pub fn register_request_handler<F>(&self, kind: RequestKind, handler: F)
    where
        F: Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    {
        self.router.register(kind, handler);
    }

    /// Receives responses of `kind` that answer no request of ours.
    pub fn register_response_handler<F>(&self, kind: RequestKind, handler: F)
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        self.correlator.register_response_handler(kind, handler);
    }

    /// Every response that answers no request of ours.
    pub fn subscribe_broadcasts(&self) -> broadcast::Receiver<Response> {
        self.correlator.subscribe_broadcasts()
    }

    /// A handle request handlers can capture to push responses to peers.
    pub fn outlet(&self) -> Outlet {
        self.outlet.clone()
    }

    // -- observation --------------------------------------------------------

    /// The latest published stats snapshot.
    pub fn stats(&self) -> NetworkStats {
        self.monitor.current()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<NetworkStats> {
        self.monitor.subscribe()
    }

    pub fn reset_stats(&self) {
        self.monitor.reset();
    }

    /// The newest `n` recorded errors, oldest first.
    pub fn recent_errors(&self, n: usize) -> Vec<ErrorRecord> {
        self.reporter.recent(n)
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.reporter.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// The codec used to build and read payloads. Register custom value
    /// types here.
    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    pub fn lifecycle(&self) -> &ConnectionLifecycle {
        &self.lifecycle
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.config.local_name)
            .field("status", &self.lifecycle.status())
            .field("pending", &self.correlator.pending_count())
            .field("peers", &self.outlet.peers().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Outlet
// ---------------------------------------------------------------------------

/// Pushes server-initiated responses to linked peers.
///
/// Cheap to clone; request handlers capture one to fan a broadcast out
/// to every client.
#[derive(Clone)]
pub struct Outlet {
    transport: Arc<dyn Transport>,
    peers: PeerTable,
    recorder: StatsRecorder,
}

impl Outlet {
    /// Sends `response` to one peer.
    ///
    /// # Errors
    /// [`TetherError::Transport`] when the transport refuses the bytes.
    pub fn push(&self, to: ConnectionId, response: &Response) -> Result<(), TetherError> {
        let bytes = Frame::Response(response.clone()).to_bytes();
        self.transport.send_bytes(to, &bytes)?;
        self.recorder.record_sent(bytes.len());
        trace!(%to, request_id = %response.request_id, "response pushed");
        Ok(())
    }

    /// Sends `response` to every linked peer. Returns how many got it.
    pub fn broadcast(&self, response: &Response) -> usize {
        let peers = self.peers();
        let mut delivered = 0;
        for peer in peers {
            match self.push(peer, response) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(%peer, error = %e, "broadcast to peer failed"),
            }
        }
        delivered
    }

    /// Remote endpoints currently linked, in id order.
    pub fn peers(&self) -> Vec<ConnectionId> {
        self.lock().iter().copied().collect()
    }

    fn peer_connected(&self, peer: ConnectionId) {
        let count = {
            let mut peers = self.lock();
            peers.insert(peer);
            peers.len()
        };
        self.recorder.set_connection_count(count);
    }

    fn peer_disconnected(&self, peer: ConnectionId) {
        let count = {
            let mut peers = self.lock();
            peers.remove(&peer);
            peers.len()
        };
        self.recorder.set_connection_count(count);
    }

    fn clear_peers(&self) {
        self.lock().clear();
        self.recorder.set_connection_count(0);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<ConnectionId>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn pump_transport_events(
    mut events: EventReceiver,
    dispatcher: Dispatcher,
    lifecycle: ConnectionLifecycle,
    outlet: Outlet,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected(peer) => {
                outlet.peer_connected(peer);
                lifecycle.on_remote_connected(peer);
            }
            TransportEvent::Disconnected(peer) => {
                outlet.peer_disconnected(peer);
                lifecycle.on_remote_disconnected(peer);
            }
            TransportEvent::Received { from, data } => {
                // Failures are already in the reporter's history.
                if let Err(e) = dispatcher.handle(from, &data) {
                    debug!(%from, error = %e, "inbound message dropped");
                }
            }
        }
    }
    debug!("transport event channel closed");
}

async fn run_recovery(
    mut errors: broadcast::Receiver<ErrorEvent>,
    mut lifecycle_events: broadcast::Receiver<LifecycleEvent>,
    lifecycle: ConnectionLifecycle,
    reporter: ErrorReporter,
) {
    loop {
        tokio::select! {
            event = errors.recv() => match event {
                Ok(ErrorEvent::ReconnectRequested { attempt }) => {
                    // A reset between publish and receipt leaves the budget behind.
                    if attempt != reporter.reconnect_attempts() {
                        trace!(attempt, "stale reconnect request dropped");
                        continue;
                    }
                    if lifecycle.is_connected() {
                        trace!(attempt, "reconnect request ignored, link is up");
                        continue;
                    }
                    debug!(attempt, "reconnect requested");
                    if let Err(e) = lifecycle.reconnect_after(Duration::ZERO) {
                        warn!(attempt, error = %e, "reconnect not started");
                    }
                }
                Ok(ErrorEvent::RecoveryExhausted) => lifecycle.fail(),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "recovery missed error events"),
                Err(RecvError::Closed) => break,
            },
            event = lifecycle_events.recv() => match event {
                Ok(LifecycleEvent::Connected) if reporter.reconnect_attempts() > 0 => {
                    if let Some(record) = reporter.latest_of(ErrorKind::Connection) {
                        reporter.resolve(&record);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "recovery missed lifecycle events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
