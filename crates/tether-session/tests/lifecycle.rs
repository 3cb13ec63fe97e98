//! Integration tests for the connection lifecycle.
//!
//! A scripted transport lets each test decide when the link is "up".
//! Tests run with paused time so the 5 s polls and 180 s timeouts
//! resolve instantly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tether_session::{
    ConnectionLifecycle, ConnectionStatus, ErrorEvent, ErrorKind, ErrorReporter, LifecycleConfig,
    LifecycleEvent, Mode, ReporterConfig, SessionError,
};
use tether_transport::{ConnectionId, Transport, TransportError};
use tokio::sync::broadcast;

// =========================================================================
// Scripted transport
// =========================================================================

#[derive(Default)]
struct ScriptedTransport {
    server_active: AtomicBool,
    client_connected: AtomicBool,
    has_identity: AtomicBool,
    refuse: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl ScriptedTransport {
    fn set_link(&self, up: bool) {
        self.server_active.store(up, Ordering::SeqCst);
        self.client_connected.store(up, Ordering::SeqCst);
        self.has_identity.store(up, Ordering::SeqCst);
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn begin(&self, address: &str) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            Err(TransportError::AddressInUse(address.to_string()))
        } else {
            Ok(())
        }
    }
}

impl Transport for ScriptedTransport {
    fn connect_as_host(&self, address: &str, _port: u16) -> Result<(), TransportError> {
        self.begin(address)
    }

    fn connect_as_client(&self, address: &str, _port: u16) -> Result<(), TransportError> {
        self.begin(address)
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn is_server_active(&self) -> bool {
        self.server_active.load(Ordering::SeqCst)
    }

    fn is_client_connected(&self) -> bool {
        self.client_connected.load(Ordering::SeqCst)
    }

    fn local_client_id(&self) -> Option<ConnectionId> {
        self.has_identity
            .load(Ordering::SeqCst)
            .then_some(ConnectionId::SERVER)
    }

    fn send_bytes(&self, _to: ConnectionId, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }
}

// =========================================================================
// Helpers
// =========================================================================

struct Fixture {
    transport: Arc<ScriptedTransport>,
    reporter: ErrorReporter,
    lifecycle: ConnectionLifecycle,
    events: broadcast::Receiver<LifecycleEvent>,
}

fn fixture(config: LifecycleConfig) -> Fixture {
    let transport = Arc::new(ScriptedTransport::default());
    let reporter = ErrorReporter::new(ReporterConfig::default());
    let lifecycle = ConnectionLifecycle::new(config, transport.clone(), reporter.clone());
    let events = lifecycle.subscribe();
    Fixture {
        transport,
        reporter,
        lifecycle,
        events,
    }
}

fn fast_config(max_reconnect_attempts: u32) -> LifecycleConfig {
    LifecycleConfig {
        poll_interval: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(5),
        max_reconnect_attempts,
        reconnect_delay: Duration::from_secs(1),
    }
}

fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn entered(events: &[LifecycleEvent], status: ConnectionStatus) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, LifecycleEvent::StateChanged { to, .. } if *to == status))
        .count()
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

// =========================================================================
// Starting
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_start_host_with_ready_link_connects_immediately() {
    let mut f = fixture(LifecycleConfig::default());
    f.transport.set_link(true);

    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();

    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connected);
    assert_eq!(f.lifecycle.mode(), Some(Mode::Host));
    assert_eq!(
        drain(&mut f.events),
        vec![
            LifecycleEvent::StateChanged {
                from: ConnectionStatus::Disconnected,
                to: ConnectionStatus::Connecting,
            },
            LifecycleEvent::StateChanged {
                from: ConnectionStatus::Connecting,
                to: ConnectionStatus::Connected,
            },
            LifecycleEvent::Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_start_while_connected_is_rejected() {
    let f = fixture(LifecycleConfig::default());
    f.transport.set_link(true);
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();

    let result = f.lifecycle.start_client("127.0.0.1", 7777);

    assert!(matches!(
        result,
        Err(SessionError::AlreadyActive(ConnectionStatus::Connected))
    ));
    assert_eq!(f.transport.connects(), 1);
    assert_eq!(f.lifecycle.mode(), Some(Mode::Host));
}

#[tokio::test(start_paused = true)]
async fn test_start_while_connecting_is_rejected() {
    let f = fixture(LifecycleConfig::default());
    f.lifecycle.start_client("10.0.0.2", 7777).unwrap();

    let result = f.lifecycle.start_host("127.0.0.1", 7777);

    assert!(matches!(
        result,
        Err(SessionError::AlreadyActive(ConnectionStatus::Connecting))
    ));
    assert_eq!(f.transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_link_coming_up_is_seen_on_next_poll() {
    let f = fixture(LifecycleConfig::default());
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connecting);

    advance(7).await;
    f.transport.set_link(true);
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connecting);

    advance(4).await;
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_remote_connected_completes_start_without_waiting() {
    let f = fixture(LifecycleConfig::default());
    f.lifecycle.start_client("10.0.0.2", 7777).unwrap();

    f.transport.set_link(true);
    f.lifecycle.on_remote_connected(ConnectionId::SERVER);

    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_client_needs_identity_before_connected() {
    let f = fixture(LifecycleConfig::default());
    f.transport.client_connected.store(true, Ordering::SeqCst);

    f.lifecycle.start_client("10.0.0.2", 7777).unwrap();
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connecting);

    f.transport.has_identity.store(true, Ordering::SeqCst);
    f.lifecycle.on_remote_connected(ConnectionId::SERVER);
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_transport_refusing_to_start_fails_with_one_error() {
    let f = fixture(LifecycleConfig::default());
    f.transport.refuse.store(true, Ordering::SeqCst);

    let result = f.lifecycle.start_host("127.0.0.1", 7777);

    assert!(matches!(result, Err(SessionError::Transport(_))));
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Failed);
    assert_eq!(f.reporter.by_kind(ErrorKind::Connection).len(), 1);
}

// =========================================================================
// Timeout watch
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_host_never_ready_fails_exactly_once_after_timeout() {
    let mut f = fixture(LifecycleConfig::default());
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();

    advance(175).await;
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connecting);
    assert!(f.reporter.is_empty());

    advance(10).await;
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Failed);

    // Nothing else fires later.
    advance(600).await;
    let events = drain(&mut f.events);
    assert_eq!(entered(&events, ConnectionStatus::Failed), 1);
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Failed);

    let errors = f.reporter.by_kind(ErrorKind::Connection);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "connection timeout");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_timeout_watch() {
    let f = fixture(LifecycleConfig::default());
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();

    advance(30).await;
    f.lifecycle.disconnect();
    advance(600).await;

    assert_eq!(f.lifecycle.status(), ConnectionStatus::Disconnected);
    assert_eq!(f.lifecycle.mode(), None);
    assert!(f.reporter.is_empty());
    assert_eq!(f.transport.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_drops_pending_reconnect_request() {
    let f = fixture(LifecycleConfig::default());
    let mut errors = f.reporter.subscribe();
    f.transport.refuse.store(true, Ordering::SeqCst);
    assert!(f.lifecycle.start_client("10.0.0.2", 7777).is_err());
    assert!(f.reporter.has_pending_request());

    f.lifecycle.disconnect();
    advance(10).await;

    assert!(!f.reporter.has_pending_request());
    assert_eq!(f.reporter.reconnect_attempts(), 0);
    let mut requested = 0;
    while let Ok(event) = errors.try_recv() {
        if matches!(event, ErrorEvent::ReconnectRequested { .. }) {
            requested += 1;
        }
    }
    assert_eq!(requested, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_watch_does_not_fail_newer_attempt() {
    let f = fixture(LifecycleConfig::default());
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();
    advance(100).await;
    f.lifecycle.disconnect();
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();

    // The first watch would have expired at 180 s.
    advance(90).await;
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connecting);
    assert!(f.reporter.is_empty());

    advance(100).await;
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Failed);
    assert_eq!(f.reporter.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_from_failed_is_allowed() {
    let f = fixture(fast_config(3));
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();
    advance(10).await;
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Failed);

    f.transport.set_link(true);
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();

    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connected);
}

// =========================================================================
// Reconnect
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_link_lost_reconnects_after_delay() {
    let mut f = fixture(LifecycleConfig::default());
    f.transport.set_link(true);
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();
    drain(&mut f.events);

    f.transport.set_link(false);
    f.lifecycle.on_remote_disconnected(ConnectionId::SERVER);
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Reconnecting);
    assert_eq!(
        drain(&mut f.events),
        vec![
            LifecycleEvent::StateChanged {
                from: ConnectionStatus::Connected,
                to: ConnectionStatus::Reconnecting,
            },
            LifecycleEvent::Disconnected,
        ]
    );

    f.transport.set_link(true);
    advance(4).await;

    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connected);
    assert_eq!(f.transport.connects(), 2);
    assert_eq!(f.lifecycle.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_peer_leaving_with_link_up_keeps_connected() {
    let f = fixture(LifecycleConfig::default());
    f.transport.set_link(true);
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();

    f.lifecycle.on_remote_disconnected(ConnectionId::new(4));

    assert_eq!(f.lifecycle.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_budget_exhaustion_settles_at_failed() {
    let f = fixture(fast_config(2));
    f.transport.set_link(true);
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();
    f.transport.set_link(false);

    // Attempt 1: triggered by the link loss.
    f.lifecycle.on_remote_disconnected(ConnectionId::SERVER);
    advance(10).await;
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Failed);
    assert_eq!(f.lifecycle.reconnect_attempts(), 1);

    // Attempt 2.
    f.lifecycle.reconnect().unwrap();
    advance(10).await;
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Failed);
    assert_eq!(f.lifecycle.reconnect_attempts(), 2);
    let connects = f.transport.connects();

    // Budget spent.
    let result = f.lifecycle.reconnect();
    advance(10).await;

    assert!(matches!(
        result,
        Err(SessionError::ReconnectExhausted { attempts: 2 })
    ));
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Failed);
    assert_eq!(f.transport.connects(), connects);
    assert_eq!(f.reporter.by_kind(ErrorKind::Connection).len(), 2);

    // A further disconnect notification changes nothing.
    f.lifecycle.on_remote_disconnected(ConnectionId::SERVER);
    advance(10).await;
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Failed);
    assert_eq!(f.transport.connects(), connects);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_without_mode_is_an_error() {
    let f = fixture(LifecycleConfig::default());

    let result = f.lifecycle.reconnect();

    assert!(matches!(result, Err(SessionError::NoStoredMode)));
    assert_eq!(f.lifecycle.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let f = fixture(LifecycleConfig::default());
    f.transport.set_link(true);
    f.lifecycle.start_host("127.0.0.1", 7777).unwrap();

    f.lifecycle.reconnect().unwrap();
    f.lifecycle.disconnect();
    advance(10).await;

    assert_eq!(f.lifecycle.status(), ConnectionStatus::Disconnected);
    assert_eq!(f.transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transitions_to_same_state_publish_nothing() {
    let mut f = fixture(LifecycleConfig::default());

    f.lifecycle.disconnect();
    f.lifecycle.fail();
    f.lifecycle.fail();

    let events = drain(&mut f.events);
    assert_eq!(
        events,
        vec![LifecycleEvent::StateChanged {
            from: ConnectionStatus::Disconnected,
            to: ConnectionStatus::Failed,
        }]
    );
}
