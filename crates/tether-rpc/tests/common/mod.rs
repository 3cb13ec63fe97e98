//! Shared fixtures for the RPC integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tether_protocol::{Frame, Request, Response};
use tether_rpc::{Correlator, CorrelatorParts, RpcConfig};
use tether_session::{
    ConnectionLifecycle, ErrorReporter, LifecycleConfig, ReporterConfig,
};
use tether_stats::StatsRecorder;
use tether_transport::{ConnectionId, Transport, TransportError};

/// A transport whose link is always up and which records what is sent.
#[derive(Default)]
pub struct RecordingTransport {
    pub refuse_sends: AtomicBool,
    sent: Mutex<Vec<(ConnectionId, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(ConnectionId, Frame)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(to, bytes)| (*to, Frame::from_bytes(bytes).unwrap()))
            .collect()
    }

    pub fn sent_requests(&self) -> Vec<Request> {
        self.sent()
            .into_iter()
            .filter_map(|(_, frame)| match frame {
                Frame::Request(request) => Some(request),
                Frame::Response(_) => None,
            })
            .collect()
    }

    pub fn sent_responses(&self) -> Vec<(ConnectionId, Response)> {
        self.sent()
            .into_iter()
            .filter_map(|(to, frame)| match frame {
                Frame::Response(response) => Some((to, response)),
                Frame::Request(_) => None,
            })
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn connect_as_host(&self, _address: &str, _port: u16) -> Result<(), TransportError> {
        Ok(())
    }

    fn connect_as_client(&self, _address: &str, _port: u16) -> Result<(), TransportError> {
        Ok(())
    }

    fn disconnect(&self) {}

    fn is_server_active(&self) -> bool {
        true
    }

    fn is_client_connected(&self) -> bool {
        true
    }

    fn local_client_id(&self) -> Option<ConnectionId> {
        Some(ConnectionId::SERVER)
    }

    fn send_bytes(&self, to: ConnectionId, data: &[u8]) -> Result<(), TransportError> {
        if self.refuse_sends.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push((to, data.to_vec()));
        Ok(())
    }
}

pub struct Fixture {
    pub transport: Arc<RecordingTransport>,
    pub reporter: ErrorReporter,
    pub lifecycle: ConnectionLifecycle,
    pub recorder: StatsRecorder,
    pub correlator: Correlator,
}

/// A correlator over a recording transport. The lifecycle is left
/// disconnected; call [`Fixture::connect`] first for most tests.
pub fn fixture() -> Fixture {
    let transport = Arc::new(RecordingTransport::default());
    let reporter = ErrorReporter::new(ReporterConfig::default());
    let lifecycle = ConnectionLifecycle::new(
        LifecycleConfig::default(),
        transport.clone(),
        reporter.clone(),
    );
    let recorder = StatsRecorder::new(1.0);
    let correlator = Correlator::new(CorrelatorParts {
        config: RpcConfig::default(),
        sender_id: "tester".into(),
        transport: transport.clone(),
        lifecycle: lifecycle.clone(),
        reporter: reporter.clone(),
        recorder: recorder.clone(),
    });
    Fixture {
        transport,
        reporter,
        lifecycle,
        recorder,
        correlator,
    }
}

impl Fixture {
    pub fn connect(&self) {
        self.lifecycle.start_client("127.0.0.1", 7777).unwrap();
        assert!(self.lifecycle.is_connected());
    }
}

/// Collects callback invocations.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<Response>>>);

impl Calls {
    pub fn callback(&self) -> tether_rpc::ResponseCallback {
        let calls = self.0.clone();
        Box::new(move |response| calls.lock().unwrap().push(response))
    }

    pub fn all(&self) -> Vec<Response> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
