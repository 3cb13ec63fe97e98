//! Inbound message path: bytes from the transport to router or correlator.

use std::sync::Arc;

use tether_protocol::{Frame, ProtocolError};
use tether_session::{ErrorKind, ErrorRecord, ErrorReporter};
use tether_stats::StatsRecorder;
use tether_transport::{ConnectionId, Transport};
use tracing::trace;

use crate::{Correlator, RequestRouter, RpcError};

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// A request was handled and its response sent back.
    Replied,
    /// A broadcast request was handled; nothing to send back.
    NoReply,
    /// A response was handed to the correlator.
    Response,
}

/// Decodes inbound frames and routes them.
///
/// Requests go to the [`RequestRouter`] and the answer goes back to the
/// sender. Responses go to the [`Correlator`]. Failures are reported to the
/// [`ErrorReporter`] and also returned.
pub struct Dispatcher {
    router: Arc<RequestRouter>,
    correlator: Correlator,
    transport: Arc<dyn Transport>,
    reporter: ErrorReporter,
    recorder: StatsRecorder,
}

impl Dispatcher {
    pub fn new(
        router: Arc<RequestRouter>,
        correlator: Correlator,
        transport: Arc<dyn Transport>,
        reporter: ErrorReporter,
        recorder: StatsRecorder,
    ) -> Self {
        Self {
            router,
            correlator,
            transport,
            reporter,
            recorder,
        }
    }

    /// Handles one message received from `from`.
    ///
    /// # Errors
    /// [`RpcError::Protocol`] when the frame cannot be decoded (reported as
    /// a deserialization error), [`RpcError::Transport`] when a reply
    /// cannot be sent (reported as a server error).
    pub fn handle(&self, from: ConnectionId, data: &[u8]) -> Result<Inbound, RpcError> {
        self.recorder.record_received(data.len());

        let frame = Frame::from_bytes(data).inspect_err(|e| self.report_decode(from, e))?;
        match frame {
            Frame::Request(request) => {
                trace!(%from, request_id = %request.id, kind = %request.kind, "request received");
                let Some(response) = self.router.dispatch(&request) else {
                    return Ok(Inbound::NoReply);
                };

                let bytes = Frame::Response(response).to_bytes();
                if let Err(e) = self.transport.send_bytes(from, &bytes) {
                    self.reporter.report(
                        ErrorRecord::new(ErrorKind::Server, format!("reply to {from} failed: {e}"))
                            .with_context("dispatcher.reply")
                            .with_request(request.id),
                    );
                    return Err(e.into());
                }
                self.recorder.record_sent(bytes.len());
                Ok(Inbound::Replied)
            }
            Frame::Response(response) => {
                trace!(%from, request_id = %response.request_id, code = %response.code, "response received");
                self.correlator.on_response_received(response);
                Ok(Inbound::Response)
            }
        }
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    fn report_decode(&self, from: ConnectionId, error: &ProtocolError) {
        self.reporter.report(
            ErrorRecord::new(ErrorKind::Deserialization, format!("undecodable frame from {from}: {error}"))
                .with_context("dispatcher.decode"),
        );
    }
}
