//! Client-side request/response correlation.
//!
//! The correlator owns the pending-request table. A request sent with a
//! callback gets an entry plus a timeout task. The entry is resolved by
//! whichever comes first:
//!
//! - a response with the same id arrives, or
//! - the timeout fires (the callback then sees `code = Timeout`).
//!
//! Both paths go through [`Correlator::on_response_received`]'s internal
//! resolver, which removes the entry *before* running the callback, so
//! the loser finds nothing and the callback runs exactly once.
//!
//! Ids of timed-out requests are remembered for a while. A response for
//! one of them is late and dropped; a response for an id never seen is
//! unsolicited and goes to the response handlers and broadcast
//! subscribers instead.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tether_protocol::{
    Request, RequestId, RequestKind, Response, ResponseCode, now_millis, wire,
};
use tether_session::{ConnectionLifecycle, ErrorKind, ErrorRecord, ErrorReporter};
use tether_stats::StatsRecorder;
use tether_transport::{ConnectionId, Transport};
use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::{RpcConfig, RpcError, router::panic_message};

const BROADCAST_CAPACITY: usize = 64;

/// Called once with the response (or a synthesized `Timeout`/`Failed` one).
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send>;

type ResponseHandler = Arc<dyn Fn(&Response) + Send + Sync>;

struct PendingRequest {
    kind: RequestKind,
    callback: ResponseCallback,
    sent_at: Instant,
    timeout: AbortHandle,
}

/// Who is resolving a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Remote,
    Timeout,
}

/// Bounded memory of timed-out ids, oldest forgotten first.
struct ExpiredIds {
    order: VecDeque<RequestId>,
    ids: HashSet<RequestId>,
    capacity: usize,
}

impl ExpiredIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: RequestId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, id: &RequestId) -> bool {
        self.ids.contains(id)
    }
}

/// Everything the correlator talks to.
pub struct CorrelatorParts {
    pub config: RpcConfig,
    /// Stamped into every outgoing request's `sender_id`.
    pub sender_id: String,
    pub transport: Arc<dyn Transport>,
    pub lifecycle: ConnectionLifecycle,
    pub reporter: ErrorReporter,
    pub recorder: StatsRecorder,
}

/// Sends requests and matches responses to their callbacks.
///
/// Cheap to clone; clones share the pending table. Sending must happen
/// inside a Tokio runtime (timeouts are tasks).
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

struct Inner {
    config: RpcConfig,
    sender_id: String,
    transport: Arc<dyn Transport>,
    lifecycle: ConnectionLifecycle,
    reporter: ErrorReporter,
    recorder: StatsRecorder,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    expired: Mutex<ExpiredIds>,
    handlers: RwLock<HashMap<RequestKind, ResponseHandler>>,
    broadcasts: broadcast::Sender<Response>,
}

impl Correlator {
    pub fn new(parts: CorrelatorParts) -> Self {
        let config = parts.config.validated();
        let (broadcasts, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                expired: Mutex::new(ExpiredIds::new(config.expired_capacity)),
                config,
                sender_id: parts.sender_id,
                transport: parts.transport,
                lifecycle: parts.lifecycle,
                reporter: parts.reporter,
                recorder: parts.recorder,
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                broadcasts,
            }),
        }
    }

    /// Sends `request` to the server.
    ///
    /// With a `callback`, the request is tracked and the callback runs
    /// exactly once: with the matching response, with `Timeout` after
    /// `timeout` (default from config), or with `Failed` if it could not be
    /// sent or was canceled. When not connected the callback runs before
    /// this returns and nothing is tracked.
    ///
    /// Returns the id the request went out with. It differs from
    /// `request.id` only if that id was already in flight.
    ///
    /// # Errors
    /// [`RpcError::NotConnected`] or [`RpcError::Transport`]. The callback
    /// has already been resolved in both cases.
    pub fn send(
        &self,
        mut request: Request,
        callback: Option<ResponseCallback>,
        timeout: Option<Duration>,
    ) -> Result<RequestId, RpcError> {
        if !self.inner.lifecycle.is_connected() {
            warn!(request_id = %request.id, kind = %request.kind, "send while not connected");
            if let Some(callback) = callback {
                run_callback(callback, Response::reply(&request, ResponseCode::Failed, "not connected"));
            }
            return Err(RpcError::NotConnected);
        }

        request.sender_id = self.inner.sender_id.clone();
        request.created_at = now_millis();
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);

        if let Some(callback) = callback {
            let mut pending = self.pending();
            while pending.contains_key(&request.id) {
                let fresh = RequestId::generate();
                warn!(old = %request.id, new = %fresh, "request id already in flight, reassigned");
                request.id = fresh;
            }
            let task = self.spawn_timeout(request.id.clone(), request.kind.clone(), timeout);
            pending.insert(
                request.id.clone(),
                PendingRequest {
                    kind: request.kind.clone(),
                    callback,
                    sent_at: Instant::now(),
                    timeout: task,
                },
            );
        }

        let bytes = wire::encode_request(&request).into_bytes();
        match self.inner.transport.send_bytes(ConnectionId::SERVER, &bytes) {
            Ok(()) => {
                self.inner.recorder.record_sent(bytes.len());
                debug!(request_id = %request.id, kind = %request.kind, bytes = bytes.len(), "request sent");
                Ok(request.id)
            }
            Err(e) => {
                let message = format!("send failed: {e}");
                self.inner.reporter.report(
                    ErrorRecord::new(ErrorKind::Client, message.clone())
                        .with_context("correlator.send")
                        .with_request(request.id.clone()),
                );
                if let Some(entry) = self.take_pending(&request.id) {
                    entry.timeout.abort();
                    run_callback(entry.callback, Response::reply(&request, ResponseCode::Failed, message));
                }
                Err(e.into())
            }
        }
    }

    /// Sends `request` and waits for its one response.
    ///
    /// Never fails: problems arrive as a `Failed` or `Timeout` response.
    pub async fn request(&self, request: Request, timeout: Option<Duration>) -> Response {
        let (tx, rx) = oneshot::channel();
        let fallback = Response::reply(&request, ResponseCode::Failed, RpcError::Canceled.to_string());
        let callback: ResponseCallback = Box::new(move |response| {
            // The caller may have stopped waiting.
            let _ = tx.send(response);
        });
        if let Err(e) = self.send(request, Some(callback), timeout) {
            trace!(error = %e, "request resolved without being sent");
        }
        rx.await.unwrap_or(fallback)
    }

    /// Entry point for every response read off the transport.
    pub fn on_response_received(&self, response: Response) {
        self.resolve(response, Origin::Remote);
    }

    /// Resolves every pending request with `Failed` and `reason`.
    /// Responses that arrive for them later are dropped.
    ///
    /// Returns how many were canceled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = self.pending().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.timeout.abort();
            // Answers that still arrive are late, not broadcasts.
            self.expired().insert(id.clone());
            let mut response = Response::new(id, ResponseCode::Failed, reason);
            response.kind = Some(entry.kind);
            run_callback(entry.callback, response);
        }
        if count > 0 {
            debug!(count, reason, "pending requests canceled");
        }
        count
    }

    /// Registers `handler` for unsolicited responses of `kind`.
    pub fn register_response_handler<F>(&self, kind: RequestKind, handler: F)
    where
        F: Fn(&Response) + Send + Sync + 'static,
    {
        let replaced = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.clone(), Arc::new(handler))
            .is_some();
        debug!(%kind, replaced, "response handler registered");
    }

    /// Every unsolicited response, whether or not a handler took it.
    pub fn subscribe_broadcasts(&self) -> broadcast::Receiver<Response> {
        self.inner.broadcasts.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.pending().contains_key(id)
    }

    pub fn sender_id(&self) -> &str {
        &self.inner.sender_id
    }

    // -- internals ----------------------------------------------------------

    fn resolve(&self, mut response: Response, origin: Origin) {
        let Some(entry) = self.take_pending(&response.request_id) else {
            match origin {
                Origin::Timeout => {}
                Origin::Remote if self.expired().contains(&response.request_id) => {
                    warn!(request_id = %response.request_id, code = %response.code, "late response dropped");
                }
                Origin::Remote => self.forward_unsolicited(response),
            }
            return;
        };

        entry.timeout.abort();
        if response.kind.is_none() {
            response.kind = Some(entry.kind.clone());
        }
        match origin {
            Origin::Remote => {
                let rtt = entry.sent_at.elapsed();
                self.inner.recorder.record_rtt(rtt);
                debug!(request_id = %response.request_id, code = %response.code, rtt = ?rtt, "response matched");
            }
            Origin::Timeout => {
                self.expired().insert(response.request_id.clone());
                warn!(request_id = %response.request_id, kind = %entry.kind, "request timed out");
                self.inner.reporter.report(
                    ErrorRecord::new(ErrorKind::Timeout, format!("{} request timed out", entry.kind))
                        .with_context("correlator.timeout")
                        .with_request(response.request_id.clone()),
                );
            }
        }
        run_callback(entry.callback, response);
    }

    fn forward_unsolicited(&self, response: Response) {
        let handler = response.kind.as_ref().and_then(|kind| {
            self.inner
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(kind)
                .cloned()
        });
        match handler {
            Some(handler) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(&response))) {
                    error!(
                        request_id = %response.request_id,
                        message = %panic_message(payload.as_ref()),
                        "response handler panicked"
                    );
                }
            }
            None => trace!(request_id = %response.request_id, "unsolicited response without handler"),
        }
        let _ = self.inner.broadcasts.send(response);
    }

    fn spawn_timeout(&self, id: RequestId, kind: RequestKind, timeout: Duration) -> AbortHandle {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut response = Response::new(id, ResponseCode::Timeout, "request timed out");
            response.kind = Some(kind);
            Correlator { inner }.resolve(response, Origin::Timeout);
        });
        task.abort_handle()
    }

    fn take_pending(&self, id: &RequestId) -> Option<PendingRequest> {
        self.pending().remove(id)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expired(&self) -> MutexGuard<'_, ExpiredIds> {
        self.inner.expired.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs a per-request callback, containing any panic so the caller (often
/// the transport event pump) keeps going.
fn run_callback(callback: ResponseCallback, response: Response) {
    let request_id = response.request_id.clone();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(response))) {
        error!(
            %request_id,
            message = %panic_message(payload.as_ref()),
            "response callback panicked"
        );
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("sender_id", &self.inner.sender_id)
            .field("pending", &self.pending_count())
            .finish()
    }
}
