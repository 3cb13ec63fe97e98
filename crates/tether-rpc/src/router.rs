//! Server-side dispatch of requests to handlers.
//!
//! Handlers are plain functions keyed by [`RequestKind`]. Whatever a
//! handler does, [`RequestRouter::dispatch`] hands back a well-formed
//! answer:
//!
//! | Handler outcome | Dispatch result |
//! |---|---|
//! | no handler for the kind | `NotFound` "no handler registered" |
//! | `Ok(Some(response))` | that response |
//! | `Ok(None)` for the broadcast kind | `None` (nothing to send) |
//! | `Ok(None)` for any other kind | `ServerError` "handler returned no response" |
//! | `Err(e)` | `ServerError` with `e`'s message |
//! | panic | `ServerError` with the panic message |

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tether_protocol::{Request, RequestKind, Response, ResponseCode};
use tracing::{debug, error, trace, warn};

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler produces. `Ok(None)` means "no reply".
pub type HandlerResult = Result<Option<Response>, HandlerError>;

type RequestHandler = Arc<dyn Fn(&Request) -> HandlerResult + Send + Sync>;

/// Dispatch table from request kind to handler.
pub struct RequestRouter {
    handlers: RwLock<HashMap<RequestKind, RequestHandler>>,
    broadcast_kind: Option<RequestKind>,
}

impl RequestRouter {
    /// Creates an empty router. Handlers for `broadcast_kind` may return
    /// no response.
    pub fn new(broadcast_kind: Option<RequestKind>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            broadcast_kind,
        }
    }

    /// Registers `handler` for `kind`, replacing any previous one.
    pub fn register<F>(&self, kind: RequestKind, handler: F)
    where
        F: Fn(&Request) -> HandlerResult + Send + Sync + 'static,
    {
        let replaced = self
            .write()
            .insert(kind.clone(), Arc::new(handler))
            .is_some();
        debug!(%kind, replaced, "request handler registered");
    }

    /// Removes the handler for `kind`. Returns whether one existed.
    pub fn unregister(&self, kind: &RequestKind) -> bool {
        self.write().remove(kind).is_some()
    }

    pub fn has_handler(&self, kind: &RequestKind) -> bool {
        self.read().contains_key(kind)
    }

    pub fn broadcast_kind(&self) -> Option<&RequestKind> {
        self.broadcast_kind.as_ref()
    }

    /// Runs the handler for `request`.
    ///
    /// Never panics and never propagates handler errors. `None` means
    /// there is nothing to send back.
    pub fn dispatch(&self, request: &Request) -> Option<Response> {
        // Clone the handler out so it runs without the table locked.
        let handler = self.read().get(&request.kind).cloned();
        let Some(handler) = handler else {
            warn!(kind = %request.kind, request_id = %request.id, "no handler registered");
            return Some(Response::reply(
                request,
                ResponseCode::NotFound,
                "no handler registered",
            ));
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler(request))) {
            Ok(Ok(Some(response))) => Some(self.stamp(request, response)),
            Ok(Ok(None)) if self.broadcast_kind.as_ref() == Some(&request.kind) => {
                trace!(kind = %request.kind, request_id = %request.id, "broadcast handled, no reply");
                None
            }
            Ok(Ok(None)) => {
                warn!(kind = %request.kind, request_id = %request.id, "handler returned no response");
                Some(Response::reply(
                    request,
                    ResponseCode::ServerError,
                    "handler returned no response",
                ))
            }
            Ok(Err(e)) => {
                error!(kind = %request.kind, request_id = %request.id, error = %e, "handler failed");
                Some(Response::reply(request, ResponseCode::ServerError, e.to_string()))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(kind = %request.kind, request_id = %request.id, %message, "handler panicked");
                Some(Response::reply(request, ResponseCode::ServerError, message))
            }
        }
    }

    /// Ties a handler's response to the request it answers.
    fn stamp(&self, request: &Request, mut response: Response) -> Response {
        if response.request_id != request.id {
            debug!(
                expected = %request.id,
                got = %response.request_id,
                "handler response carried a foreign id, corrected"
            );
            response.request_id = request.id.clone();
        }
        if response.kind.is_none() {
            response.kind = Some(request.kind.clone());
        }
        response
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RequestKind, RequestHandler>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RequestKind, RequestHandler>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RequestRouter {
    fn default() -> Self {
        Self::new(Some(RequestKind::Chat))
    }
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.read();
        let kinds: Vec<String> = handlers.keys().map(ToString::to_string).collect();
        f.debug_struct("RequestRouter")
            .field("kinds", &kinds)
            .field("broadcast_kind", &self.broadcast_kind)
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
