//! In-process transport: endpoints talk through a shared [`MemoryHub`].
//!
//! A host endpoint registers itself under `address:port`. Client endpoints
//! connect by the same key, get an id ≥ 1 and both sides see a
//! [`TransportEvent::Connected`]. Delivery is immediate, reliable and
//! ordered (one unbounded channel per endpoint).
//!
//! Locking rule: at most one endpoint's state lock is held at a time, and
//! never while the hub's listener map is locked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::{
    ConnectionId, EventReceiver, EventSender, Transport, TransportError,
    TransportEvent,
};

/// Shared registry of listening hosts.
#[derive(Clone, Default)]
pub struct MemoryHub {
    listeners: Arc<Mutex<HashMap<String, Weak<Endpoint>>>>,
}

impl MemoryHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new idle endpoint attached to this hub, plus the channel
    /// on which it reports events.
    pub fn endpoint(&self) -> (MemoryTransport, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Endpoint {
            events,
            state: Mutex::new(Role::Idle),
        });
        (
            MemoryTransport {
                hub: self.clone(),
                endpoint,
            },
            rx,
        )
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<String, Weak<Endpoint>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Endpoint {
    events: EventSender,
    state: Mutex<Role>,
}

impl Endpoint {
    fn role(&self) -> MutexGuard<'_, Role> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        // The receiver being gone just means nobody listens any more.
        let _ = self.events.send(event);
    }
}

enum Role {
    Idle,
    Host {
        key: String,
        next_id: u64,
        clients: HashMap<ConnectionId, Weak<Endpoint>>,
    },
    Client {
        key: String,
        id: ConnectionId,
        server: Weak<Endpoint>,
    },
}

/// One endpoint of a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    endpoint: Arc<Endpoint>,
}

fn listen_key(address: &str, port: u16) -> String {
    format!("{address}:{port}")
}

impl Transport for MemoryTransport {
    fn connect_as_host(&self, address: &str, port: u16) -> Result<(), TransportError> {
        let key = listen_key(address, port);
        if !matches!(*self.endpoint.role(), Role::Idle) {
            return Err(TransportError::AlreadyActive);
        }

        {
            let mut listeners = self.hub.listeners();
            if listeners
                .get(&key)
                .is_some_and(|existing| existing.strong_count() > 0)
            {
                return Err(TransportError::AddressInUse(key));
            }
            listeners.insert(key.clone(), Arc::downgrade(&self.endpoint));
        }

        *self.endpoint.role() = Role::Host {
            key: key.clone(),
            next_id: 1,
            clients: HashMap::new(),
        };
        tracing::debug!(%key, "memory host listening");
        Ok(())
    }

    fn connect_as_client(&self, address: &str, port: u16) -> Result<(), TransportError> {
        let key = listen_key(address, port);
        if !matches!(*self.endpoint.role(), Role::Idle) {
            return Err(TransportError::AlreadyActive);
        }

        let server = self
            .hub
            .listeners()
            .get(&key)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(key.clone()))?;

        let id = {
            let mut role = server.role();
            match &mut *role {
                Role::Host {
                    next_id, clients, ..
                } => {
                    let id = ConnectionId::new(*next_id);
                    *next_id += 1;
                    clients.insert(id, Arc::downgrade(&self.endpoint));
                    id
                }
                _ => return Err(TransportError::Unreachable(key)),
            }
        };

        *self.endpoint.role() = Role::Client {
            key: key.clone(),
            id,
            server: Arc::downgrade(&server),
        };

        tracing::debug!(%key, %id, "memory client connected");
        server.emit(TransportEvent::Connected(id));
        self.endpoint.emit(TransportEvent::Connected(ConnectionId::SERVER));
        Ok(())
    }

    fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.endpoint.role(), Role::Idle);
        match previous {
            Role::Idle => {}
            Role::Client { id, server, .. } => {
                if let Some(server) = server.upgrade() {
                    if let Role::Host { clients, .. } = &mut *server.role() {
                        clients.remove(&id);
                    }
                    server.emit(TransportEvent::Disconnected(id));
                }
                self.endpoint
                    .emit(TransportEvent::Disconnected(ConnectionId::SERVER));
                tracing::debug!(%id, "memory client disconnected");
            }
            Role::Host { key, clients, .. } => {
                self.hub.listeners().remove(&key);
                for (id, client) in clients {
                    if let Some(client) = client.upgrade() {
                        {
                            let mut role = client.role();
                            if matches!(&*role, Role::Client { key: k, .. } if *k == key) {
                                *role = Role::Idle;
                            }
                        }
                        client.emit(TransportEvent::Disconnected(ConnectionId::SERVER));
                    }
                    self.endpoint.emit(TransportEvent::Disconnected(id));
                }
                tracing::debug!(%key, "memory host stopped");
            }
        }
    }

    fn is_server_active(&self) -> bool {
        matches!(*self.endpoint.role(), Role::Host { .. })
    }

    fn is_client_connected(&self) -> bool {
        match &*self.endpoint.role() {
            Role::Idle => false,
            Role::Host { .. } => true,
            Role::Client { server, .. } => server.strong_count() > 0,
        }
    }

    fn local_client_id(&self) -> Option<ConnectionId> {
        match &*self.endpoint.role() {
            Role::Idle => None,
            Role::Host { .. } => Some(ConnectionId::SERVER),
            Role::Client { id, .. } => Some(*id),
        }
    }

    fn send_bytes(&self, to: ConnectionId, data: &[u8]) -> Result<(), TransportError> {
        let (target, from) = match &*self.endpoint.role() {
            Role::Idle => return Err(TransportError::NotConnected),
            Role::Host { clients, .. } => {
                if to.is_server() {
                    // Host-local client talking to its own server.
                    (Arc::clone(&self.endpoint), ConnectionId::SERVER)
                } else {
                    let client = clients
                        .get(&to)
                        .and_then(Weak::upgrade)
                        .ok_or(TransportError::UnknownPeer(to))?;
                    (client, ConnectionId::SERVER)
                }
            }
            Role::Client { id, server, .. } => {
                if !to.is_server() {
                    return Err(TransportError::UnknownPeer(to));
                }
                let server = server.upgrade().ok_or_else(|| {
                    TransportError::ConnectionClosed("host went away".into())
                })?;
                (server, *id)
            }
        };

        target.emit(TransportEvent::Received {
            from,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn peer_count(&self) -> usize {
        match &*self.endpoint.role() {
            Role::Idle => 0,
            Role::Host { clients, .. } => clients.len(),
            Role::Client { .. } => 1,
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
