//! Request, response and payload types.
//!
//! These are the structures that travel on the wire. Their text encoding
//! lives in [`wire`](crate::wire); value encoding inside payloads goes
//! through the [`Codec`].

use std::any::Any;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::Codec;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// Correlation id linking a [`Request`] to its [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wraps an id received from the wire.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id (128 bits, 32 hex chars).
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::rng().random();
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// RequestKind / ResponseCode
// ---------------------------------------------------------------------------

/// What a request asks for. Routing key for handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Ping,
    Login,
    PlayerData,
    SpawnObject,
    PlaceBuilding,
    Inventory,
    /// Fire-and-forget chat; handlers usually broadcast instead of replying.
    Chat,
    /// Application-defined kind.
    Custom(String),
    /// A kind this build doesn't know.
    Unknown,
}

const CUSTOM_PREFIX: &str = "custom.";

impl RequestKind {
    /// Parses the wire name. Unrecognised names become [`RequestKind::Unknown`].
    pub fn from_wire(name: &str) -> Self {
        match name {
            "Ping" => Self::Ping,
            "Login" => Self::Login,
            "PlayerData" => Self::PlayerData,
            "SpawnObject" => Self::SpawnObject,
            "PlaceBuilding" => Self::PlaceBuilding,
            "Inventory" => Self::Inventory,
            "Chat" => Self::Chat,
            other => match other.strip_prefix(CUSTOM_PREFIX) {
                Some(custom) if !custom.is_empty() => Self::Custom(custom.to_string()),
                _ => Self::Unknown,
            },
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping => write!(f, "Ping"),
            Self::Login => write!(f, "Login"),
            Self::PlayerData => write!(f, "PlayerData"),
            Self::SpawnObject => write!(f, "SpawnObject"),
            Self::PlaceBuilding => write!(f, "PlaceBuilding"),
            Self::Inventory => write!(f, "Inventory"),
            Self::Chat => write!(f, "Chat"),
            Self::Custom(name) => write!(f, "{CUSTOM_PREFIX}{name}"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    Success,
    Failed,
    NotFound,
    InvalidData,
    Unauthorized,
    ServerError,
    Timeout,
    Unknown,
    Custom,
}

impl ResponseCode {
    /// Parses the wire name. Unrecognised names become [`ResponseCode::Unknown`].
    pub fn from_wire(name: &str) -> Self {
        match name {
            "Success" => Self::Success,
            "Failed" => Self::Failed,
            "NotFound" => Self::NotFound,
            "InvalidData" => Self::InvalidData,
            "Unauthorized" => Self::Unauthorized,
            "ServerError" => Self::ServerError,
            "Timeout" => Self::Timeout,
            "Custom" => Self::Custom,
            _ => Self::Unknown,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// One `(key, value, type)` entry of a [`Payload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadEntry {
    pub key: String,
    pub value: String,
    pub type_name: String,
}

/// Ordered key/value data attached to requests, responses and errors.
///
/// Entries keep insertion order. Writing an existing key replaces its
/// value in place, so lookups always see the last write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    entries: Vec<PayloadEntry>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an already-encoded value.
    pub fn insert_raw(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        type_name: impl Into<String>,
    ) {
        let key = key.into();
        let value = value.into();
        let type_name = type_name.into();
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.value = value;
                entry.type_name = type_name;
            }
            None => self.entries.push(PayloadEntry {
                key,
                value,
                type_name,
            }),
        }
    }

    /// Encodes `value` with `codec` and stores it under `key`.
    pub fn insert<T: Any + Serialize>(&mut self, codec: &Codec, key: impl Into<String>, value: &T) {
        let encoded = codec.encode(value);
        self.insert_raw(key, encoded, codec.type_name_of::<T>());
    }

    /// Decodes the value under `key`, if present.
    pub fn get<T: Any + DeserializeOwned + Default>(&self, codec: &Codec, key: &str) -> Option<T> {
        self.get_raw(key).map(|entry| codec.decode(&entry.value))
    }

    pub fn get_raw(&self, key: &str) -> Option<&PayloadEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get_raw(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<PayloadEntry> {
        let index = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(index))
    }

    pub fn entries(&self) -> &[PayloadEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

/// A correlated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    /// Filled in by the correlator when the request is sent.
    pub sender_id: String,
    pub created_at: u64,
    pub payload: Payload,
}

impl Request {
    /// Creates a request with a fresh id and an empty payload.
    pub fn new(kind: RequestKind) -> Self {
        Self {
            id: RequestId::generate(),
            kind,
            sender_id: String::new(),
            created_at: now_millis(),
            payload: Payload::new(),
        }
    }

    /// Builder-style [`Payload::insert`].
    pub fn with<T: Any + Serialize>(mut self, codec: &Codec, key: &str, value: &T) -> Self {
        self.payload.insert(codec, key, value);
        self
    }
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    pub request_id: RequestId,
    /// Kind of the originating request, when known.
    pub kind: Option<RequestKind>,
    pub code: ResponseCode,
    pub message: String,
    pub payload: Payload,
    pub created_at: u64,
}

impl Response {
    pub fn new(request_id: RequestId, code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            request_id,
            kind: None,
            code,
            message: message.into(),
            payload: Payload::new(),
            created_at: now_millis(),
        }
    }

    /// A response to `request`, tagged with its kind.
    pub fn reply(request: &Request, code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            kind: Some(request.kind.clone()),
            ..Self::new(request.id.clone(), code, message)
        }
    }

    /// A `Success` reply with an empty message.
    pub fn success(request: &Request) -> Self {
        Self::reply(request, ResponseCode::Success, "")
    }

    /// Builder-style [`Payload::insert`].
    pub fn with<T: Any + Serialize>(mut self, codec: &Codec, key: &str, value: &T) -> Self {
        self.payload.insert(codec, key, value);
        self
    }
}
