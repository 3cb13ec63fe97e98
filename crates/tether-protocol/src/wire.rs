//! The flat text wire format.
//!
//! A frame is a list of `key:value;` fields:
//!
//! ```text
//! request:  id:<id>;type:<kind>;sender:<sender>;time:<ms>;data:<payload>;
//! response: id:<id>;code:<code>;msg:<message>;time:<ms>;data:<payload>;[type:<kind>;]
//! ```
//!
//! `data` nests the payload: entries joined by `,`, each entry being
//! `key|value|type`. Every level escapes its own separator (see
//! [`escape`](crate::escape)).
//!
//! Decoding is lenient. Field order does not matter, unknown fields are
//! ignored, and a missing or malformed non-essential field falls back to
//! a default with a warning. Only a missing `id` (or a frame that is
//! neither a request nor a response) is fatal.

use std::collections::HashMap;

use crate::escape::{escape, join_escaped, split_escaped};
use crate::{
    Payload, ProtocolError, Request, RequestId, RequestKind, Response,
    ResponseCode, now_millis,
};

const FIELD_SEP: char = ';';
const ENTRY_SEP: char = ',';
const PART_SEP: char = '|';

/// A decoded message: either side of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl Frame {
    /// Encodes the frame as wire text.
    pub fn encode(&self) -> String {
        match self {
            Self::Request(request) => encode_request(request),
            Self::Response(response) => encode_response(response),
        }
    }

    /// Encodes the frame as UTF-8 bytes for the transport.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }

    /// Decodes wire text. A frame with a `code` field is a response;
    /// otherwise a frame with a `type` field is a request.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let fields = parse_fields(text);
        if fields.contains_key("code") {
            response_from_fields(fields).map(Self::Response)
        } else if fields.contains_key("type") {
            request_from_fields(fields).map(Self::Request)
        } else {
            Err(ProtocolError::UnknownFrame)
        }
    }

    /// Decodes transport bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = String::from_utf8(data.to_vec())?;
        Self::decode(&text)
    }
}

impl From<Request> for Frame {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Frame {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

pub fn encode_request(request: &Request) -> String {
    let mut out = String::new();
    push_field(&mut out, "id", request.id.as_str());
    push_field(&mut out, "type", &request.kind.to_string());
    push_field(&mut out, "sender", &request.sender_id);
    push_field(&mut out, "time", &request.created_at.to_string());
    push_field(&mut out, "data", &encode_payload(&request.payload));
    out
}

pub fn decode_request(text: &str) -> Result<Request, ProtocolError> {
    request_from_fields(parse_fields(text))
}

pub fn encode_response(response: &Response) -> String {
    let mut out = String::new();
    push_field(&mut out, "id", response.request_id.as_str());
    push_field(&mut out, "code", &response.code.to_string());
    push_field(&mut out, "msg", &response.message);
    push_field(&mut out, "time", &response.created_at.to_string());
    push_field(&mut out, "data", &encode_payload(&response.payload));
    if let Some(kind) = &response.kind {
        push_field(&mut out, "type", &kind.to_string());
    }
    out
}

pub fn decode_response(text: &str) -> Result<Response, ProtocolError> {
    response_from_fields(parse_fields(text))
}

fn request_from_fields(mut fields: HashMap<String, String>) -> Result<Request, ProtocolError> {
    let id = fields.remove("id").ok_or(ProtocolError::MissingField("id"))?;
    let kind = match fields.remove("type") {
        Some(name) => RequestKind::from_wire(&name),
        None => {
            tracing::warn!(%id, "request without type, treating as Unknown");
            RequestKind::Unknown
        }
    };
    Ok(Request {
        kind,
        sender_id: fields.remove("sender").unwrap_or_default(),
        created_at: parse_time(fields.remove("time"), &id),
        payload: fields
            .remove("data")
            .map(|d| decode_payload(&d))
            .unwrap_or_default(),
        id: RequestId::new(id),
    })
}

fn response_from_fields(mut fields: HashMap<String, String>) -> Result<Response, ProtocolError> {
    let id = fields.remove("id").ok_or(ProtocolError::MissingField("id"))?;
    let code = match fields.remove("code") {
        Some(name) => ResponseCode::from_wire(&name),
        None => {
            tracing::warn!(%id, "response without code, treating as Unknown");
            ResponseCode::Unknown
        }
    };
    Ok(Response {
        kind: fields.remove("type").map(|k| RequestKind::from_wire(&k)),
        code,
        message: fields.remove("msg").unwrap_or_default(),
        created_at: parse_time(fields.remove("time"), &id),
        payload: fields
            .remove("data")
            .map(|d| decode_payload(&d))
            .unwrap_or_default(),
        request_id: RequestId::new(id),
    })
}

fn parse_time(raw: Option<String>, id: &str) -> u64 {
    match raw.as_deref().map(str::trim).map(str::parse::<u64>) {
        Some(Ok(ms)) => ms,
        Some(Err(_)) => {
            tracing::warn!(id, raw = ?raw, "malformed time field, using now");
            now_millis()
        }
        None => {
            tracing::warn!(id, "missing time field, using now");
            now_millis()
        }
    }
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

fn push_field(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push(':');
    out.push_str(&escape(value, FIELD_SEP));
    out.push(FIELD_SEP);
}

/// Splits a frame into its fields. Later duplicates win.
fn parse_fields(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for segment in split_escaped(text, FIELD_SEP) {
        if segment.is_empty() {
            continue;
        }
        match segment.split_once(':') {
            Some((key, value)) => {
                fields.insert(key.trim().to_string(), value.to_string());
            }
            None => tracing::warn!(%segment, "field without ':' ignored"),
        }
    }
    fields
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

pub fn encode_payload(payload: &Payload) -> String {
    let entries = payload
        .entries()
        .iter()
        .map(|e| join_escaped([&e.key, &e.value, &e.type_name], PART_SEP));
    join_escaped(entries, ENTRY_SEP)
}

/// Decodes a payload, skipping malformed entries.
pub fn decode_payload(text: &str) -> Payload {
    let mut payload = Payload::new();
    if text.is_empty() {
        return payload;
    }
    for entry in split_escaped(text, ENTRY_SEP) {
        if entry.is_empty() {
            continue;
        }
        let parts = split_escaped(&entry, PART_SEP);
        match <[String; 3]>::try_from(parts) {
            Ok([key, value, type_name]) => payload.insert_raw(key, value, type_name),
            Err(parts) => tracing::warn!(
                %entry,
                parts = parts.len(),
                "payload entry without key|value|type, skipped"
            ),
        }
    }
    payload
}
