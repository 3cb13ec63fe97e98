//! Wire protocol for Tether.
//!
//! This crate defines what peers say to each other:
//!
//! - **Types** ([`Request`], [`Response`], [`Payload`], [`RequestKind`],
//!   [`ResponseCode`]) are the structures that travel on the wire.
//! - **Values** ([`Codec`], [`Vector3`], [`Quaternion`]) convert typed
//!   payload values to and from strings.
//! - **Wire** ([`Frame`], [`wire`]) is the flat `key:value;` text format.
//!
//! # Architecture
//!
//! The protocol layer sits between transport (raw bytes) and the RPC
//! layer (correlation and routing). It has no notion of connections or
//! timing.
//!
//! ```text
//! Transport (bytes) → Protocol (Frame) → RPC (pending requests, handlers)
//! ```

mod codec;
mod error;
pub mod escape;
mod types;
mod value;
pub mod wire;

pub use codec::Codec;
pub use error::ProtocolError;
pub use types::{
    Payload, PayloadEntry, Request, RequestId, RequestKind, Response, ResponseCode,
    now_millis,
};
pub use value::{Quaternion, Vector3};
pub use wire::Frame;
