//! Error types for the protocol layer.
//!
//! Only structurally fatal problems surface as a [`ProtocolError`]. A
//! malformed individual field is logged and replaced by its default
//! instead, so one bad value never costs the whole message.

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A field the frame cannot exist without is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// The frame is neither a request nor a response.
    #[error("frame is neither a request nor a response")]
    UnknownFrame,

    /// The bytes are not valid UTF-8 text.
    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The message is invalid at the protocol level.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Structural (serde) encoding or decoding failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
