//! Error types for the protocol layer.
//!
//! Each crate in Taleweave defines its own error enum. A `ProtocolError`
//! always means an event could not be turned into bytes or back, never that
//! a session or the generation backend misbehaved.

/// Errors that can occur while encoding or decoding events.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning an event into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into an event).
    ///
    /// Common causes: malformed JSON, an unknown `type` tag, or a missing
    /// field.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame is unusable before any format-specific parsing happens,
    /// e.g. it is empty.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}
