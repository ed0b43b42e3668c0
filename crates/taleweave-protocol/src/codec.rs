//! Codec trait and implementations for turning events into bytes.
//!
//! The engine never frames messages itself; transports do. A codec is the
//! strategy they plug in. [`JsonCodec`] is the only implementation shipped:
//! it is readable in logs and browser devtools, which matters more than size
//! for a story that produces one segment every few seconds.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to bytes and decodes them back.
///
/// `Send + Sync + 'static` because a codec is shared by every connection
/// task for the lifetime of the process.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] if the value cannot be represented in this
    /// format.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] if the bytes are empty, malformed, or do not
    /// match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] backed by `serde_json`.
///
/// ```rust
/// use taleweave_protocol::{Codec, JsonCodec, SessionId, StoryEvent};
///
/// let codec = JsonCodec;
/// let event = StoryEvent::StoryStarted { session_id: SessionId::from("amber-falcon-4821") };
///
/// let bytes = codec.encode(&event).unwrap();
/// let decoded: StoryEvent = codec.decode(&bytes).unwrap();
/// assert_eq!(event, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::InvalidFrame("empty frame".into()));
        }
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{ParticipantId, SessionId, StoryEvent};

    #[test]
    fn test_json_codec_encodes_tagged_event() {
        let event = StoryEvent::PlayerLeft {
            session_id: SessionId::from("s"),
            participant_id: ParticipantId::from("p"),
        };
        let bytes = JsonCodec.encode(&event).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"type\":\"player_left\""));
    }

    #[test]
    fn test_json_codec_rejects_empty_frame() {
        let result: Result<StoryEvent, _> = JsonCodec.decode(&[]);
        assert!(matches!(result, Err(ProtocolError::InvalidFrame(_))));
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        let result: Result<StoryEvent, _> = JsonCodec.decode(b"not json at all");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
