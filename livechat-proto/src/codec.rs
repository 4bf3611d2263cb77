//! Text-frame encoding for channel events.
//!
//! Frames are UTF-8 JSON objects of the form `{"event": ..., "data": ...}`.
//! Both directions share the same framing, so the helpers are generic over
//! [`ServerEvent`](crate::events::ServerEvent) and
//! [`ClientEvent`](crate::events::ClientEvent).

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::message::MAX_MESSAGE_SIZE;

/// Largest frame accepted from the wire (message plus envelope overhead).
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE * 2;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large ({size} bytes, max {max} bytes)")]
    FrameTooLarge {
        /// Actual frame size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Encodes an event into a text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode<E: Serialize>(event: &E) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

/// Decodes an event from a text frame.
///
/// # Errors
///
/// Returns `CodecError::FrameTooLarge` for oversized input, or
/// `CodecError::Serialization` for malformed JSON or an unknown event name.
pub fn decode<E: DeserializeOwned>(frame: &str) -> Result<E, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_str(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClientEvent, Probe, ServerEvent};
    use crate::message::UserId;
    use crate::typing::TypingUser;

    #[test]
    fn client_frame_shape() {
        let frame = encode(&ClientEvent::Typing(TypingUser::new("u1", "c1"))).unwrap();
        assert_eq!(
            frame,
            r#"{"event":"typing","data":{"userId":"u1","chatId":"c1"}}"#
        );
    }

    #[test]
    fn decodes_presence_snapshot() {
        let ev: ServerEvent =
            decode(r#"{"event":"onlineUserIdsList","data":["u1","u2"]}"#).unwrap();
        assert_eq!(
            ev,
            ServerEvent::OnlineUserIdsList(vec![UserId::new("u1"), UserId::new("u2")])
        );
    }

    #[test]
    fn decodes_pong() {
        let ev: ServerEvent = decode(r#"{"event":"pong","data":{"nonce":7}}"#).unwrap();
        assert_eq!(ev, ServerEvent::Pong(Probe { nonce: 7 }));
    }

    #[test]
    fn unknown_event_is_an_error() {
        let result = decode::<ServerEvent>(r#"{"event":"somethingElse","data":1}"#);
        assert!(matches!(result, Err(CodecError::Serialization(_))));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode::<ServerEvent>("not json").is_err());
        assert!(decode::<ServerEvent>("").is_err());
    }

    #[test]
    fn oversized_frame_is_rejected_before_parsing() {
        let frame = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            decode::<ServerEvent>(&frame),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }
}
