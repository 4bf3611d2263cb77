//! Property tests for the wire vocabulary.
//!
//! 1. Arbitrary text never panics the frame decoder.
//! 2. Presence and typing frames survive encode → decode.
//! 3. Merging a server status into a local one never regresses along the
//!    success path.
//! 4. Content validation accepts exactly the non-blank, in-bounds strings.

use livechat_proto::codec;
use livechat_proto::events::{ClientEvent, ServerEvent};
use livechat_proto::message::{
    MAX_MESSAGE_SIZE, MessageStatus, UserId, ValidationError, validate_content,
};
use livechat_proto::typing::TypingUser;
use proptest::prelude::*;

fn arb_status() -> impl Strategy<Value = MessageStatus> {
    prop_oneof![
        Just(MessageStatus::Sending),
        Just(MessageStatus::Sent),
        Just(MessageStatus::Delivered),
        Just(MessageStatus::Read),
        Just(MessageStatus::Failed),
        Just(MessageStatus::Deleting),
    ]
}

fn arb_id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,24}"
}

fn arb_presence_or_typing() -> impl Strategy<Value = ServerEvent> {
    prop_oneof![
        (arb_id(), arb_id()).prop_map(|(u, c)| ServerEvent::Typing(TypingUser::new(u.as_str(), c.as_str()))),
        (arb_id(), arb_id()).prop_map(|(u, c)| ServerEvent::StopTyping(TypingUser::new(u.as_str(), c.as_str()))),
        arb_id().prop_map(|u| ServerEvent::UserIsOnline(UserId::new(u))),
        arb_id().prop_map(|u| ServerEvent::UserIsOffline(UserId::new(u))),
        prop::collection::vec(arb_id(), 0..16)
            .prop_map(|ids| ServerEvent::OnlineUserIdsList(ids.into_iter().map(UserId::new).collect())),
    ]
}

proptest! {
    #[test]
    fn decode_never_panics(frame in ".{0,512}") {
        let _ = codec::decode::<ServerEvent>(&frame);
        let _ = codec::decode::<ClientEvent>(&frame);
    }

    #[test]
    fn decode_never_panics_on_json_shaped_input(
        name in "[a-zA-Z]{0,20}",
        data in ".{0,64}",
    ) {
        let frame = format!(r#"{{"event":"{name}","data":{data}}}"#);
        let _ = codec::decode::<ServerEvent>(&frame);
    }

    #[test]
    fn presence_and_typing_frames_roundtrip(event in arb_presence_or_typing()) {
        let frame = codec::encode(&event).unwrap();
        let back: ServerEvent = codec::decode(&frame).unwrap();
        prop_assert_eq!(back, event);
    }

    #[test]
    fn merged_status_never_regresses(
        local in arb_status(),
        updates in prop::collection::vec(arb_status(), 0..12),
    ) {
        let mut current = local;
        for incoming in updates {
            let next = current.merged_with(incoming);
            if let (Some(before), Some(after)) = (current.rank(), next.rank()) {
                prop_assert!(after >= before, "{current} -> {next}");
            }
            if current == MessageStatus::Deleting {
                prop_assert_eq!(next, MessageStatus::Deleting);
            }
            current = next;
        }
    }

    #[test]
    fn validation_matches_definition(content in ".{0,64}") {
        let result = validate_content(&content);
        if content.trim().is_empty() {
            prop_assert_eq!(result, Err(ValidationError::Empty));
        } else {
            prop_assert!(result.is_ok());
        }
    }
}

#[test]
fn oversized_content_is_rejected() {
    let content = "x".repeat(MAX_MESSAGE_SIZE + 1);
    assert_eq!(
        validate_content(&content),
        Err(ValidationError::TooLarge {
            size: MAX_MESSAGE_SIZE + 1,
            max: MAX_MESSAGE_SIZE,
        })
    );
}
