//! Wire-format and identity-derivation tests.

use wisp::protocol::{
    normalize_username, ClientCommand, ConversationId, Message, ServerEvent,
};

#[test]
fn conversation_id_is_order_independent() {
    let forward = ConversationId::from_participants(["alice", "bob"]);
    let reversed = ConversationId::from_participants(["bob", "alice"]);
    assert_eq!(forward, reversed);
}

#[test]
fn conversation_id_normalizes_case_and_whitespace() {
    let plain = ConversationId::from_participants(["alice", "bob"]);
    let noisy = ConversationId::from_participants([" Alice ", "BOB"]);
    assert_eq!(plain, noisy);
}

#[test]
fn conversation_id_distinguishes_different_sets() {
    let ab = ConversationId::from_participants(["alice", "bob"]);
    let ac = ConversationId::from_participants(["alice", "carol"]);
    assert_ne!(ab, ac);
}

#[test]
fn conversation_id_is_unambiguous_at_name_boundaries() {
    // Joining with a separator must not let ("ab", "c") collide with ("a", "bc").
    let first = ConversationId::from_participants(["ab", "c"]);
    let second = ConversationId::from_participants(["a", "bc"]);
    assert_ne!(first, second);
}

#[test]
fn normalize_trims_and_lowercases() {
    assert_eq!(normalize_username("  Alice "), "alice");
    assert_eq!(normalize_username("BOB"), "bob");
    assert_eq!(normalize_username("carol"), "carol");
}

#[test]
fn commands_decode_from_tagged_json() {
    let command = ClientCommand::decode(r#"{"type":"set_username","username":"alice"}"#)
        .expect("decode set_username");
    assert_eq!(
        command,
        ClientCommand::SetUsername {
            username: "alice".to_string(),
            session_token: None,
        }
    );

    let command = ClientCommand::decode(
        r#"{"type":"send_message","conversation_id":"abc","content":"hi"}"#,
    )
    .expect("decode send_message");
    assert_eq!(
        command,
        ClientCommand::SendMessage {
            conversation_id: ConversationId("abc".to_string()),
            content: "hi".to_string(),
        }
    );

    let command =
        ClientCommand::decode(r#"{"type":"mark_messages_as_read","conversation_id":"abc","message_ids":["abc-1","abc-2"]}"#)
            .expect("decode mark_messages_as_read");
    assert!(matches!(
        command,
        ClientCommand::MarkMessagesAsRead { message_ids, .. } if message_ids.len() == 2
    ));
}

#[test]
fn unknown_command_types_fail_to_decode() {
    assert!(ClientCommand::decode(r#"{"type":"drop_tables"}"#).is_err());
    assert!(ClientCommand::decode("not json at all").is_err());
    // Missing required field.
    assert!(ClientCommand::decode(r#"{"type":"set_username"}"#).is_err());
}

#[test]
fn events_encode_with_snake_case_tags() {
    let event = ServerEvent::ReceiveMessage {
        message: Message {
            message_id: "abc-1".to_string(),
            conversation_id: ConversationId("abc".to_string()),
            sender_username: "alice".to_string(),
            content: "hi".to_string(),
            timestamp: 1_700_000_000_000,
            read_by: vec![],
        },
    };
    let json: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
    assert_eq!(json["type"], "receive_message");
    assert_eq!(json["message"]["sender_username"], "alice");
    assert_eq!(json["message"]["read_by"], serde_json::json!([]));

    let event = ServerEvent::TriedToUse {
        username: "bob".to_string(),
    };
    let json: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
    assert_eq!(json["type"], "tried_to_use");
}

#[test]
fn events_round_trip_through_the_wire_shape() {
    let event = ServerEvent::MessageRead {
        conversation_id: ConversationId("abc".to_string()),
        message_id: "abc-7".to_string(),
        reader_username: "bob".to_string(),
    };
    let text = serde_json::to_string(&event).unwrap();
    let back: ServerEvent = serde_json::from_str(&text).unwrap();
    assert_eq!(back, event);
}
