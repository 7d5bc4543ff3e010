//! Wire protocol for the wisp hub.
//!
//! ## Protocol summary
//! - Every WebSocket frame, in both directions, is a single JSON object
//!   tagged with a snake_case `"type"` field: [`ClientCommand`] for
//!   client → hub invocations, [`ServerEvent`] for hub → client pushes and
//!   snapshot replies.
//! - Conversation identity is content-derived: the SHA-256 digest of the
//!   normalized, sorted participant list, encoded as URL-safe base64 without
//!   padding.  Two clients creating "the same" conversation therefore always
//!   agree on its id without a round trip.
//! - Connection ids are server-assigned and opaque to clients; they appear
//!   on the wire as decimal strings.
//!
//! These types are deliberately free of transport and state concerns so the
//! hub logic and the tests can share them unchanged.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Canonical form of a username used for claims and membership checks.
///
/// Display forms keep the spelling the user typed; claims compare on the
/// trimmed, lowercased form so `Alice` and `alice` are one identity.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// A deterministic, order-independent conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Derive the id for a participant set.  Participants are normalized and
    /// sorted first, so any ordering and any casing of the same set yields
    /// the same id.
    pub fn from_participants<I, S>(participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = participants
            .into_iter()
            .map(|p| normalize_username(p.as_ref()))
            .collect();
        normalized.sort();
        normalized.dedup();

        let mut hasher = Sha256::new();
        for name in &normalized {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        ConversationId(URL_SAFE_NO_PAD.encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used when composing per-conversation message ids.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user currently online, with every device connection they hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub username: String,
    pub connection_ids: Vec<String>,
}

/// One committed chat message.
///
/// `read_by` lists readers other than the sender; a sender's own messages
/// never enter anyone's unread set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: ConversationId,
    pub sender_username: String,
    pub content: String,
    /// Unix milliseconds, non-decreasing within a conversation.
    pub timestamp: u64,
    pub read_by: Vec<String>,
}

/// A live conversation between a fixed participant set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    /// Display forms, in the sorted order of their normalized names.
    pub participants: Vec<String>,
    /// Unix seconds.
    pub created_at: u64,
}

/// Read-only snapshot of a conversation taken when a participant's last
/// device disconnected.  History is trimmed to the most recent messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedConversation {
    pub conversation_id: ConversationId,
    pub participants: Vec<String>,
    pub created_at: u64,
    pub last_messages: Vec<Message>,
}

/// Client → hub invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Claim a username for this connection.  Must precede any data
    /// operation; re-issuing the same name is a no-op.
    ///
    /// `session_token` proves continuity with an existing claim: a second
    /// device presenting the token returned by the first device's
    /// [`ServerEvent::UsernameAccepted`] joins the same identity; claiming a
    /// live name without it gets [`ServerEvent::TriedToUse`].
    SetUsername {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    /// Snapshot of online users; answered with [`ServerEvent::ActiveUsers`].
    GetActiveUsers,
    /// Snapshot of the caller's live conversations; answered with
    /// [`ServerEvent::Conversations`].
    GetConversations,
    /// Get or create the conversation for a participant set.  Idempotent per
    /// set; answered with [`ServerEvent::ConversationCreated`].
    CreateConversation { participants: Vec<String> },
    /// Append a message and fan it out to every participant device.
    SendMessage {
        conversation_id: ConversationId,
        content: String,
    },
    /// Full history snapshot (live or archived); answered with
    /// [`ServerEvent::ConversationMessages`].
    GetConversationMessages { conversation_id: ConversationId },
    /// Fire-and-forget typing signal relayed to the recipient's devices.
    Typing { recipient: String },
    /// Fire-and-forget stopped-typing signal.
    StoppedTyping { recipient: String },
    /// Mark messages as read.  Idempotent; already-read and self-authored
    /// ids are ignored.
    MarkMessagesAsRead {
        conversation_id: ConversationId,
        message_ids: Vec<String>,
    },
}

/// Hub → client pushes and snapshot replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Reply to a successful `set_username` on this connection.  Clients
    /// keep `session_token` to join further devices to the same identity.
    UsernameAccepted {
        username: String,
        connection_id: String,
        session_token: String,
    },
    /// The requested username is claimed by a different identity; the
    /// connection stays usable and may retry with another name.
    TriedToUse { username: String },
    ActiveUsers { users: Vec<ActiveUser> },
    Conversations { conversations: Vec<Conversation> },
    ConversationMessages {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    /// Pushed to every participant device when a conversation comes into
    /// existence; also the reply to `create_conversation`.
    ConversationCreated { conversation: Conversation },
    ReceiveMessage { message: Message },
    /// A user's first device came online.
    UserConnected {
        username: String,
        connection_id: String,
    },
    /// A user's last device went away.
    UserDisconnected { username: String },
    /// One of several devices went away; the user is still online.
    UserDeviceDisconnected {
        username: String,
        connection_id: String,
    },
    UserTyping { username: String },
    UserStoppedTyping { username: String },
    MessageRead {
        conversation_id: ConversationId,
        message_id: String,
        reader_username: String,
    },
    /// A participant's last device disconnected: the conversation is now
    /// read-only and trimmed to `archived.last_messages`.
    UserLeftConversation {
        conversation_id: ConversationId,
        username: String,
        archived: ArchivedConversation,
    },
    /// Recoverable, connection-local error notification.
    ErrorMessage { message: String },
}

impl ClientCommand {
    /// Decode a text frame.  Unknown `type` tags and shape mismatches come
    /// back as the underlying serde error.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
