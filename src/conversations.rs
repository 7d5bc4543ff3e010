//! In-memory conversation store: live histories, read-state, and archival.
//!
//! Conversations are identified by the deterministic hash of their
//! participant set, so "get or create" collapses concurrent creation
//! requests for the same pair to a single conversation.  Histories live
//! only in process memory; when a participant's last device disconnects the
//! conversation is frozen into an [`ArchivedConversation`] snapshot trimmed
//! to the most recent messages, and every further write against it is
//! rejected.
//!
//! Timestamps are wall-clock milliseconds clamped to be non-decreasing
//! within each conversation; insertion order breaks ties.  Callers supply
//! `now` so the logic stays deterministic under test.

use std::collections::{BTreeSet, HashMap};

use crate::protocol::{
    normalize_username, ArchivedConversation, Conversation, ConversationId, Message,
};

/// Errors surfaced to the offending connection as `error_message` pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    UnknownConversation(ConversationId),
    NotAParticipant { username: String },
    ConversationArchived(ConversationId),
    TooFewParticipants,
}

impl std::fmt::Display for ConversationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationError::UnknownConversation(id) => {
                write!(f, "unknown conversation: {id}")
            }
            ConversationError::NotAParticipant { username } => {
                write!(f, "{username} is not a participant")
            }
            ConversationError::ConversationArchived(id) => {
                write!(f, "conversation is archived and read-only: {id}")
            }
            ConversationError::TooFewParticipants => {
                write!(f, "a conversation needs at least two distinct participants")
            }
        }
    }
}

impl std::error::Error for ConversationError {}

struct LiveConversation {
    conversation: Conversation,
    /// Normalized participant names, for membership checks.
    participant_keys: BTreeSet<String>,
    messages: Vec<Message>,
    next_seq: u64,
    /// High-water mark enforcing per-conversation timestamp monotonicity.
    last_timestamp_ms: u64,
}

/// Owner of all conversation state, live and archived.
pub struct ConversationStore {
    /// How many trailing messages an archived snapshot keeps.
    archive_tail: usize,
    live: HashMap<ConversationId, LiveConversation>,
    archived: HashMap<ConversationId, ArchivedConversation>,
    total_messages: u64,
}

impl ConversationStore {
    pub fn new(archive_tail: usize) -> Self {
        Self {
            archive_tail,
            live: HashMap::new(),
            archived: HashMap::new(),
            total_messages: 0,
        }
    }

    /// Get or create the conversation for `participants` (display forms).
    ///
    /// Returns the conversation and whether this call created it.  Repeated
    /// or concurrent calls for the same set, in any order or casing, return
    /// the one existing conversation.  Re-creating over an archived id
    /// supersedes the archive with a fresh history.
    pub fn get_or_create(
        &mut self,
        participants: &[String],
        now_secs: u64,
    ) -> Result<(Conversation, bool), ConversationError> {
        let mut by_key: Vec<(String, String)> = participants
            .iter()
            .map(|p| (normalize_username(p), p.trim().to_string()))
            .collect();
        by_key.sort();
        by_key.dedup_by(|a, b| a.0 == b.0);
        if by_key.len() < 2 {
            return Err(ConversationError::TooFewParticipants);
        }

        let id = ConversationId::from_participants(by_key.iter().map(|(k, _)| k.as_str()));
        if let Some(existing) = self.live.get(&id) {
            return Ok((existing.conversation.clone(), false));
        }

        // A returning participant set may rebuild over its own archive.
        self.archived.remove(&id);

        let participant_keys: BTreeSet<String> = by_key.iter().map(|(k, _)| k.clone()).collect();
        let conversation = Conversation {
            conversation_id: id.clone(),
            participants: by_key.into_iter().map(|(_, display)| display).collect(),
            created_at: now_secs,
        };
        self.live.insert(
            id,
            LiveConversation {
                conversation: conversation.clone(),
                participant_keys,
                messages: Vec::new(),
                next_seq: 1,
                last_timestamp_ms: 0,
            },
        );
        Ok((conversation, true))
    }

    /// All live conversations `username` participates in, oldest first.
    pub fn list_for_user(&self, username: &str) -> Vec<Conversation> {
        let key = normalize_username(username);
        let mut conversations: Vec<Conversation> = self
            .live
            .values()
            .filter(|c| c.participant_keys.contains(&key))
            .map(|c| c.conversation.clone())
            .collect();
        conversations.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.conversation_id.0.cmp(&b.conversation_id.0))
        });
        conversations
    }

    /// Participant display forms of a live conversation.
    pub fn participants_of(&self, id: &ConversationId) -> Option<Vec<String>> {
        self.live
            .get(id)
            .map(|c| c.conversation.participants.clone())
    }

    /// History snapshot for `requester`, from the live map or the archive.
    pub fn messages_of(
        &self,
        id: &ConversationId,
        requester: &str,
    ) -> Result<Vec<Message>, ConversationError> {
        let key = normalize_username(requester);
        if let Some(live) = self.live.get(id) {
            if !live.participant_keys.contains(&key) {
                return Err(ConversationError::NotAParticipant {
                    username: requester.to_string(),
                });
            }
            return Ok(live.messages.clone());
        }
        if let Some(archived) = self.archived.get(id) {
            let member = archived
                .participants
                .iter()
                .any(|p| normalize_username(p) == key);
            if !member {
                return Err(ConversationError::NotAParticipant {
                    username: requester.to_string(),
                });
            }
            return Ok(archived.last_messages.clone());
        }
        Err(ConversationError::UnknownConversation(id.clone()))
    }

    /// Append a message from `sender` (display form) and return the
    /// committed fact.  The timestamp is clamped so appends within one
    /// conversation never go backwards.
    pub fn append_message(
        &mut self,
        id: &ConversationId,
        sender: &str,
        content: String,
        now_ms: u64,
    ) -> Result<Message, ConversationError> {
        if self.archived.contains_key(id) {
            return Err(ConversationError::ConversationArchived(id.clone()));
        }
        let live = self
            .live
            .get_mut(id)
            .ok_or_else(|| ConversationError::UnknownConversation(id.clone()))?;
        let key = normalize_username(sender);
        if !live.participant_keys.contains(&key) {
            return Err(ConversationError::NotAParticipant {
                username: sender.to_string(),
            });
        }

        let timestamp = now_ms.max(live.last_timestamp_ms);
        live.last_timestamp_ms = timestamp;
        let seq = live.next_seq;
        live.next_seq += 1;

        let message = Message {
            message_id: format!("{}-{}", id.short(), seq),
            conversation_id: id.clone(),
            sender_username: sender.to_string(),
            content,
            timestamp,
            read_by: Vec::new(),
        };
        live.messages.push(message.clone());
        self.total_messages += 1;
        Ok(message)
    }

    /// Record that `reader` has seen `message_ids`.  Idempotent: returns
    /// only the ids newly marked, skipping already-read ids, the reader's
    /// own messages, and ids that don't exist.
    pub fn mark_read(
        &mut self,
        id: &ConversationId,
        message_ids: &[String],
        reader: &str,
    ) -> Result<Vec<String>, ConversationError> {
        if self.archived.contains_key(id) {
            return Err(ConversationError::ConversationArchived(id.clone()));
        }
        let live = self
            .live
            .get_mut(id)
            .ok_or_else(|| ConversationError::UnknownConversation(id.clone()))?;
        let key = normalize_username(reader);
        if !live.participant_keys.contains(&key) {
            return Err(ConversationError::NotAParticipant {
                username: reader.to_string(),
            });
        }

        let wanted: BTreeSet<&str> = message_ids.iter().map(String::as_str).collect();
        let mut newly_marked = Vec::new();
        for message in &mut live.messages {
            if !wanted.contains(message.message_id.as_str()) {
                continue;
            }
            if normalize_username(&message.sender_username) == key {
                continue; // own messages are implicitly read
            }
            if message.read_by.iter().any(|r| normalize_username(r) == key) {
                continue;
            }
            message.read_by.push(reader.to_string());
            newly_marked.push(message.message_id.clone());
        }
        Ok(newly_marked)
    }

    /// Freeze every live conversation `leaving` participates in.
    ///
    /// Each affected conversation moves to the archived map with its history
    /// trimmed to the last `archive_tail` messages; the snapshots are
    /// returned so the caller can notify remaining participants.  Called
    /// only when the user's final device is gone; a partial device
    /// disconnect never reaches here.
    pub fn archive_for_user(&mut self, leaving: &str) -> Vec<ArchivedConversation> {
        let key = normalize_username(leaving);
        let affected: Vec<ConversationId> = self
            .live
            .iter()
            .filter(|(_, c)| c.participant_keys.contains(&key))
            .map(|(id, _)| id.clone())
            .collect();

        let mut snapshots = Vec::new();
        for id in affected {
            let Some(live) = self.live.remove(&id) else {
                continue;
            };
            let tail_start = live.messages.len().saturating_sub(self.archive_tail);
            let snapshot = ArchivedConversation {
                conversation_id: id.clone(),
                participants: live.conversation.participants.clone(),
                created_at: live.conversation.created_at,
                last_messages: live.messages[tail_start..].to_vec(),
            };
            self.archived.insert(id, snapshot.clone());
            snapshots.push(snapshot);
        }
        snapshots.sort_by(|a, b| a.conversation_id.0.cmp(&b.conversation_id.0));
        snapshots
    }

    /// Drop archived snapshots no participant can see anymore.
    ///
    /// `online` answers whether a display-form username still has a live
    /// device; an archive with zero online participants has no remaining
    /// audience and is burned.
    pub fn prune_archived(&mut self, online: impl Fn(&str) -> bool) {
        self.archived
            .retain(|_, snapshot| snapshot.participants.iter().any(|p| online(p)));
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn archived_count(&self) -> usize {
        self.archived.len()
    }

    /// Lifetime count of committed messages.
    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> Vec<String> {
        vec!["alice".to_string(), "bob".to_string()]
    }

    #[test]
    fn test_get_or_create_is_order_and_case_independent() {
        let mut store = ConversationStore::new(10);
        let (first, created) = store.get_or_create(&pair(), 100).unwrap();
        assert!(created);

        let reversed = vec!["Bob".to_string(), "ALICE".to_string()];
        let (second, created_again) = store.get_or_create(&reversed, 200).unwrap();
        assert!(!created_again);
        assert_eq!(first.conversation_id, second.conversation_id);
        assert_eq!(first.created_at, 100);
    }

    #[test]
    fn test_get_or_create_rejects_degenerate_sets() {
        let mut store = ConversationStore::new(10);
        let solo = vec!["alice".to_string()];
        assert_eq!(
            store.get_or_create(&solo, 0).unwrap_err(),
            ConversationError::TooFewParticipants
        );
        // Same name twice collapses to one participant.
        let dup = vec!["alice".to_string(), "Alice".to_string()];
        assert_eq!(
            store.get_or_create(&dup, 0).unwrap_err(),
            ConversationError::TooFewParticipants
        );
    }

    #[test]
    fn test_append_assigns_monotonic_timestamps() {
        let mut store = ConversationStore::new(10);
        let (conv, _) = store.get_or_create(&pair(), 0).unwrap();
        let id = conv.conversation_id;

        let m1 = store.append_message(&id, "alice", "one".into(), 500).unwrap();
        // Wall clock stepping backwards must not reorder the history.
        let m2 = store.append_message(&id, "bob", "two".into(), 400).unwrap();
        let m3 = store.append_message(&id, "alice", "three".into(), 600).unwrap();

        assert_eq!(m1.timestamp, 500);
        assert_eq!(m2.timestamp, 500);
        assert_eq!(m3.timestamp, 600);
        assert_ne!(m1.message_id, m2.message_id);

        let history = store.messages_of(&id, "alice").unwrap();
        assert_eq!(
            history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["one", "two", "three"]
        );
    }

    #[test]
    fn test_append_rejects_outsiders_and_unknown_ids() {
        let mut store = ConversationStore::new(10);
        let (conv, _) = store.get_or_create(&pair(), 0).unwrap();

        let err = store
            .append_message(&conv.conversation_id, "mallory", "hi".into(), 0)
            .unwrap_err();
        assert!(matches!(err, ConversationError::NotAParticipant { .. }));

        let bogus = ConversationId("nope".to_string());
        let err = store
            .append_message(&bogus, "alice", "hi".into(), 0)
            .unwrap_err();
        assert!(matches!(err, ConversationError::UnknownConversation(_)));
    }

    #[test]
    fn test_mark_read_is_idempotent_and_skips_own_messages() {
        let mut store = ConversationStore::new(10);
        let (conv, _) = store.get_or_create(&pair(), 0).unwrap();
        let id = conv.conversation_id;
        let from_alice = store.append_message(&id, "alice", "hi".into(), 1).unwrap();
        let from_bob = store.append_message(&id, "bob", "yo".into(), 2).unwrap();

        let ids = vec![from_alice.message_id.clone(), from_bob.message_id.clone()];
        let newly = store.mark_read(&id, &ids, "bob").unwrap();
        // Bob's own message never enters his unread set.
        assert_eq!(newly, vec![from_alice.message_id.clone()]);

        let again = store.mark_read(&id, &ids, "bob").unwrap();
        assert!(again.is_empty());

        let history = store.messages_of(&id, "alice").unwrap();
        assert_eq!(history[0].read_by, vec!["bob".to_string()]);
        assert_eq!(history[0].read_by.len(), 1);
        assert!(history[1].read_by.is_empty());
    }

    #[test]
    fn test_archive_trims_history_and_freezes_writes() {
        let mut store = ConversationStore::new(3);
        let (conv, _) = store.get_or_create(&pair(), 0).unwrap();
        let id = conv.conversation_id;
        for i in 0..5 {
            store
                .append_message(&id, "alice", format!("msg {i}"), i)
                .unwrap();
        }

        let snapshots = store.archive_for_user("alice");
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].last_messages.len(), 3);
        assert_eq!(snapshots[0].last_messages[0].content, "msg 2");
        assert_eq!(store.live_count(), 0);
        assert_eq!(store.archived_count(), 1);

        let err = store
            .append_message(&id, "bob", "too late".into(), 9)
            .unwrap_err();
        assert!(matches!(err, ConversationError::ConversationArchived(_)));
        let err = store.mark_read(&id, &[], "bob").unwrap_err();
        assert!(matches!(err, ConversationError::ConversationArchived(_)));

        // The remaining participant can still read the frozen tail.
        let tail = store.messages_of(&id, "bob").unwrap();
        assert_eq!(tail.len(), 3);
    }

    #[test]
    fn test_recreate_supersedes_archive() {
        let mut store = ConversationStore::new(10);
        let (conv, _) = store.get_or_create(&pair(), 0).unwrap();
        let id = conv.conversation_id.clone();
        store.append_message(&id, "alice", "old".into(), 1).unwrap();
        store.archive_for_user("bob");

        let (revived, created) = store.get_or_create(&pair(), 50).unwrap();
        assert!(created);
        assert_eq!(revived.conversation_id, id);
        assert_eq!(store.archived_count(), 0);
        assert!(store.messages_of(&id, "alice").unwrap().is_empty());
    }

    #[test]
    fn test_prune_archived_burns_unwatched_snapshots() {
        let mut store = ConversationStore::new(10);
        let (conv, _) = store.get_or_create(&pair(), 0).unwrap();
        store.archive_for_user("alice");
        assert_eq!(store.archived_count(), 1);

        // Bob still online: snapshot stays.
        store.prune_archived(|name| name == "bob");
        assert_eq!(store.archived_count(), 1);

        // Nobody left: snapshot is burned.
        store.prune_archived(|_| false);
        assert_eq!(store.archived_count(), 0);
        let err = store
            .messages_of(&conv.conversation_id, "bob")
            .unwrap_err();
        assert!(matches!(err, ConversationError::UnknownConversation(_)));
    }

    #[test]
    fn test_list_for_user_excludes_archived_and_foreign() {
        let mut store = ConversationStore::new(10);
        store.get_or_create(&pair(), 10).unwrap();
        let trio = vec!["alice".into(), "carol".into()];
        store.get_or_create(&trio, 20).unwrap();

        assert_eq!(store.list_for_user("alice").len(), 2);
        assert_eq!(store.list_for_user("bob").len(), 1);
        assert_eq!(store.list_for_user("dave").len(), 0);

        store.archive_for_user("carol");
        assert_eq!(store.list_for_user("alice").len(), 1);
    }
}
