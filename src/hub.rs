//! The hub: per-connection session handling, message routing, and fan-out.
//!
//! [`HubState`] is the cheaply clonable handle the transport layer holds.
//! All shared state lives behind one `tokio::sync::Mutex`; a single
//! serialization point makes check-then-set operations (username claims,
//! conversation creation) atomic by construction.
//!
//! Command handling is split into pure functions over `&mut HubInner` that
//! return the committed fact as a list of `(connection_id, event)`
//! deliveries.  Events are enqueued onto per-connection unbounded channels
//! while the lock is still held, which pins fan-out order to commit order
//! within a conversation; each connection's writer task drains its own
//! queue, so one slow socket never stalls the rest.  Enqueueing to a
//! connection that is already gone is a silent no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};

use crate::conversations::{ConversationError, ConversationStore};
use crate::logging;
use crate::protocol::{normalize_username, ClientCommand, ConversationId, ServerEvent};
use crate::registry::{BindOutcome, ConnectionId, ConnectionRegistry};
use crate::tlog;

/// Tunables for the hub, assembled from CLI/env by the binary.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages an archived conversation snapshot retains.
    pub archive_tail: usize,
    /// Upper bound on message content, in bytes.
    pub max_content_bytes: usize,
    /// Upper bound on username length, in characters.
    pub max_username_chars: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            archive_tail: 10,
            max_content_bytes: 4096,
            max_username_chars: 32,
        }
    }
}

/// One event addressed to one connection.
pub type Delivery = (ConnectionId, ServerEvent);

struct HubInner {
    registry: ConnectionRegistry,
    store: ConversationStore,
    /// Outbound queue per live connection; removed on disconnect.
    senders: HashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>,
    total_deliveries: u64,
}

/// Shared hub handle.
#[derive(Clone)]
pub struct HubState {
    config: HubConfig,
    inner: Arc<Mutex<HubInner>>,
    start_time: Instant,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        let store = ConversationStore::new(config.archive_tail);
        Self {
            config,
            inner: Arc::new(Mutex::new(HubInner {
                registry: ConnectionRegistry::new(),
                store,
                senders: HashMap::new(),
                total_deliveries: 0,
            })),
            start_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Admit a new transport connection.  `sender` is the connection's
    /// outbound queue; the returned id must be passed back on every
    /// subsequent call for this connection.
    pub async fn connect(&self, sender: mpsc::UnboundedSender<ServerEvent>) -> ConnectionId {
        let mut inner = self.inner.lock().await;
        let connection_id = inner.registry.register(Instant::now());
        inner.senders.insert(connection_id, sender);
        tlog!("hub: connection {connection_id} opened");
        connection_id
    }

    /// Handle a decoded command from `connection_id`, committing any state
    /// change and fanning out the resulting events.
    pub async fn handle_command(&self, connection_id: ConnectionId, command: ClientCommand) {
        let mut inner = self.inner.lock().await;
        let deliveries = apply_command(&self.config, &mut inner, connection_id, command);
        enqueue(&mut inner, deliveries);
    }

    /// Tear down a connection: transport closed, abruptly or gracefully.
    ///
    /// Runs the full cascade: device/user presence events, conversation
    /// archival when this was the user's last device, and burning archives
    /// nobody can see anymore.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let mut inner = self.inner.lock().await;
        inner.senders.remove(&connection_id);
        let deliveries = apply_disconnect(&mut inner, connection_id);
        enqueue(&mut inner, deliveries);
    }

    /// JSON snapshot for the `/debug/stats` endpoint.
    pub async fn stats_json(&self) -> serde_json::Value {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let connections: Vec<serde_json::Value> = inner
            .registry
            .list_connections(now)
            .into_iter()
            .map(|(id, username, connected_secs)| {
                serde_json::json!({
                    "connection_id": id.to_string(),
                    "username": username,
                    "connected_secs": connected_secs,
                })
            })
            .collect();
        serde_json::json!({
            "uptime_secs": self.start_time.elapsed().as_secs(),
            "connections": inner.registry.connection_count(),
            "connections_detail": connections,
            "active_users": inner.registry.user_count(),
            "live_conversations": inner.store.live_count(),
            "archived_conversations": inner.store.archived_count(),
            "total_messages": inner.store.total_messages(),
            "total_deliveries": inner.total_deliveries,
            "config": {
                "archive_tail": self.config.archive_tail,
                "max_content_bytes": self.config.max_content_bytes,
                "max_username_chars": self.config.max_username_chars,
            }
        })
    }
}

/// Push each event onto its target connection's queue, in order, while the
/// hub lock is held.  Closed or missing queues are skipped silently; a
/// connection that raced into `Closed` simply stops receiving.
fn enqueue(inner: &mut HubInner, deliveries: Vec<Delivery>) {
    for (connection_id, event) in deliveries {
        if let Some(sender) = inner.senders.get(&connection_id) {
            if sender.send(event).is_ok() {
                inner.total_deliveries += 1;
            }
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// All connection ids currently open, identified or not.
fn all_connections(inner: &HubInner) -> Vec<ConnectionId> {
    inner.senders.keys().copied().collect()
}

/// Every connection of every listed participant.
fn participant_connections(inner: &HubInner, participants: &[String]) -> Vec<ConnectionId> {
    let mut targets = Vec::new();
    for participant in participants {
        targets.extend(inner.registry.connections_of(participant));
    }
    targets
}

fn error_to(connection_id: ConnectionId, message: impl Into<String>) -> Vec<Delivery> {
    vec![(
        connection_id,
        ServerEvent::ErrorMessage {
            message: message.into(),
        },
    )]
}

fn conversation_error(connection_id: ConnectionId, error: ConversationError) -> Vec<Delivery> {
    error_to(connection_id, error.to_string())
}

/// The per-connection session state machine.  Anonymous connections may
/// only issue `set_username`; everything else requires an identity and is
/// otherwise rejected with a recoverable error on the caller only.
fn apply_command(
    config: &HubConfig,
    inner: &mut HubInner,
    connection_id: ConnectionId,
    command: ClientCommand,
) -> Vec<Delivery> {
    let command = match command {
        ClientCommand::SetUsername {
            username,
            session_token,
        } => {
            return apply_set_username(config, inner, connection_id, &username, session_token);
        }
        other => other,
    };

    // Data operations require an identified connection.
    let Some(me) = inner.registry.username_of(connection_id).map(str::to_string) else {
        return error_to(connection_id, "not authenticated: set a username first");
    };

    match command {
        ClientCommand::SetUsername { .. } => unreachable!("handled above"),
        ClientCommand::GetActiveUsers => vec![(
            connection_id,
            ServerEvent::ActiveUsers {
                users: inner.registry.list_active(),
            },
        )],
        ClientCommand::GetConversations => vec![(
            connection_id,
            ServerEvent::Conversations {
                conversations: inner.store.list_for_user(&me),
            },
        )],
        ClientCommand::CreateConversation { participants } => {
            apply_create_conversation(inner, connection_id, &me, participants)
        }
        ClientCommand::SendMessage {
            conversation_id,
            content,
        } => apply_send_message(config, inner, connection_id, &me, conversation_id, content),
        ClientCommand::GetConversationMessages { conversation_id } => {
            match inner.store.messages_of(&conversation_id, &me) {
                Ok(messages) => vec![(
                    connection_id,
                    ServerEvent::ConversationMessages {
                        conversation_id,
                        messages,
                    },
                )],
                Err(error) => conversation_error(connection_id, error),
            }
        }
        ClientCommand::Typing { recipient } => relay_typing(inner, &me, &recipient, true),
        ClientCommand::StoppedTyping { recipient } => relay_typing(inner, &me, &recipient, false),
        ClientCommand::MarkMessagesAsRead {
            conversation_id,
            message_ids,
        } => apply_mark_read(inner, connection_id, &me, conversation_id, message_ids),
    }
}

fn apply_set_username(
    config: &HubConfig,
    inner: &mut HubInner,
    connection_id: ConnectionId,
    raw: &str,
    session_token: Option<String>,
) -> Vec<Delivery> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return error_to(connection_id, "username cannot be empty");
    }
    if trimmed.chars().count() > config.max_username_chars {
        return error_to(
            connection_id,
            format!("username exceeds {} characters", config.max_username_chars),
        );
    }

    match inner
        .registry
        .bind_username(connection_id, raw, session_token.as_deref())
    {
        BindOutcome::Bound {
            username,
            first_device,
            session_token,
        } => {
            tlog!(
                "hub: connection {connection_id} identified as {} ({})",
                logging::user(&username),
                if first_device { "new user" } else { "device join" }
            );
            let mut deliveries = vec![(
                connection_id,
                ServerEvent::UsernameAccepted {
                    username: username.clone(),
                    connection_id: connection_id.to_string(),
                    session_token,
                },
            )];
            if first_device {
                // User-level banner goes to everyone; device joins stay quiet.
                for target in all_connections(inner) {
                    deliveries.push((
                        target,
                        ServerEvent::UserConnected {
                            username: username.clone(),
                            connection_id: connection_id.to_string(),
                        },
                    ));
                }
            }
            deliveries
        }
        BindOutcome::Unchanged {
            username,
            session_token,
        } => vec![(
            connection_id,
            ServerEvent::UsernameAccepted {
                username,
                connection_id: connection_id.to_string(),
                session_token,
            },
        )],
        BindOutcome::Taken { username } => {
            tlog!(
                "hub: connection {connection_id} tried to use {}",
                logging::user(&username)
            );
            vec![(connection_id, ServerEvent::TriedToUse { username })]
        }
        BindOutcome::AlreadyIdentified { current } => error_to(
            connection_id,
            format!("connection is already identified as {current}"),
        ),
    }
}

fn apply_create_conversation(
    inner: &mut HubInner,
    connection_id: ConnectionId,
    me: &str,
    participants: Vec<String>,
) -> Vec<Delivery> {
    let my_key = normalize_username(me);
    if !participants.iter().any(|p| normalize_username(p) == my_key) {
        return error_to(connection_id, "caller must be a conversation participant");
    }
    for participant in &participants {
        if !inner.registry.is_online(participant) {
            return error_to(
                connection_id,
                format!("{} is not online", participant.trim()),
            );
        }
    }

    // Canonicalize to the display forms under which the users are claimed.
    let canonical: Vec<String> = participants
        .iter()
        .map(|p| {
            inner
                .registry
                .display_of(p)
                .map(str::to_string)
                .unwrap_or_else(|| p.trim().to_string())
        })
        .collect();

    match inner.store.get_or_create(&canonical, now_secs()) {
        Ok((conversation, created)) => {
            if created {
                tlog!(
                    "hub: conversation {} created for {:?}",
                    logging::conv(conversation.conversation_id.as_str()),
                    conversation.participants
                );
                participant_connections(inner, &conversation.participants)
                    .into_iter()
                    .map(|target| {
                        (
                            target,
                            ServerEvent::ConversationCreated {
                                conversation: conversation.clone(),
                            },
                        )
                    })
                    .collect()
            } else {
                // Idempotent repeat: only the caller needs the reply.
                vec![(connection_id, ServerEvent::ConversationCreated { conversation })]
            }
        }
        Err(error) => conversation_error(connection_id, error),
    }
}

fn apply_send_message(
    config: &HubConfig,
    inner: &mut HubInner,
    connection_id: ConnectionId,
    me: &str,
    conversation_id: ConversationId,
    content: String,
) -> Vec<Delivery> {
    if content.trim().is_empty() {
        return error_to(connection_id, "message content cannot be empty");
    }
    if content.len() > config.max_content_bytes {
        return error_to(
            connection_id,
            format!("message exceeds {} bytes", config.max_content_bytes),
        );
    }

    match inner
        .store
        .append_message(&conversation_id, me, content, now_ms())
    {
        Ok(message) => {
            tlog!(
                "hub: {} {} -> {}",
                logging::msg(&message.message_id),
                logging::user(me),
                logging::conv(conversation_id.as_str())
            );
            // Deliver to every device of every participant, the sender's own
            // devices included; clients dedupe by message id.
            let participants = inner
                .store
                .participants_of(&conversation_id)
                .unwrap_or_default();
            participant_connections(inner, &participants)
                .into_iter()
                .map(|target| {
                    (
                        target,
                        ServerEvent::ReceiveMessage {
                            message: message.clone(),
                        },
                    )
                })
                .collect()
        }
        Err(error) => conversation_error(connection_id, error),
    }
}

fn apply_mark_read(
    inner: &mut HubInner,
    connection_id: ConnectionId,
    me: &str,
    conversation_id: ConversationId,
    message_ids: Vec<String>,
) -> Vec<Delivery> {
    match inner.store.mark_read(&conversation_id, &message_ids, me) {
        Ok(newly_marked) => {
            if newly_marked.is_empty() {
                return Vec::new();
            }
            let my_key = normalize_username(me);
            let others: Vec<String> = inner
                .store
                .participants_of(&conversation_id)
                .unwrap_or_default()
                .into_iter()
                .filter(|p| normalize_username(p) != my_key)
                .collect();
            let targets = participant_connections(inner, &others);

            let mut deliveries = Vec::new();
            for message_id in newly_marked {
                for &target in &targets {
                    deliveries.push((
                        target,
                        ServerEvent::MessageRead {
                            conversation_id: conversation_id.clone(),
                            message_id: message_id.clone(),
                            reader_username: me.to_string(),
                        },
                    ));
                }
            }
            deliveries
        }
        Err(error) => conversation_error(connection_id, error),
    }
}

/// Relay a typing signal to every device of `recipient`.  Purely transient:
/// nothing is recorded, and an offline recipient is a silent no-op.
fn relay_typing(inner: &HubInner, me: &str, recipient: &str, typing: bool) -> Vec<Delivery> {
    inner
        .registry
        .connections_of(recipient)
        .into_iter()
        .map(|target| {
            let event = if typing {
                ServerEvent::UserTyping {
                    username: me.to_string(),
                }
            } else {
                ServerEvent::UserStoppedTyping {
                    username: me.to_string(),
                }
            };
            (target, event)
        })
        .collect()
}

/// Disconnect cascade: presence events, then archival when the user's last
/// device is gone, then burning archives with no remaining audience.
fn apply_disconnect(inner: &mut HubInner, connection_id: ConnectionId) -> Vec<Delivery> {
    let Some(unbound) = inner.registry.unregister(connection_id) else {
        tlog!("hub: connection {connection_id} closed (anonymous)");
        return Vec::new();
    };

    let mut deliveries = Vec::new();
    if unbound.last_device {
        tlog!(
            "hub: {} fully disconnected (connection {connection_id})",
            logging::user(&unbound.username)
        );
        for snapshot in inner.store.archive_for_user(&unbound.username) {
            tlog!(
                "hub: conversation {} archived, {} message(s) retained",
                logging::conv(snapshot.conversation_id.as_str()),
                snapshot.last_messages.len()
            );
            let remaining: Vec<String> = snapshot
                .participants
                .iter()
                .filter(|p| normalize_username(p) != normalize_username(&unbound.username))
                .cloned()
                .collect();
            for target in participant_connections(inner, &remaining) {
                deliveries.push((
                    target,
                    ServerEvent::UserLeftConversation {
                        conversation_id: snapshot.conversation_id.clone(),
                        username: unbound.username.clone(),
                        archived: snapshot.clone(),
                    },
                ));
            }
        }
        for target in all_connections(inner) {
            deliveries.push((
                target,
                ServerEvent::UserDisconnected {
                    username: unbound.username.clone(),
                },
            ));
        }
        let registry = &inner.registry;
        inner.store.prune_archived(|name| registry.is_online(name));
    } else {
        tlog!(
            "hub: {} lost device connection {connection_id}, still online",
            logging::user(&unbound.username)
        );
        for target in all_connections(inner) {
            deliveries.push((
                target,
                ServerEvent::UserDeviceDisconnected {
                    username: unbound.username.clone(),
                    connection_id: connection_id.to_string(),
                },
            ));
        }
    }
    deliveries
}
