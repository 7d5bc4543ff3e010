//! Connection registry and derived presence.
//!
//! Tracks every live transport connection and which username claim, if any,
//! it belongs to.  One user may hold several connections (devices); the user
//! exists exactly as long as its connection set is non-empty.  All mutation
//! happens under the hub's single lock, so check-then-set during
//! [`ConnectionRegistry::bind_username`] is atomic and two racing claims of
//! one name cannot both succeed.
//!
//! Presence is a derived view: [`ConnectionRegistry::list_active`] and
//! [`ConnectionRegistry::is_online`] read the same maps the bind/unregister
//! paths maintain, so a user is listed active iff at least one connection is
//! bound to them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::protocol::{normalize_username, ActiveUser};

/// Server-assigned transport connection identifier.
pub type ConnectionId = u64;

/// Outcome of a username bind attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// The claim succeeded.  `first_device` is true when this created the
    /// user (drives `user_connected` vs. silent device join).
    Bound {
        username: String,
        first_device: bool,
        session_token: String,
    },
    /// The connection already holds this exact name; nothing changed.
    Unchanged {
        username: String,
        session_token: String,
    },
    /// The name belongs to a different live identity (missing or wrong
    /// session token).
    Taken { username: String },
    /// The connection is already identified under a different name.
    AlreadyIdentified { current: String },
}

/// Result of unregistering a connection that had a username bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unbound {
    /// Display form of the affected user.
    pub username: String,
    /// Connection that went away.
    pub connection_id: ConnectionId,
    /// True when this was the user's final connection and the user is gone.
    pub last_device: bool,
}

struct ConnectionInfo {
    /// Normalized key into `users`; `None` while the connection is anonymous.
    username_key: Option<String>,
    opened_at: Instant,
}

struct UserClaim {
    /// Spelling presented at first successful bind.
    display: String,
    /// Continuity proof handed back on bind; further devices must present it.
    session_token: String,
    connections: BTreeSet<ConnectionId>,
}

/// Live connections and the username claims over them.
pub struct ConnectionRegistry {
    next_connection_id: ConnectionId,
    connections: HashMap<ConnectionId, ConnectionInfo>,
    /// Normalized username -> claim.  BTreeMap keeps `list_active` ordering
    /// stable without a sort on every snapshot.
    users: BTreeMap<String, UserClaim>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_connection_id: 0,
            connections: HashMap::new(),
            users: BTreeMap::new(),
        }
    }

    /// Admit a new transport connection in the anonymous state.
    pub fn register(&mut self, now: Instant) -> ConnectionId {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        self.connections.insert(
            id,
            ConnectionInfo {
                username_key: None,
                opened_at: now,
            },
        );
        id
    }

    /// Attempt to claim `raw` for `connection_id`.
    ///
    /// The whole check-then-set runs on `&mut self`, so callers holding the
    /// hub lock get an atomic bind.
    pub fn bind_username(
        &mut self,
        connection_id: ConnectionId,
        raw: &str,
        session_token: Option<&str>,
    ) -> BindOutcome {
        let display = raw.trim().to_string();
        let key = normalize_username(raw);

        let Some(info) = self.connections.get(&connection_id) else {
            // Connection vanished mid-call; treat as a lost race.
            return BindOutcome::Taken { username: display };
        };

        if let Some(current_key) = &info.username_key {
            let (current, token) = self
                .users
                .get(current_key)
                .map(|c| (c.display.clone(), c.session_token.clone()))
                .unwrap_or_else(|| (current_key.clone(), String::new()));
            if *current_key == key {
                return BindOutcome::Unchanged {
                    username: current,
                    session_token: token,
                };
            }
            return BindOutcome::AlreadyIdentified { current };
        }

        match self.users.get_mut(&key) {
            Some(claim) => {
                // Live name: joining requires the claim's session token.
                if session_token != Some(claim.session_token.as_str()) {
                    return BindOutcome::Taken { username: display };
                }
                claim.connections.insert(connection_id);
                let username = claim.display.clone();
                let token = claim.session_token.clone();
                if let Some(c) = self.connections.get_mut(&connection_id) {
                    c.username_key = Some(key);
                }
                BindOutcome::Bound {
                    username,
                    first_device: false,
                    session_token: token,
                }
            }
            None => {
                let token = new_session_token();
                let mut connections = BTreeSet::new();
                connections.insert(connection_id);
                self.users.insert(
                    key.clone(),
                    UserClaim {
                        display: display.clone(),
                        session_token: token.clone(),
                        connections,
                    },
                );
                if let Some(c) = self.connections.get_mut(&connection_id) {
                    c.username_key = Some(key);
                }
                BindOutcome::Bound {
                    username: display,
                    first_device: true,
                    session_token: token,
                }
            }
        }
    }

    /// Remove a connection.  Returns the affected user, if the connection
    /// was identified; `last_device` signals the presence/archival cascade.
    pub fn unregister(&mut self, connection_id: ConnectionId) -> Option<Unbound> {
        let info = self.connections.remove(&connection_id)?;
        let key = info.username_key?;

        let claim = self.users.get_mut(&key)?;
        claim.connections.remove(&connection_id);
        let username = claim.display.clone();
        let last_device = claim.connections.is_empty();
        if last_device {
            self.users.remove(&key);
        }
        Some(Unbound {
            username,
            connection_id,
            last_device,
        })
    }

    /// Display form of the username bound to `connection_id`, if any.
    pub fn username_of(&self, connection_id: ConnectionId) -> Option<&str> {
        let key = self.connections.get(&connection_id)?.username_key.as_deref()?;
        self.users.get(key).map(|c| c.display.as_str())
    }

    /// All connections currently bound to `username` (any casing).
    pub fn connections_of(&self, username: &str) -> Vec<ConnectionId> {
        self.users
            .get(&normalize_username(username))
            .map(|claim| claim.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Display form under which `username` is claimed, if the user is live.
    pub fn display_of(&self, username: &str) -> Option<&str> {
        self.users
            .get(&normalize_username(username))
            .map(|c| c.display.as_str())
    }

    // -----------------------------------------------------------------------
    // Derived presence view
    // -----------------------------------------------------------------------

    /// Snapshot of every online user and their device connections.
    pub fn list_active(&self) -> Vec<ActiveUser> {
        self.users
            .values()
            .map(|claim| ActiveUser {
                username: claim.display.clone(),
                connection_ids: claim
                    .connections
                    .iter()
                    .map(|id| id.to_string())
                    .collect(),
            })
            .collect()
    }

    /// True iff at least one connection is bound to `username`.
    pub fn is_online(&self, username: &str) -> bool {
        self.users.contains_key(&normalize_username(username))
    }

    /// Number of open connections, identified or not.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of distinct online users.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Per-connection rows for the stats endpoint: id, bound username (if
    /// any), and connection age in seconds.
    pub fn list_connections(&self, now: Instant) -> Vec<(ConnectionId, Option<String>, u64)> {
        let mut rows: Vec<_> = self
            .connections
            .iter()
            .map(|(id, info)| {
                let username = info
                    .username_key
                    .as_ref()
                    .and_then(|key| self.users.get(key))
                    .map(|claim| claim.display.clone());
                (*id, username, now.duration_since(info.opened_at).as_secs())
            })
            .collect();
        rows.sort_by_key(|(id, _, _)| *id);
        rows
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn new_session_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_token(outcome: &BindOutcome) -> String {
        match outcome {
            BindOutcome::Bound { session_token, .. } => session_token.clone(),
            other => panic!("expected Bound, got {other:?}"),
        }
    }

    #[test]
    fn test_bind_first_device_creates_user() {
        let mut registry = ConnectionRegistry::new();
        let conn = registry.register(Instant::now());

        let outcome = registry.bind_username(conn, "Alice", None);
        assert!(matches!(
            &outcome,
            BindOutcome::Bound {
                username,
                first_device: true,
                ..
            } if username == "Alice"
        ));
        assert!(registry.is_online("alice"));
        assert_eq!(registry.username_of(conn), Some("Alice"));
    }

    #[test]
    fn test_claim_without_token_is_taken() {
        let mut registry = ConnectionRegistry::new();
        let first = registry.register(Instant::now());
        let second = registry.register(Instant::now());
        registry.bind_username(first, "bob", None);

        let outcome = registry.bind_username(second, "Bob", None);
        assert!(matches!(outcome, BindOutcome::Taken { .. }));
        // First claimant unaffected.
        assert_eq!(registry.connections_of("bob"), vec![first]);
        assert_eq!(registry.username_of(second), None);
    }

    #[test]
    fn test_token_joins_additional_device() {
        let mut registry = ConnectionRegistry::new();
        let phone = registry.register(Instant::now());
        let laptop = registry.register(Instant::now());
        let token = bound_token(&registry.bind_username(phone, "carol", None));

        let outcome = registry.bind_username(laptop, "CAROL", Some(&token));
        assert!(matches!(
            outcome,
            BindOutcome::Bound {
                first_device: false,
                ..
            }
        ));
        assert_eq!(registry.connections_of("carol").len(), 2);
        // Display form is the first device's spelling.
        assert_eq!(registry.username_of(laptop), Some("carol"));
    }

    #[test]
    fn test_rebind_same_name_is_unchanged() {
        let mut registry = ConnectionRegistry::new();
        let conn = registry.register(Instant::now());
        registry.bind_username(conn, "dave", None);

        let outcome = registry.bind_username(conn, " DAVE ", None);
        assert!(matches!(outcome, BindOutcome::Unchanged { .. }));
        assert_eq!(registry.connections_of("dave"), vec![conn]);
    }

    #[test]
    fn test_rebind_different_name_rejected() {
        let mut registry = ConnectionRegistry::new();
        let conn = registry.register(Instant::now());
        registry.bind_username(conn, "erin", None);

        let outcome = registry.bind_username(conn, "frank", None);
        assert!(matches!(
            outcome,
            BindOutcome::AlreadyIdentified { current } if current == "erin"
        ));
        assert!(!registry.is_online("frank"));
    }

    #[test]
    fn test_unregister_partial_then_last_device() {
        let mut registry = ConnectionRegistry::new();
        let phone = registry.register(Instant::now());
        let laptop = registry.register(Instant::now());
        let token = bound_token(&registry.bind_username(phone, "alice", None));
        registry.bind_username(laptop, "alice", Some(&token));

        let partial = registry.unregister(phone).expect("identified");
        assert!(!partial.last_device);
        assert!(registry.is_online("alice"));

        let last = registry.unregister(laptop).expect("identified");
        assert!(last.last_device);
        assert!(!registry.is_online("alice"));
        assert_eq!(registry.user_count(), 0);
    }

    #[test]
    fn test_unregister_anonymous_connection_is_silent() {
        let mut registry = ConnectionRegistry::new();
        let conn = registry.register(Instant::now());
        assert!(registry.unregister(conn).is_none());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_name_is_reclaimable_after_full_disconnect() {
        let mut registry = ConnectionRegistry::new();
        let first = registry.register(Instant::now());
        registry.bind_username(first, "gwen", None);
        registry.unregister(first);

        let second = registry.register(Instant::now());
        let outcome = registry.bind_username(second, "gwen", None);
        assert!(matches!(
            outcome,
            BindOutcome::Bound {
                first_device: true,
                ..
            }
        ));
    }

    #[test]
    fn test_list_active_reports_all_devices() {
        let mut registry = ConnectionRegistry::new();
        let a = registry.register(Instant::now());
        let b = registry.register(Instant::now());
        let c = registry.register(Instant::now());
        let token = bound_token(&registry.bind_username(a, "alice", None));
        registry.bind_username(b, "alice", Some(&token));
        registry.bind_username(c, "bob", None);

        let active = registry.list_active();
        assert_eq!(active.len(), 2);
        let alice = active.iter().find(|u| u.username == "alice").unwrap();
        assert_eq!(alice.connection_ids.len(), 2);
    }
}
