//! Online/offline tracking across devices.
//!
//! A user is online while at least one connection is open. The tracker only
//! counts and reports transitions; broadcasting them is the router's job.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Outcome of a connect or disconnect event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// First open connection for this user.
    CameOnline,
    /// Last connection closed.
    WentOffline { last_seen: DateTime<Utc> },
    /// The user already was (or remains) online.
    Unchanged,
}

struct PresenceEntry {
    public_id: String,
    connections: usize,
}

#[derive(Default)]
struct PresenceState {
    online: HashMap<i64, PresenceEntry>,
    last_seen: HashMap<i64, DateTime<Utc>>,
}

pub struct PresenceTracker {
    state: Mutex<PresenceState>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PresenceState::default()),
        }
    }

    /// Count one more connection for the user. Returns `CameOnline` only on
    /// the 0 -> 1 transition.
    pub async fn mark_connected(&self, user_id: i64, public_id: &str) -> PresenceChange {
        let mut state = self.state.lock().await;
        let entry = state.online.entry(user_id).or_insert_with(|| PresenceEntry {
            public_id: public_id.to_string(),
            connections: 0,
        });
        entry.connections += 1;

        if entry.connections == 1 {
            PresenceChange::CameOnline
        } else {
            PresenceChange::Unchanged
        }
    }

    /// Count one connection down. Returns `WentOffline` only on the -> 0
    /// transition; a disconnect for an unknown user is `Unchanged`.
    pub async fn mark_disconnected(&self, user_id: i64) -> PresenceChange {
        let mut state = self.state.lock().await;
        let Some(entry) = state.online.get_mut(&user_id) else {
            return PresenceChange::Unchanged;
        };

        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections > 0 {
            return PresenceChange::Unchanged;
        }

        state.online.remove(&user_id);
        let last_seen = Utc::now();
        state.last_seen.insert(user_id, last_seen);
        PresenceChange::WentOffline { last_seen }
    }

    /// Public ids of every online user, sorted for stable responses.
    pub async fn online_users(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut users: Vec<String> = state
            .online
            .values()
            .map(|entry| entry.public_id.clone())
            .collect();
        users.sort();
        users
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.state.lock().await.online.contains_key(&user_id)
    }

    /// When the user last went offline. `None` for users that are online or
    /// were never seen.
    pub async fn last_seen(&self, user_id: i64) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        if state.online.contains_key(&user_id) {
            return None;
        }
        state.last_seen.get(&user_id).copied()
    }
}
