//! Ephemeral typing indicators.
//!
//! Entries live in memory only and expire twice over: reads prune lazily,
//! and a background sweep clears conversations nobody is reading so an
//! indicator never outlives its TTL by more than one sweep interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use crate::frames::ServerFrame;
use crate::registry::ConnectionRegistry;

struct TypingEntry {
    public_id: String,
    expires_at: Instant,
}

pub struct TypingIndicatorStore {
    conversations: Mutex<HashMap<String, HashMap<i64, TypingEntry>>>,
}

impl Default for TypingIndicatorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TypingIndicatorStore {
    pub fn new() -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Record (or refresh) a typing indicator and return the conversation's
    /// visible snapshot.
    pub async fn start_typing(
        &self,
        conversation_id: &str,
        user_id: i64,
        public_id: &str,
        ttl: Duration,
    ) -> Vec<String> {
        let now = Instant::now();
        let mut conversations = self.conversations.lock().await;
        let entries = conversations
            .entry(conversation_id.to_string())
            .or_default();
        prune(entries, now);
        entries.insert(
            user_id,
            TypingEntry {
                public_id: public_id.to_string(),
                expires_at: now + ttl,
            },
        );
        snapshot(entries)
    }

    /// Drop a user's indicator and return the updated snapshot.
    pub async fn stop_typing(&self, conversation_id: &str, user_id: i64) -> Vec<String> {
        let now = Instant::now();
        let mut conversations = self.conversations.lock().await;
        let Some(entries) = conversations.get_mut(conversation_id) else {
            return Vec::new();
        };
        prune(entries, now);
        entries.remove(&user_id);
        let result = snapshot(entries);
        if entries.is_empty() {
            conversations.remove(conversation_id);
        }
        result
    }

    /// The conversation's current snapshot, with expired entries pruned.
    pub async fn snapshot(&self, conversation_id: &str) -> Vec<String> {
        let now = Instant::now();
        let mut conversations = self.conversations.lock().await;
        let Some(entries) = conversations.get_mut(conversation_id) else {
            return Vec::new();
        };
        prune(entries, now);
        let result = snapshot(entries);
        if entries.is_empty() {
            conversations.remove(conversation_id);
        }
        result
    }

    /// Remove a departed user's indicators from the given conversations.
    /// Returns each conversation whose visible snapshot changed, with its
    /// new snapshot.
    pub async fn clear_user(
        &self,
        user_id: i64,
        conversation_ids: &[String],
    ) -> Vec<(String, Vec<String>)> {
        let now = Instant::now();
        let mut conversations = self.conversations.lock().await;
        let mut changed = Vec::new();

        for conversation_id in conversation_ids {
            let Some(entries) = conversations.get_mut(conversation_id) else {
                continue;
            };
            prune(entries, now);
            if entries.remove(&user_id).is_some() {
                changed.push((conversation_id.clone(), snapshot(entries)));
            }
            if entries.is_empty() {
                conversations.remove(conversation_id);
            }
        }

        changed
    }

    /// Prune every conversation and report the ones whose snapshot changed.
    /// This is the sweep half of expiry; it exists so conversations nobody
    /// writes to still emit a final `typing_update`.
    pub async fn collect_expired(&self) -> Vec<(String, Vec<String>)> {
        let now = Instant::now();
        let mut conversations = self.conversations.lock().await;
        let mut changed = Vec::new();

        conversations.retain(|conversation_id, entries| {
            if prune(entries, now) {
                changed.push((conversation_id.clone(), snapshot(entries)));
            }
            !entries.is_empty()
        });

        changed
    }
}

/// Drop expired entries. Returns whether anything was removed.
fn prune(entries: &mut HashMap<i64, TypingEntry>, now: Instant) -> bool {
    let before = entries.len();
    entries.retain(|_, entry| entry.expires_at > now);
    entries.len() != before
}

fn snapshot(entries: &HashMap<i64, TypingEntry>) -> Vec<String> {
    let mut users: Vec<String> = entries
        .values()
        .map(|entry| entry.public_id.clone())
        .collect();
    users.sort();
    users
}

/// Handle to the background sweep task.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Spawn the typing sweep loop. Each tick prunes expired indicators and
/// broadcasts a `typing_update` for every conversation that changed;
/// connections with full queues are evicted, never waited on.
pub fn run_typing_sweeper(
    registry: Arc<ConnectionRegistry>,
    store: Arc<TypingIndicatorStore>,
    sweep_interval: Duration,
) -> SweeperHandle {
    let task = tokio::spawn(async move {
        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = store.collect_expired().await;
            for (conversation_id, user_ids) in expired {
                debug!(conversation_id, "typing indicators expired");
                let frame = ServerFrame::typing_update(conversation_id.clone(), user_ids);
                let outcome = registry.broadcast(&conversation_id, &frame, None).await;
                for handle in outcome.dropped {
                    registry.evict(&handle).await;
                }
            }
        }
    });

    SweeperHandle { task }
}
