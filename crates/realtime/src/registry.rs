//! Connection bookkeeping and fan-out.
//!
//! Two sharded maps hold the only broadly shared mutable state in the
//! crate: user -> live connections and conversation -> subscribed
//! connections. No lock is ever held across an `await`, and no two shard
//! locks are held at once.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RealtimeError;
use crate::frames::ServerFrame;

const SHARD_COUNT: usize = 16;

/// Address of one live connection. A user with several devices holds one
/// handle per device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub user_id: i64,
    pub connection_id: Uuid,
}

/// What `unregister` reports about the connection it tore down.
#[derive(Debug)]
pub struct ClosedConnection {
    pub user_id: i64,
    /// Conversations the connection was subscribed to when it closed.
    pub joined: Vec<String>,
}

/// Tally of one fan-out pass.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    /// Connections whose queue was full or closed. The caller evicts these;
    /// the fan-out itself never stalls on them.
    pub dropped: Vec<ConnectionHandle>,
}

struct ConnectionSlot {
    /// `None` once the connection has been evicted; the slot stays behind
    /// so the eventual `unregister` still reports the joined set exactly
    /// once.
    sender: Option<mpsc::Sender<ServerFrame>>,
    joined: HashSet<String>,
}

type UserShard = RwLock<HashMap<i64, HashMap<Uuid, ConnectionSlot>>>;
type ConversationShard = RwLock<HashMap<String, HashMap<ConnectionHandle, mpsc::Sender<ServerFrame>>>>;

pub struct ConnectionRegistry {
    user_shards: Vec<UserShard>,
    conversation_shards: Vec<ConversationShard>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            user_shards: (0..SHARD_COUNT).map(|_| RwLock::default()).collect(),
            conversation_shards: (0..SHARD_COUNT).map(|_| RwLock::default()).collect(),
        }
    }

    fn user_shard(&self, user_id: i64) -> &UserShard {
        &self.user_shards[(user_id.unsigned_abs() % SHARD_COUNT as u64) as usize]
    }

    fn conversation_shard(&self, conversation_id: &str) -> &ConversationShard {
        let mut hasher = DefaultHasher::new();
        conversation_id.hash(&mut hasher);
        &self.conversation_shards[(hasher.finish() % SHARD_COUNT as u64) as usize]
    }

    /// Track a new connection. The registry takes ownership of the only
    /// long-lived sender for its outbound queue, so dropping the slot later
    /// is what ends the connection's write loop.
    pub async fn register(
        &self,
        user_id: i64,
        sender: mpsc::Sender<ServerFrame>,
    ) -> ConnectionHandle {
        let handle = ConnectionHandle {
            user_id,
            connection_id: Uuid::new_v4(),
        };

        let mut shard = self.user_shard(user_id).write().await;
        shard.entry(user_id).or_default().insert(
            handle.connection_id,
            ConnectionSlot {
                sender: Some(sender),
                joined: HashSet::new(),
            },
        );

        handle
    }

    /// Tear down a connection. Returns `None` when the handle was already
    /// unregistered, so repeated calls (close racing an error path) cannot
    /// double-run presence or typing cleanup.
    pub async fn unregister(&self, handle: &ConnectionHandle) -> Option<ClosedConnection> {
        let slot = {
            let mut shard = self.user_shard(handle.user_id).write().await;
            let connections = shard.get_mut(&handle.user_id)?;
            let slot = connections.remove(&handle.connection_id)?;
            if connections.is_empty() {
                shard.remove(&handle.user_id);
            }
            slot
        };

        let joined: Vec<String> = slot.joined.into_iter().collect();
        for conversation_id in &joined {
            self.remove_subscription(handle, conversation_id).await;
        }

        Some(ClosedConnection {
            user_id: handle.user_id,
            joined,
        })
    }

    /// Subscribe a connection to a conversation's fan-out.
    pub async fn join(
        &self,
        handle: &ConnectionHandle,
        conversation_id: &str,
    ) -> Result<(), RealtimeError> {
        let sender = {
            let mut shard = self.user_shard(handle.user_id).write().await;
            let slot = shard
                .get_mut(&handle.user_id)
                .and_then(|connections| connections.get_mut(&handle.connection_id))
                .ok_or_else(|| RealtimeError::transport("connection is not registered"))?;
            let sender = slot
                .sender
                .clone()
                .ok_or_else(|| RealtimeError::transport("connection is closing"))?;
            slot.joined.insert(conversation_id.to_string());
            sender
        };

        {
            let mut shard = self.conversation_shard(conversation_id).write().await;
            shard
                .entry(conversation_id.to_string())
                .or_default()
                .insert(handle.clone(), sender);
        }

        // An unregister may have raced between the two shard updates; if the
        // slot is gone the subscription we just added must not outlive it.
        let still_registered = {
            let shard = self.user_shard(handle.user_id).read().await;
            shard
                .get(&handle.user_id)
                .map(|connections| connections.contains_key(&handle.connection_id))
                .unwrap_or(false)
        };
        if !still_registered {
            self.remove_subscription(handle, conversation_id).await;
            return Err(RealtimeError::transport("connection is not registered"));
        }

        Ok(())
    }

    /// Unsubscribe a connection from one conversation. Returns whether the
    /// connection was actually subscribed.
    pub async fn leave(&self, handle: &ConnectionHandle, conversation_id: &str) -> bool {
        let was_joined = {
            let mut shard = self.user_shard(handle.user_id).write().await;
            shard
                .get_mut(&handle.user_id)
                .and_then(|connections| connections.get_mut(&handle.connection_id))
                .map(|slot| slot.joined.remove(conversation_id))
                .unwrap_or(false)
        };

        if was_joined {
            self.remove_subscription(handle, conversation_id).await;
        }

        was_joined
    }

    /// Cut a connection off from all fan-out without consuming its
    /// `unregister`. Dropping the registry's senders ends the victim's
    /// write loop; the socket then unwinds through the normal close path,
    /// which still observes the joined set.
    pub async fn evict(&self, handle: &ConnectionHandle) {
        let joined = {
            let mut shard = self.user_shard(handle.user_id).write().await;
            let Some(slot) = shard
                .get_mut(&handle.user_id)
                .and_then(|connections| connections.get_mut(&handle.connection_id))
            else {
                return;
            };
            if slot.sender.take().is_none() {
                // Already evicted.
                return;
            }
            slot.joined.iter().cloned().collect::<Vec<_>>()
        };

        for conversation_id in &joined {
            self.remove_subscription(handle, conversation_id).await;
        }
        debug!(
            user_id = handle.user_id,
            connection_id = %handle.connection_id,
            "evicted connection from fan-out"
        );
    }

    /// Remove every connection of one user from one conversation's fan-out,
    /// leaving the connections themselves alive. Used when membership is
    /// revoked while the user is subscribed.
    pub async fn expel_user(&self, conversation_id: &str, user_id: i64) -> bool {
        let handles: Vec<ConnectionHandle> = {
            let shard = self.conversation_shard(conversation_id).read().await;
            match shard.get(conversation_id) {
                Some(subscribers) => subscribers
                    .keys()
                    .filter(|handle| handle.user_id == user_id)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };

        if handles.is_empty() {
            return false;
        }

        for handle in &handles {
            {
                let mut shard = self.user_shard(user_id).write().await;
                if let Some(slot) = shard
                    .get_mut(&user_id)
                    .and_then(|connections| connections.get_mut(&handle.connection_id))
                {
                    slot.joined.remove(conversation_id);
                }
            }
            self.remove_subscription(handle, conversation_id).await;
        }
        true
    }

    /// Queue a frame to a single connection. `false` means the connection
    /// is gone or its queue is full; callers respond by evicting it.
    pub async fn send_to(&self, handle: &ConnectionHandle, frame: ServerFrame) -> bool {
        let sender = {
            let shard = self.user_shard(handle.user_id).read().await;
            shard
                .get(&handle.user_id)
                .and_then(|connections| connections.get(&handle.connection_id))
                .and_then(|slot| slot.sender.clone())
        };

        match sender {
            Some(sender) => sender.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Fan a frame out to every connection subscribed to the conversation.
    ///
    /// Senders are collected under the shard read lock and pushed after it
    /// is released; a full or closed queue marks that connection dropped
    /// and never delays the others.
    pub async fn broadcast(
        &self,
        conversation_id: &str,
        frame: &ServerFrame,
        exclude: Option<&ConnectionHandle>,
    ) -> BroadcastOutcome {
        let targets: Vec<(ConnectionHandle, mpsc::Sender<ServerFrame>)> = {
            let shard = self.conversation_shard(conversation_id).read().await;
            match shard.get(conversation_id) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|(handle, _)| Some(*handle) != exclude)
                    .map(|(handle, sender)| (handle.clone(), sender.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut outcome = BroadcastOutcome::default();
        for (handle, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        conversation_id,
                        user_id = handle.user_id,
                        connection_id = %handle.connection_id,
                        "outbound queue full, dropping connection"
                    );
                    outcome.dropped.push(handle);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        conversation_id,
                        user_id = handle.user_id,
                        connection_id = %handle.connection_id,
                        "outbound queue closed, dropping connection"
                    );
                    outcome.dropped.push(handle);
                }
            }
        }
        outcome
    }

    /// Users with at least one live connection at call time. Best effort:
    /// shards are read one at a time, so a concurrent register or eviction
    /// may or may not be visible.
    pub async fn online_user_ids(&self) -> HashSet<i64> {
        let mut online = HashSet::new();
        for shard in &self.user_shards {
            let shard = shard.read().await;
            for (user_id, connections) in shard.iter() {
                if connections.values().any(|slot| slot.sender.is_some()) {
                    online.insert(*user_id);
                }
            }
        }
        online
    }

    /// Whether any of the user's connections is subscribed to the
    /// conversation. Distinguishes "this device left" from "the user left".
    pub async fn is_user_joined(&self, user_id: i64, conversation_id: &str) -> bool {
        let shard = self.conversation_shard(conversation_id).read().await;
        shard
            .get(conversation_id)
            .map(|subscribers| {
                subscribers
                    .keys()
                    .any(|handle| handle.user_id == user_id)
            })
            .unwrap_or(false)
    }

    async fn remove_subscription(&self, handle: &ConnectionHandle, conversation_id: &str) {
        let mut shard = self.conversation_shard(conversation_id).write().await;
        if let Some(subscribers) = shard.get_mut(conversation_id) {
            subscribers.remove(handle);
            if subscribers.is_empty() {
                shard.remove(conversation_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> ServerFrame {
        ServerFrame::ack("join", Some("c_1".to_string()))
    }

    #[tokio::test]
    async fn broadcast_reaches_joined_connections_only() {
        let registry = ConnectionRegistry::new();

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (tx_c, mut rx_c) = mpsc::channel(8);

        let a = registry.register(1, tx_a).await;
        let b = registry.register(2, tx_b).await;
        let _c = registry.register(3, tx_c).await;

        registry.join(&a, "c_1").await.unwrap();
        registry.join(&b, "c_1").await.unwrap();

        let outcome = registry.broadcast("c_1", &frame(), None).await;
        assert_eq!(outcome.delivered, 2);
        assert!(outcome.dropped.is_empty());

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_can_exclude_the_sender() {
        let registry = ConnectionRegistry::new();

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);

        let a = registry.register(1, tx_a).await;
        let b = registry.register(2, tx_b).await;
        registry.join(&a, "c_1").await.unwrap();
        registry.join(&b, "c_1").await.unwrap();

        let outcome = registry.broadcast("c_1", &frame(), Some(&a)).await;
        assert_eq!(outcome.delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn full_queue_drops_only_the_slow_connection() {
        let registry = ConnectionRegistry::new();

        let (tx_slow, _rx_slow) = mpsc::channel(1);
        let (tx_ok, mut rx_ok) = mpsc::channel(8);

        let slow = registry.register(1, tx_slow).await;
        let ok = registry.register(2, tx_ok).await;
        registry.join(&slow, "c_1").await.unwrap();
        registry.join(&ok, "c_1").await.unwrap();

        // First broadcast fills the slow queue, second overflows it.
        let first = registry.broadcast("c_1", &frame(), None).await;
        assert_eq!(first.delivered, 2);
        let second = registry.broadcast("c_1", &frame(), None).await;
        assert_eq!(second.delivered, 1);
        assert_eq!(second.dropped, vec![slow.clone()]);

        registry.evict(&slow).await;
        let third = registry.broadcast("c_1", &frame(), None).await;
        assert_eq!(third.delivered, 1);
        assert!(third.dropped.is_empty());
        assert!(rx_ok.try_recv().is_ok());

        // The evicted connection still unregisters exactly once.
        let closed = registry.unregister(&slow).await.expect("first unregister");
        assert_eq!(closed.joined, vec!["c_1".to_string()]);
        assert!(registry.unregister(&slow).await.is_none());
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_join_fails_afterwards() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);

        let handle = registry.register(7, tx).await;
        registry.join(&handle, "c_1").await.unwrap();

        let closed = registry.unregister(&handle).await.expect("first call");
        assert_eq!(closed.user_id, 7);
        assert_eq!(closed.joined, vec!["c_1".to_string()]);

        assert!(registry.unregister(&handle).await.is_none());
        assert!(registry.join(&handle, "c_2").await.is_err());

        let outcome = registry.broadcast("c_1", &frame(), None).await;
        assert_eq!(outcome.delivered, 0);
    }

    #[tokio::test]
    async fn leave_removes_a_single_subscription() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = registry.register(4, tx).await;
        registry.join(&handle, "c_1").await.unwrap();
        registry.join(&handle, "c_2").await.unwrap();

        assert!(registry.leave(&handle, "c_1").await);
        assert!(!registry.leave(&handle, "c_1").await);

        assert_eq!(registry.broadcast("c_1", &frame(), None).await.delivered, 0);
        assert_eq!(registry.broadcast("c_2", &frame(), None).await.delivered, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn user_counts_as_joined_while_any_device_remains() {
        let registry = ConnectionRegistry::new();
        let (tx_1, _rx_1) = mpsc::channel(8);
        let (tx_2, _rx_2) = mpsc::channel(8);

        let phone = registry.register(5, tx_1).await;
        let laptop = registry.register(5, tx_2).await;
        registry.join(&phone, "c_1").await.unwrap();
        registry.join(&laptop, "c_1").await.unwrap();

        registry.unregister(&phone).await.unwrap();
        assert!(registry.is_user_joined(5, "c_1").await);

        registry.unregister(&laptop).await.unwrap();
        assert!(!registry.is_user_joined(5, "c_1").await);
    }

    #[tokio::test]
    async fn expel_user_cuts_all_devices_from_one_conversation() {
        let registry = ConnectionRegistry::new();
        let (tx_1, mut rx_1) = mpsc::channel(8);
        let (tx_2, _rx_2) = mpsc::channel(8);

        let phone = registry.register(6, tx_1).await;
        let laptop = registry.register(6, tx_2).await;
        registry.join(&phone, "c_1").await.unwrap();
        registry.join(&phone, "c_2").await.unwrap();
        registry.join(&laptop, "c_1").await.unwrap();

        assert!(registry.expel_user("c_1", 6).await);
        assert!(!registry.expel_user("c_1", 6).await);

        assert_eq!(registry.broadcast("c_1", &frame(), None).await.delivered, 0);
        // The other conversation and the connection itself stay live.
        assert_eq!(registry.broadcast("c_2", &frame(), None).await.delivered, 1);
        assert!(rx_1.try_recv().is_ok());
        assert!(registry.send_to(&phone, frame()).await);
    }

    #[tokio::test]
    async fn online_snapshot_counts_live_connections_only() {
        let registry = ConnectionRegistry::new();
        let (tx_1, _rx_1) = mpsc::channel(8);
        let (tx_2, _rx_2) = mpsc::channel(8);

        let a = registry.register(1, tx_1).await;
        let b = registry.register(2, tx_2).await;
        assert_eq!(
            registry.online_user_ids().await,
            HashSet::from([1, 2])
        );

        registry.evict(&a).await;
        assert_eq!(registry.online_user_ids().await, HashSet::from([2]));

        registry.unregister(&b).await.unwrap();
        registry.unregister(&a).await.unwrap();
        assert!(registry.online_user_ids().await.is_empty());
    }

    #[tokio::test]
    async fn send_to_reports_gone_connections() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);

        let handle = registry.register(9, tx).await;
        assert!(registry.send_to(&handle, frame()).await);
        assert!(rx.try_recv().is_ok());

        registry.evict(&handle).await;
        assert!(!registry.send_to(&handle, frame()).await);
    }
}
