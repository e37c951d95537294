//! Session lifecycle and inbound frame dispatch.
//!
//! The router is the only component that touches all of the registry,
//! presence tracker, typing store and the collaborator ports. Every
//! per-operation failure is absorbed here: it becomes an `error` frame to
//! the offending sender or an eviction of a dead connection, never an
//! error returned to the read loop.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::authorizer::ConversationAuthorizer;
use crate::error::RealtimeError;
use crate::frames::{ClientFrame, MessageBroadcast, ServerFrame};
use crate::ports::{Identity, IdentityVerifier, MessageDraft, MessageStore, ParticipantDirectory};
use crate::presence::{PresenceChange, PresenceTracker};
use crate::registry::{BroadcastOutcome, ConnectionHandle, ConnectionRegistry};
use crate::typing::TypingIndicatorStore;

const WRITER_SHARD_COUNT: usize = 16;
const MAX_MESSAGE_BYTES: usize = 4096;

/// Per-connection state, owned by the connection's read task. Mutated only
/// there, so no lock guards it.
#[derive(Debug)]
pub struct ClientSession {
    identity: Identity,
    handle: ConnectionHandle,
    /// Local mirror of this connection's subscriptions, used for the
    /// "joined" dispatch preconditions. The registry remains authoritative
    /// for cleanup.
    joined: HashSet<String>,
}

impl ClientSession {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn is_joined(&self, conversation_id: &str) -> bool {
        self.joined.contains(conversation_id)
    }
}

/// Sharded per-conversation write locks. Holding the shard lock across
/// persist and fan-out makes delivery order equal persisted order within a
/// conversation; unrelated conversations land on different shards and never
/// contend.
struct ConversationWriters {
    shards: Vec<Mutex<()>>,
}

impl ConversationWriters {
    fn new() -> Self {
        Self {
            shards: (0..WRITER_SHARD_COUNT).map(|_| Mutex::new(())).collect(),
        }
    }

    fn shard(&self, conversation_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        conversation_id.hash(&mut hasher);
        &self.shards[(hasher.finish() % WRITER_SHARD_COUNT as u64) as usize]
    }
}

pub struct MessageRouter<V, D, S> {
    verifier: V,
    authorizer: ConversationAuthorizer<D>,
    store: S,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingIndicatorStore>,
    typing_ttl: Duration,
    writers: ConversationWriters,
}

impl<V, D, S> MessageRouter<V, D, S>
where
    V: IdentityVerifier,
    D: ParticipantDirectory,
    S: MessageStore,
{
    pub fn new(
        verifier: V,
        directory: D,
        store: S,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        typing: Arc<TypingIndicatorStore>,
        typing_ttl: Duration,
    ) -> Self {
        Self {
            verifier,
            authorizer: ConversationAuthorizer::new(directory),
            store,
            registry,
            presence,
            typing,
            typing_ttl,
            writers: ConversationWriters::new(),
        }
    }

    /// Authenticate a connection and register it for fan-out.
    ///
    /// Authentication is the only fatal failure; the caller forwards the
    /// error frame and closes the socket. A refused target join is not
    /// fatal: the session comes back authenticated but unjoined, with the
    /// refusal already queued to the client.
    pub async fn open_session(
        &self,
        token: &str,
        target_conversation: Option<&str>,
        sender: mpsc::Sender<ServerFrame>,
    ) -> Result<ClientSession, RealtimeError> {
        let identity = match self.verifier.verify(token).await {
            Ok(Some(identity)) => identity,
            Ok(None) => return Err(RealtimeError::auth("invalid or expired token")),
            Err(err) => {
                warn!(error = %err, "identity verification unavailable");
                return Err(RealtimeError::auth("identity verification unavailable"));
            }
        };

        let handle = self.registry.register(identity.user_id, sender).await;
        let mut session = ClientSession {
            identity,
            handle,
            joined: HashSet::new(),
        };

        let change = self
            .presence
            .mark_connected(session.identity.user_id, &session.identity.public_id)
            .await;
        if change == PresenceChange::CameOnline {
            self.broadcast_presence(session.identity.user_id, &session.identity.public_id, true, None)
                .await;
        }

        info!(
            user = %session.identity.public_id,
            connection_id = %session.handle.connection_id,
            "realtime session opened"
        );

        if let Some(conversation_id) = target_conversation {
            self.join_conversation(&mut session, conversation_id).await;
        }

        Ok(session)
    }

    /// Dispatch one inbound frame.
    pub async fn handle_frame(&self, session: &mut ClientSession, frame: ClientFrame) {
        match frame {
            ClientFrame::Join { conversation_id } => {
                self.join_conversation(session, &conversation_id).await;
            }
            ClientFrame::Leave { conversation_id } => {
                if !session.joined.remove(&conversation_id) {
                    self.reply_not_joined(session, &conversation_id).await;
                    return;
                }
                self.registry.leave(&session.handle, &conversation_id).await;
                self.clear_typing_unless_other_device(session.identity.user_id, &conversation_id)
                    .await;
                self.reply(session, ServerFrame::ack("leave", Some(conversation_id)))
                    .await;
            }
            ClientFrame::SendMessage {
                conversation_id,
                payload,
            } => {
                self.send_message(session, &conversation_id, payload.content)
                    .await;
            }
            ClientFrame::TypingStart { conversation_id } => {
                if !self.typing_allowed(session, &conversation_id).await {
                    self.reply_not_joined(session, &conversation_id).await;
                    return;
                }
                let snapshot = self
                    .typing
                    .start_typing(
                        &conversation_id,
                        session.identity.user_id,
                        &session.identity.public_id,
                        self.typing_ttl,
                    )
                    .await;
                self.broadcast_typing(&conversation_id, snapshot).await;
            }
            ClientFrame::TypingStop { conversation_id } => {
                if !self.typing_allowed(session, &conversation_id).await {
                    self.reply_not_joined(session, &conversation_id).await;
                    return;
                }
                let snapshot = self
                    .typing
                    .stop_typing(&conversation_id, session.identity.user_id)
                    .await;
                self.broadcast_typing(&conversation_id, snapshot).await;
            }
            ClientFrame::GetOnlineUsers => {
                let online = self.presence.online_users().await;
                self.reply(session, ServerFrame::online_users(online)).await;
            }
        }
    }

    /// Report a frame that failed to parse at the transport boundary. The
    /// connection stays open.
    pub async fn reject_invalid(&self, session: &ClientSession, reason: impl Into<String>) {
        self.reply(session, RealtimeError::validation(reason).to_frame())
            .await;
    }

    /// Tear a session down: unregister, presence accounting, typing
    /// cleanup. The steps are independent; a failure in one is logged and
    /// never stops the rest. Calling this after an eviction (or a racing
    /// second close) is safe because `unregister` hands out the joined set
    /// exactly once.
    pub async fn close_session(&self, session: ClientSession) {
        let Some(closed) = self.registry.unregister(&session.handle).await else {
            debug!(
                connection_id = %session.handle.connection_id,
                "session already closed"
            );
            return;
        };

        if let PresenceChange::WentOffline { last_seen } =
            self.presence.mark_disconnected(closed.user_id).await
        {
            self.broadcast_presence(
                closed.user_id,
                &session.identity.public_id,
                false,
                Some(last_seen),
            )
            .await;
        }

        for conversation_id in &closed.joined {
            self.clear_typing_unless_other_device(closed.user_id, conversation_id)
                .await;
        }

        info!(
            user = %session.identity.public_id,
            connection_id = %session.handle.connection_id,
            "realtime session closed"
        );
    }

    /// Cut a user's live subscriptions to a conversation after their
    /// membership was revoked, so fan-out never reaches a non-member. The
    /// connections themselves stay open for other conversations.
    pub async fn revoke_subscriptions(&self, conversation_id: &str, user_id: i64) {
        if self.registry.expel_user(conversation_id, user_id).await {
            debug!(conversation_id, user_id, "expelled revoked participant");
            let targets = vec![conversation_id.to_string()];
            let changed = self.typing.clear_user(user_id, &targets).await;
            self.broadcast_typing_changes(changed).await;
        }
    }

    async fn join_conversation(&self, session: &mut ClientSession, conversation_id: &str) {
        let allowed = match self
            .authorizer
            .can_join(conversation_id, session.identity.user_id)
            .await
        {
            Ok(allowed) => allowed,
            Err(err) => {
                warn!(conversation_id, error = %err, "membership read failed");
                self.reply(session, RealtimeError::from(err).to_frame()).await;
                return;
            }
        };

        if !allowed {
            debug!(
                user = %session.identity.public_id,
                conversation_id,
                "join refused"
            );
            let refusal =
                RealtimeError::authorization(conversation_id, "not a participant in this conversation");
            self.reply(session, refusal.to_frame()).await;
            return;
        }

        if let Err(err) = self.registry.join(&session.handle, conversation_id).await {
            debug!(error = %err, "join skipped, connection gone");
            return;
        }
        session.joined.insert(conversation_id.to_string());
        self.reply(session, ServerFrame::ack("join", Some(conversation_id.to_string())))
            .await;
    }

    async fn send_message(&self, session: &mut ClientSession, conversation_id: &str, content: String) {
        if !session.joined.contains(conversation_id) {
            self.reply_not_joined(session, conversation_id).await;
            return;
        }

        if content.is_empty() {
            self.reply(
                session,
                RealtimeError::validation("message content is empty").to_frame(),
            )
            .await;
            return;
        }
        if content.len() > MAX_MESSAGE_BYTES {
            self.reply(
                session,
                RealtimeError::validation("message content exceeds 4096 bytes").to_frame(),
            )
            .await;
            return;
        }

        // Membership may have been revoked since the join; re-read before
        // every write.
        match self
            .authorizer
            .can_join(conversation_id, session.identity.user_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let refusal = RealtimeError::authorization(
                    conversation_id,
                    "no longer a participant in this conversation",
                );
                self.reply(session, refusal.to_frame()).await;
                return;
            }
            Err(err) => {
                warn!(conversation_id, error = %err, "membership read failed");
                self.reply(session, RealtimeError::from(err).to_frame()).await;
                return;
            }
        }

        // Single logical writer per conversation: the lock spans persist
        // and fan-out, so delivery order equals persisted order.
        let _writer = self.writers.shard(conversation_id).lock().await;

        let draft = MessageDraft {
            conversation_id: conversation_id.to_string(),
            sender_id: session.identity.user_id,
            content: content.clone(),
        };
        let stored = match self.store.save(draft).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(conversation_id, error = %err, "message persist failed, fan-out skipped");
                self.reply(
                    session,
                    RealtimeError::persistence("message could not be stored").to_frame(),
                )
                .await;
                return;
            }
        };

        let broadcast = ServerFrame::NewMessage(MessageBroadcast {
            id: stored.public_id.clone(),
            conversation_id: conversation_id.to_string(),
            sender_id: session.identity.public_id.clone(),
            sender_name: session.identity.display_name.clone(),
            content,
            status: stored.status,
            created_at: stored.created_at.to_rfc3339(),
        });
        let outcome = self
            .registry
            .broadcast(conversation_id, &broadcast, Some(&session.handle))
            .await;
        self.evict_dropped(outcome).await;

        self.reply(
            session,
            ServerFrame::message_ack(conversation_id.to_string(), stored.public_id),
        )
        .await;
    }

    /// Queue a frame to the session's own connection, evicting it when its
    /// queue is gone or full.
    async fn reply(&self, session: &ClientSession, frame: ServerFrame) {
        if !self.registry.send_to(&session.handle, frame).await {
            debug!(
                user = %session.identity.public_id,
                connection_id = %session.handle.connection_id,
                "reply undeliverable, evicting connection"
            );
            self.registry.evict(&session.handle).await;
        }
    }

    async fn reply_not_joined(&self, session: &ClientSession, conversation_id: &str) {
        let refusal =
            RealtimeError::authorization(conversation_id, "not joined to this conversation");
        self.reply(session, refusal.to_frame()).await;
    }

    /// The session's local mirror lags a revocation; the registry does not.
    /// Typing updates need both to agree before anything is broadcast.
    async fn typing_allowed(&self, session: &ClientSession, conversation_id: &str) -> bool {
        session.joined.contains(conversation_id)
            && self
                .registry
                .is_user_joined(session.identity.user_id, conversation_id)
                .await
    }

    async fn broadcast_typing(&self, conversation_id: &str, user_ids: Vec<String>) {
        let frame = ServerFrame::typing_update(conversation_id.to_string(), user_ids);
        let outcome = self.registry.broadcast(conversation_id, &frame, None).await;
        self.evict_dropped(outcome).await;
    }

    async fn broadcast_typing_changes(&self, changed: Vec<(String, Vec<String>)>) {
        for (conversation_id, user_ids) in changed {
            self.broadcast_typing(&conversation_id, user_ids).await;
        }
    }

    /// Typing entries are keyed by user, not connection; clear them only
    /// when no other device of the same user is still subscribed.
    async fn clear_typing_unless_other_device(&self, user_id: i64, conversation_id: &str) {
        if self.registry.is_user_joined(user_id, conversation_id).await {
            return;
        }
        let targets = vec![conversation_id.to_string()];
        let changed = self.typing.clear_user(user_id, &targets).await;
        self.broadcast_typing_changes(changed).await;
    }

    async fn broadcast_presence(
        &self,
        user_id: i64,
        public_id: &str,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) {
        let conversations = match self
            .authorizer
            .directory()
            .conversations_for_user(user_id)
            .await
        {
            Ok(conversations) => conversations,
            Err(err) => {
                warn!(
                    user = public_id,
                    error = %err,
                    "presence broadcast skipped, directory unavailable"
                );
                return;
            }
        };

        let frame = ServerFrame::presence_update(
            public_id.to_string(),
            online,
            last_seen.map(|ts| ts.to_rfc3339()),
        );
        for conversation_id in conversations {
            let outcome = self.registry.broadcast(&conversation_id, &frame, None).await;
            self.evict_dropped(outcome).await;
        }
    }

    async fn evict_dropped(&self, outcome: BroadcastOutcome) {
        for handle in outcome.dropped {
            self.registry.evict(&handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::frames::MessagePayload;
    use crate::ports::{ParticipantRole, StoredMessage};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::advance;

    const TTL: Duration = Duration::from_secs(6);

    #[derive(Clone, Default)]
    struct MockVerifier {
        identities: Arc<StdMutex<HashMap<String, Identity>>>,
    }

    impl MockVerifier {
        fn insert(&self, token: &str, user_id: i64, public_id: &str, display_name: &str) {
            self.identities.lock().unwrap().insert(
                token.to_string(),
                Identity {
                    user_id,
                    public_id: public_id.to_string(),
                    display_name: display_name.to_string(),
                },
            );
        }
    }

    impl IdentityVerifier for MockVerifier {
        async fn verify(&self, token: &str) -> Result<Option<Identity>, StoreError> {
            Ok(self.identities.lock().unwrap().get(token).cloned())
        }
    }

    #[derive(Clone, Default)]
    struct MockDirectory {
        members: Arc<StdMutex<HashMap<String, HashMap<i64, ParticipantRole>>>>,
        fail_reads: Arc<AtomicBool>,
    }

    impl MockDirectory {
        fn add_member(&self, conversation_id: &str, user_id: i64, role: ParticipantRole) {
            self.members
                .lock()
                .unwrap()
                .entry(conversation_id.to_string())
                .or_default()
                .insert(user_id, role);
        }

        fn remove_member(&self, conversation_id: &str, user_id: i64) {
            if let Some(members) = self.members.lock().unwrap().get_mut(conversation_id) {
                members.remove(&user_id);
            }
        }
    }

    impl ParticipantDirectory for MockDirectory {
        async fn membership(
            &self,
            conversation_id: &str,
            user_id: i64,
        ) -> Result<Option<ParticipantRole>, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("directory offline".to_string()));
            }
            Ok(self
                .members
                .lock()
                .unwrap()
                .get(conversation_id)
                .and_then(|members| members.get(&user_id))
                .copied())
        }

        async fn conversations_for_user(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("directory offline".to_string()));
            }
            let mut conversations: Vec<String> = self
                .members
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, members)| members.contains_key(&user_id))
                .map(|(conversation_id, _)| conversation_id.clone())
                .collect();
            conversations.sort();
            Ok(conversations)
        }
    }

    #[derive(Clone, Default)]
    struct MockStore {
        saved: Arc<StdMutex<Vec<MessageDraft>>>,
        fail_next: Arc<AtomicBool>,
    }

    impl MessageStore for MockStore {
        async fn save(&self, draft: MessageDraft) -> Result<StoredMessage, StoreError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("insert failed".to_string()));
            }
            let mut saved = self.saved.lock().unwrap();
            saved.push(draft);
            Ok(StoredMessage {
                public_id: format!("m_{}", saved.len()),
                status: "sent".to_string(),
                created_at: Utc::now(),
            })
        }
    }

    struct Rig {
        router: MessageRouter<MockVerifier, MockDirectory, MockStore>,
        directory: MockDirectory,
        store: MockStore,
        registry: Arc<ConnectionRegistry>,
        typing: Arc<TypingIndicatorStore>,
    }

    fn rig() -> Rig {
        let verifier = MockVerifier::default();
        verifier.insert("tok_a", 1, "u_a", "Ada");
        verifier.insert("tok_b", 2, "u_b", "Ben");
        verifier.insert("tok_c", 3, "u_c", "Cleo");

        let directory = MockDirectory::default();
        directory.add_member("c_help", 1, ParticipantRole::Admin);
        directory.add_member("c_help", 2, ParticipantRole::Member);

        let store = MockStore::default();
        let registry = Arc::new(ConnectionRegistry::new());
        let typing = Arc::new(TypingIndicatorStore::new());

        let router = MessageRouter::new(
            verifier,
            directory.clone(),
            store.clone(),
            registry.clone(),
            Arc::new(PresenceTracker::new()),
            typing.clone(),
            TTL,
        );

        Rig {
            router,
            directory,
            store,
            registry,
            typing,
        }
    }

    async fn connect(
        rig: &Rig,
        token: &str,
        target: Option<&str>,
    ) -> (ClientSession, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let session = rig
            .router
            .open_session(token, target, tx)
            .await
            .expect("session should open");
        (session, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn send_frame(conversation_id: &str, content: &str) -> ClientFrame {
        ClientFrame::SendMessage {
            conversation_id: conversation_id.to_string(),
            payload: MessagePayload {
                content: content.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn invalid_token_is_fatal() {
        let rig = rig();
        let (tx, _rx) = mpsc::channel(16);

        let err = rig
            .router
            .open_session("tok_unknown", Some("c_help"), tx)
            .await
            .expect_err("unknown token must be rejected");
        assert!(err.is_fatal());
        assert_eq!(err.wire_code(), "AUTH_FAILED");
    }

    #[tokio::test]
    async fn message_fans_out_to_other_members_only() {
        let rig = rig();
        let (mut a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        let (_b, mut rx_b) = connect(&rig, "tok_b", Some("c_help")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        rig.router
            .handle_frame(&mut a, send_frame("c_help", "need a hand moving"))
            .await;

        let frames_b = drain(&mut rx_b);
        match &frames_b[..] {
            [ServerFrame::NewMessage(message)] => {
                assert_eq!(message.conversation_id, "c_help");
                assert_eq!(message.sender_id, "u_a");
                assert_eq!(message.sender_name, "Ada");
                assert_eq!(message.content, "need a hand moving");
                assert_eq!(message.id, "m_1");
            }
            other => panic!("unexpected frames: {other:?}"),
        }

        // The sender gets an ack carrying the persisted id, never its own
        // broadcast.
        let frames_a = drain(&mut rx_a);
        match &frames_a[..] {
            [ServerFrame::Ack(ack)] => {
                assert_eq!(ack.op, "send_message");
                assert_eq!(ack.message_id.as_deref(), Some("m_1"));
            }
            other => panic!("unexpected frames: {other:?}"),
        }

        assert_eq!(rig.store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_member_join_is_refused_and_receives_nothing() {
        let rig = rig();
        let (mut a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        let (_c, mut rx_c) = connect(&rig, "tok_c", Some("c_help")).await;
        drain(&mut rx_a);

        let frames_c = drain(&mut rx_c);
        match &frames_c[..] {
            [ServerFrame::Error(error)] => {
                assert_eq!(error.code, "ACCESS_DENIED");
                assert_eq!(error.conversation_id.as_deref(), Some("c_help"));
            }
            other => panic!("unexpected frames: {other:?}"),
        }

        rig.router
            .handle_frame(&mut a, send_frame("c_help", "members only"))
            .await;
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn revoked_member_send_is_denied_before_persist() {
        let rig = rig();
        let (mut b, mut rx_b) = connect(&rig, "tok_b", Some("c_help")).await;
        drain(&mut rx_b);

        rig.directory.remove_member("c_help", 2);
        rig.router
            .handle_frame(&mut b, send_frame("c_help", "am I still in?"))
            .await;

        let frames = drain(&mut rx_b);
        match &frames[..] {
            [ServerFrame::Error(error)] => assert_eq!(error.code, "ACCESS_DENIED"),
            other => panic!("unexpected frames: {other:?}"),
        }
        assert!(rig.store.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_reaches_only_the_sender() {
        let rig = rig();
        let (mut a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        let (_b, mut rx_b) = connect(&rig, "tok_b", Some("c_help")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        rig.store.fail_next.store(true, Ordering::SeqCst);
        rig.router
            .handle_frame(&mut a, send_frame("c_help", "this will not stick"))
            .await;

        let frames_a = drain(&mut rx_a);
        match &frames_a[..] {
            [ServerFrame::Error(error)] => assert_eq!(error.code, "PERSISTENCE_FAILED"),
            other => panic!("unexpected frames: {other:?}"),
        }
        // Fan-out is skipped entirely, never partially.
        assert!(drain(&mut rx_b).is_empty());
        assert!(rig.store.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_and_oversized_content_are_invalid() {
        let rig = rig();
        let (mut a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        drain(&mut rx_a);

        rig.router.handle_frame(&mut a, send_frame("c_help", "")).await;
        let oversized = "x".repeat(MAX_MESSAGE_BYTES + 1);
        rig.router
            .handle_frame(&mut a, send_frame("c_help", &oversized))
            .await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 2);
        for frame in frames {
            match frame {
                ServerFrame::Error(error) => assert_eq!(error.code, "INVALID_FRAME"),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(rig.store.saved.lock().unwrap().is_empty());

        // The connection survives and can still send.
        rig.router
            .handle_frame(&mut a, send_frame("c_help", "still here"))
            .await;
        assert_eq!(rig.store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_updates_broadcast_and_expire() {
        let rig = rig();
        let (_a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        let (mut b, mut rx_b) = connect(&rig, "tok_b", Some("c_help")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        rig.router
            .handle_frame(
                &mut b,
                ClientFrame::TypingStart {
                    conversation_id: "c_help".to_string(),
                },
            )
            .await;

        for rx in [&mut rx_a, &mut rx_b] {
            match &drain(rx)[..] {
                [ServerFrame::TypingUpdate(update)] => {
                    assert_eq!(update.user_ids, vec!["u_b".to_string()]);
                }
                other => panic!("unexpected frames: {other:?}"),
            }
        }

        advance(TTL + Duration::from_secs(1)).await;
        assert!(rig.typing.snapshot("c_help").await.is_empty());
    }

    #[tokio::test]
    async fn leave_acks_and_clears_typing() {
        let rig = rig();
        let (_a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        let (mut b, mut rx_b) = connect(&rig, "tok_b", Some("c_help")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        rig.router
            .handle_frame(
                &mut b,
                ClientFrame::TypingStart {
                    conversation_id: "c_help".to_string(),
                },
            )
            .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        rig.router
            .handle_frame(
                &mut b,
                ClientFrame::Leave {
                    conversation_id: "c_help".to_string(),
                },
            )
            .await;

        // The remaining member sees the indicator clear.
        match &drain(&mut rx_a)[..] {
            [ServerFrame::TypingUpdate(update)] => assert!(update.user_ids.is_empty()),
            other => panic!("unexpected frames: {other:?}"),
        }
        match &drain(&mut rx_b)[..] {
            [ServerFrame::Ack(ack)] => assert_eq!(ack.op, "leave"),
            other => panic!("unexpected frames: {other:?}"),
        }

        assert!(!b.is_joined("c_help"));
    }

    #[tokio::test]
    async fn leave_without_join_is_denied() {
        let rig = rig();
        let (mut a, mut rx_a) = connect(&rig, "tok_a", None).await;
        drain(&mut rx_a);

        rig.router
            .handle_frame(
                &mut a,
                ClientFrame::Leave {
                    conversation_id: "c_help".to_string(),
                },
            )
            .await;

        match &drain(&mut rx_a)[..] {
            [ServerFrame::Error(error)] => assert_eq!(error.code, "ACCESS_DENIED"),
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn presence_transitions_fire_once_per_user() {
        let rig = rig();
        let (_a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        drain(&mut rx_a);

        // First device: one online broadcast to the conversation.
        let (phone, mut rx_phone) = connect(&rig, "tok_b", Some("c_help")).await;
        let (laptop, _rx_laptop) = connect(&rig, "tok_b", None).await;

        let online: Vec<_> = drain(&mut rx_a)
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::PresenceUpdate(update) => Some(update),
                _ => None,
            })
            .collect();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].user_id, "u_b");
        assert!(online[0].online);

        // Closing one of two devices is not an offline transition.
        rig.router.close_session(phone).await;
        drain(&mut rx_phone);
        assert!(drain(&mut rx_a)
            .iter()
            .all(|frame| !matches!(frame, ServerFrame::PresenceUpdate(_))));

        // Closing the last one is.
        rig.router.close_session(laptop).await;
        let offline: Vec<_> = drain(&mut rx_a)
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::PresenceUpdate(update) => Some(update),
                _ => None,
            })
            .collect();
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].user_id, "u_b");
        assert!(!offline[0].online);
        assert!(offline[0].last_seen.is_some());
    }

    #[tokio::test]
    async fn get_online_users_replies_to_the_asker_only() {
        let rig = rig();
        let (_a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        let (mut b, mut rx_b) = connect(&rig, "tok_b", Some("c_help")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        rig.router
            .handle_frame(&mut b, ClientFrame::GetOnlineUsers)
            .await;

        match &drain(&mut rx_b)[..] {
            [ServerFrame::Ack(ack)] => {
                assert_eq!(ack.op, "get_online_users");
                assert_eq!(
                    ack.online_users.as_deref(),
                    Some(&["u_a".to_string(), "u_b".to_string()][..])
                );
            }
            other => panic!("unexpected frames: {other:?}"),
        }
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_then_cleaned_up_once() {
        let rig = rig();
        let (mut a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        drain(&mut rx_a);

        // A queue of one: the join ack is drained, then one broadcast fills
        // it and the next one overflows.
        let (tx_b, mut rx_b) = mpsc::channel(1);
        let b = rig
            .router
            .open_session("tok_b", Some("c_help"), tx_b)
            .await
            .expect("session should open");
        drain(&mut rx_b);
        drain(&mut rx_a);

        rig.router
            .handle_frame(&mut a, send_frame("c_help", "first"))
            .await;
        rig.router
            .handle_frame(&mut a, send_frame("c_help", "second"))
            .await;

        let delivered = drain(&mut rx_b);
        assert_eq!(delivered.len(), 1);
        assert!(!rig.registry.is_user_joined(2, "c_help").await);
        assert_eq!(rig.store.saved.lock().unwrap().len(), 2);

        // The victim's socket unwinds through the normal close path and the
        // cleanup still runs exactly once.
        rig.router.close_session(b).await;
        let offline: Vec<_> = drain(&mut rx_a)
            .into_iter()
            .filter(|frame| matches!(frame, ServerFrame::PresenceUpdate(_)))
            .collect();
        assert_eq!(offline.len(), 1);
    }

    #[tokio::test]
    async fn directory_outage_on_join_is_reported_not_fatal() {
        let rig = rig();
        rig.directory.fail_reads.store(true, Ordering::SeqCst);

        let (mut a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        match &drain(&mut rx_a)[..] {
            [ServerFrame::Error(error)] => assert_eq!(error.code, "PERSISTENCE_FAILED"),
            other => panic!("unexpected frames: {other:?}"),
        }

        // Once the directory recovers the same connection can join.
        rig.directory.fail_reads.store(false, Ordering::SeqCst);
        rig.router
            .handle_frame(
                &mut a,
                ClientFrame::Join {
                    conversation_id: "c_help".to_string(),
                },
            )
            .await;
        match &drain(&mut rx_a)[..] {
            [ServerFrame::Ack(ack)] => assert_eq!(ack.op, "join"),
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[tokio::test]
    async fn revocation_expels_live_subscriptions() {
        let rig = rig();
        let (mut a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        let (_b, mut rx_b) = connect(&rig, "tok_b", Some("c_help")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        rig.directory.remove_member("c_help", 2);
        rig.router.revoke_subscriptions("c_help", 2).await;

        rig.router
            .handle_frame(&mut a, send_frame("c_help", "members only"))
            .await;
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn typing_after_revocation_is_refused() {
        let rig = rig();
        let (_a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        let (mut b, mut rx_b) = connect(&rig, "tok_b", Some("c_help")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        rig.directory.remove_member("c_help", 2);
        rig.router.revoke_subscriptions("c_help", 2).await;
        drain(&mut rx_a);

        // The session's own joined set still lists the conversation here.
        rig.router
            .handle_frame(
                &mut b,
                ClientFrame::TypingStart {
                    conversation_id: "c_help".to_string(),
                },
            )
            .await;

        match &drain(&mut rx_b)[..] {
            [ServerFrame::Error(error)] => assert_eq!(error.code, "ACCESS_DENIED"),
            other => panic!("unexpected frames: {other:?}"),
        }
        assert!(drain(&mut rx_a).is_empty());
        assert!(rig.typing.snapshot("c_help").await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_sends_deliver_in_persisted_order() {
        let rig = rig();
        let (mut a, mut rx_a) = connect(&rig, "tok_a", Some("c_help")).await;
        let (mut b, mut rx_b) = connect(&rig, "tok_b", Some("c_help")).await;
        let (_o, mut rx_o) = {
            rig.directory.add_member("c_help", 3, ParticipantRole::Member);
            connect(&rig, "tok_c", Some("c_help")).await
        };
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_o);

        tokio::join!(
            rig.router.handle_frame(&mut a, send_frame("c_help", "from a")),
            rig.router.handle_frame(&mut b, send_frame("c_help", "from b")),
        );

        let persisted: Vec<String> = rig
            .store
            .saved
            .lock()
            .unwrap()
            .iter()
            .map(|draft| draft.content.clone())
            .collect();
        let observed: Vec<String> = drain(&mut rx_o)
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::NewMessage(message) => Some(message.content),
                _ => None,
            })
            .collect();

        assert_eq!(persisted.len(), 2);
        assert_eq!(observed, persisted);
    }
}
