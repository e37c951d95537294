//! Connection and fan-out core for the realtime gateway.
//!
//! Everything here is transport-agnostic: the gateway owns the sockets and
//! feeds parsed frames in, this crate decides who is allowed to do what,
//! which queues each frame lands on, and what presence and typing state
//! the rest of the system observes. Storage and identity live behind the
//! [`ports`] traits so the server can wire in SQLite-backed services while
//! tests use in-memory fakes.

pub mod authorizer;
pub mod error;
pub mod frames;
pub mod ports;
pub mod presence;
pub mod registry;
pub mod router;
pub mod typing;

pub use authorizer::ConversationAuthorizer;
pub use error::{codes, RealtimeError, StoreError};
pub use frames::{ClientFrame, MessagePayload, ServerFrame};
pub use ports::{
    Identity, IdentityVerifier, MessageDraft, MessageStore, ParticipantDirectory, ParticipantRole,
    StoredMessage,
};
pub use presence::{PresenceChange, PresenceTracker};
pub use registry::{BroadcastOutcome, ConnectionHandle, ConnectionRegistry};
pub use router::{ClientSession, MessageRouter};
pub use typing::{run_typing_sweeper, SweeperHandle, TypingIndicatorStore};
