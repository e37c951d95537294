//! Conversation, participant and message storage for the LendAHand
//! backend.
//!
//! Repositories own the SQL, services compose them and implement the
//! storage-facing ports of `lendahand-realtime`.

pub mod entities;
pub mod error;
pub mod repositories;
pub mod services;

pub use entities::{Conversation, Message, MessageStatus, MessageView, Participant};
pub use error::{ConversationError, ConversationResult};
pub use repositories::{ConversationRepository, MessageRepository, ParticipantRepository};
pub use services::{MessageService, ParticipantService, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
