pub mod message_service;
pub mod participant_service;

pub use message_service::{MessageService, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use participant_service::ParticipantService;
