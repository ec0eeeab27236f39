pub mod repository;
pub mod service;
pub mod types;

pub use repository::{ParticipantRepository, SqliteParticipantRepository};
pub use service::{ParticipantService, ParticipantServiceImpl};
pub use types::{NewParticipant, Participant, UpdateParticipant};
