pub mod repository;
pub mod types;

pub use repository::{AttributeRepository, SqliteAttributeRepository};
pub use types::{AttributeDefinition, AttributeId, AttributeName, MISSING_ATTRIBUTE_NAME};
