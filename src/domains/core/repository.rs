use crate::errors::DomainResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Trait for finding entities by ID
#[async_trait]
pub trait FindById<T, K: ?Sized + Sync> {
    /// Find an entity by ID
    async fn find_by_id(&self, id: &K) -> DomainResult<T>;
}

/// Outcome of a chunked delete across participants and their survey records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDeleteResult {
    /// Ids handed in by the caller
    pub requested: usize,

    /// Ids dropped before deleting because the user does not own them
    pub filtered_out: Vec<String>,

    pub deleted_participants: u64,
    pub deleted_links: u64,
    pub deleted_attribute_values: u64,
    pub deleted_tokens: u64,
    pub deleted_responses: u64,
}

impl BatchDeleteResult {
    pub fn new(requested: usize) -> Self {
        Self {
            requested,
            ..Default::default()
        }
    }

    /// Fold the counts of one chunk into the running total
    pub fn absorb(&mut self, chunk: BatchDeleteResult) {
        self.filtered_out.extend(chunk.filtered_out);
        self.deleted_participants += chunk.deleted_participants;
        self.deleted_links += chunk.deleted_links;
        self.deleted_attribute_values += chunk.deleted_attribute_values;
        self.deleted_tokens += chunk.deleted_tokens;
        self.deleted_responses += chunk.deleted_responses;
    }
}
