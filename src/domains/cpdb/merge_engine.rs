use crate::domains::cpdb::types::{AttributeWrite, MergeOptions, MergeOutcome, MergeSummary};
use crate::errors::{DbError, DomainError, DomainResult};
use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::fmt::Display;

/// One side-to-side copy. The merge loop is the same for both directions;
/// only record loading, matching, creation and value writes differ.
#[async_trait]
pub trait MergeDirection: Send + Sync {
    /// Identifies a source record
    type Key: Display + Send + Sync;
    type Source: Send + Sync;
    /// Handle of the destination record
    type Destination: Send + Sync;

    fn name(&self) -> &'static str;

    async fn load_source_with_tx<'t>(
        &self,
        key: &Self::Key,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Self::Source>>;

    /// Policy says the source must not be copied
    fn is_blocked(&self, source: &Self::Source) -> bool;

    async fn find_counterpart_with_tx<'t>(
        &self,
        source: &Self::Source,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Self::Destination>>;

    /// Create the destination record with its standard fields and link it to the source
    async fn create_destination_with_tx<'t>(
        &self,
        source: &Self::Source,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Self::Destination>;

    /// Returns whether a value was written
    async fn write_attribute_with_tx<'t>(
        &self,
        source: &Self::Source,
        destination: &Self::Destination,
        write: &AttributeWrite,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool>;
}

/// Runs a direction over a batch, one transaction per record
pub struct MergeEngine {
    pool: SqlitePool,
}

impl MergeEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn merge<D: MergeDirection>(
        &self,
        direction: &D,
        keys: &[D::Key],
        writes: &[AttributeWrite],
        options: &MergeOptions,
    ) -> DomainResult<MergeSummary> {
        let mut summary = MergeSummary::for_options(options);

        for key in keys {
            let mut tx = self.pool.begin().await.map_err(DbError::from)?;

            match self.merge_one(direction, key, writes, options, &mut tx).await {
                Ok(outcome) => match tx.commit().await {
                    Ok(()) => match outcome {
                        MergeOutcome::Created => summary.created_count += 1,
                        MergeOutcome::Duplicate => summary.duplicate_count += 1,
                        MergeOutcome::Skipped => summary.skipped_count += 1,
                    },
                    Err(e) => {
                        log::error!("{}: commit failed for {}: {}", direction.name(), key, e);
                        summary.failed_count += 1;
                    }
                },
                Err(e) => {
                    let _ = tx.rollback().await;
                    log::warn!("{}: {} rolled back: {}", direction.name(), key, e);
                    summary.failed_count += 1;
                }
            }
        }

        log::info!(
            "{}: created {}, duplicates {}, skipped {}, failed {}",
            direction.name(),
            summary.created_count,
            summary.duplicate_count,
            summary.skipped_count,
            summary.failed_count
        );
        Ok(summary)
    }

    async fn merge_one<'t, D: MergeDirection>(
        &self,
        direction: &D,
        key: &D::Key,
        writes: &[AttributeWrite],
        options: &MergeOptions,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<MergeOutcome> {
        let source = direction
            .load_source_with_tx(key, tx)
            .await?
            .ok_or_else(|| DomainError::EntityNotFound(direction.name().to_string(), key.to_string()))?;

        if direction.is_blocked(&source) {
            log::debug!("{}: {} is blacklisted, skipped", direction.name(), key);
            return Ok(MergeOutcome::Skipped);
        }

        if let Some(destination) = direction.find_counterpart_with_tx(&source, tx).await? {
            for write in writes.iter().filter(|w| w.applies_to_duplicate(options)) {
                Self::write(direction, &source, &destination, write, tx).await?;
            }
            return Ok(MergeOutcome::Duplicate);
        }

        let destination = direction.create_destination_with_tx(&source, tx).await?;
        for write in writes {
            Self::write(direction, &source, &destination, write, tx).await?;
        }
        Ok(MergeOutcome::Created)
    }

    async fn write<'t, D: MergeDirection>(
        direction: &D,
        source: &D::Source,
        destination: &D::Destination,
        write: &AttributeWrite,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        direction
            .write_attribute_with_tx(source, destination, write, tx)
            .await
            .map_err(|e| DomainError::attribute_copy_failed(&write.token_field, e))
    }
}
