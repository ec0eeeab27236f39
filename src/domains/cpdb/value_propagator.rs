use crate::domains::attribute::{AttributeId, AttributeRepository};
use crate::domains::core::identifiers::quote_identifier;
use crate::domains::survey::{SurveyRepository, TokenRowRef};
use crate::errors::{DbError, DomainResult};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;

/// Copies a single (participant, attribute) value between the central table and a token row
pub struct ValuePropagator {
    pool: SqlitePool,
    attribute_repo: Arc<dyn AttributeRepository>,
    survey_repo: Arc<dyn SurveyRepository>,
}

impl ValuePropagator {
    pub fn new(
        pool: SqlitePool,
        attribute_repo: Arc<dyn AttributeRepository>,
        survey_repo: Arc<dyn SurveyRepository>,
    ) -> Self {
        Self {
            pool,
            attribute_repo,
            survey_repo,
        }
    }

    /// Copy a central attribute value into the token row linked to `participant_id`.
    ///
    /// Returns whether a value was written; a missing central value is not an error.
    pub async fn copy_value(
        &self,
        survey_id: i64,
        participant_id: &str,
        attribute_id: &str,
        destination_field: &str,
    ) -> DomainResult<bool> {
        let attribute_id = AttributeId::parse(attribute_id)?;
        quote_identifier(destination_field)?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let row = TokenRowRef::Participant(participant_id.to_string());
        match self
            .write_token_value_with_tx(survey_id, participant_id, attribute_id, destination_field, &row, &mut tx)
            .await
        {
            Ok(written) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(written)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Copy a token field of the row linked to `participant_id` into the central attribute table
    pub async fn copy_value_to_central(
        &self,
        survey_id: i64,
        participant_id: &str,
        attribute_id: &str,
        token_field: &str,
    ) -> DomainResult<bool> {
        let attribute_id = AttributeId::parse(attribute_id)?;
        quote_identifier(token_field)?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let row = TokenRowRef::Participant(participant_id.to_string());
        match self
            .write_central_value_with_tx(survey_id, &row, participant_id, attribute_id, token_field, &mut tx)
            .await
        {
            Ok(written) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(written)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Central -> token inside a caller's transaction; `attribute_id` is validated before any read
    pub async fn copy_to_token_with_tx<'t>(
        &self,
        survey_id: i64,
        participant_id: &str,
        attribute_id: &str,
        destination_field: &str,
        row: &TokenRowRef,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        let attribute_id = AttributeId::parse(attribute_id)?;
        self.write_token_value_with_tx(survey_id, participant_id, attribute_id, destination_field, row, tx)
            .await
    }

    /// Token -> central inside a caller's transaction
    pub async fn copy_to_central_with_tx<'t>(
        &self,
        survey_id: i64,
        row: &TokenRowRef,
        participant_id: &str,
        attribute_id: &str,
        token_field: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        let attribute_id = AttributeId::parse(attribute_id)?;
        self.write_central_value_with_tx(survey_id, row, participant_id, attribute_id, token_field, tx)
            .await
    }

    async fn write_token_value_with_tx<'t>(
        &self,
        survey_id: i64,
        participant_id: &str,
        attribute_id: AttributeId,
        destination_field: &str,
        row: &TokenRowRef,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        let value = match self
            .attribute_repo
            .find_value_with_tx(participant_id, attribute_id, tx)
            .await?
        {
            Some(value) => value,
            None => return Ok(false),
        };

        // Blind update: a row that does not exist is simply not touched
        self.survey_repo
            .update_token_field_with_tx(survey_id, row, destination_field, &value, tx)
            .await?;
        Ok(true)
    }

    async fn write_central_value_with_tx<'t>(
        &self,
        survey_id: i64,
        row: &TokenRowRef,
        participant_id: &str,
        attribute_id: AttributeId,
        token_field: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        let value = match self
            .survey_repo
            .read_token_field_with_tx(survey_id, row, token_field, tx)
            .await?
        {
            Some(value) if !value.is_empty() => value,
            _ => return Ok(false),
        };

        if self
            .attribute_repo
            .value_exists_with_tx(participant_id, attribute_id, tx)
            .await?
        {
            self.attribute_repo
                .update_value_with_tx(participant_id, attribute_id, &value, tx)
                .await?;
        } else {
            self.attribute_repo
                .insert_value_with_tx(participant_id, attribute_id, &value, tx)
                .await?;
        }
        Ok(true)
    }
}
