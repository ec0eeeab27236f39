use crate::auth::AuthContext;
use crate::domains::cpdb::duplicate_detector::{DuplicateDetector, Identity};
use crate::domains::cpdb::merge_engine::MergeDirection;
use crate::domains::cpdb::types::AttributeWrite;
use crate::domains::cpdb::value_propagator::ValuePropagator;
use crate::domains::participant::repository::ParticipantRepository;
use crate::domains::participant::types::{NewParticipant, Participant};
use crate::domains::survey::{NewTokenRecord, SurveyRepository, TokenRecord, TokenRowRef};
use crate::errors::DomainResult;
use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};
use std::sync::Arc;
use uuid::Uuid;

/// Central participants into a survey's token table
pub struct CentralToSurvey {
    pub survey_id: i64,
    pub block_blacklisted: bool,
    pub participant_repo: Arc<dyn ParticipantRepository>,
    pub survey_repo: Arc<dyn SurveyRepository>,
    pub detector: Arc<DuplicateDetector>,
    pub propagator: Arc<ValuePropagator>,
}

#[async_trait]
impl MergeDirection for CentralToSurvey {
    type Key = String;
    type Source = Participant;
    /// Token id
    type Destination = i64;

    fn name(&self) -> &'static str {
        "central_to_survey"
    }

    async fn load_source_with_tx<'t>(
        &self,
        key: &String,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Participant>> {
        self.participant_repo.find_optional_with_tx(key, tx).await
    }

    fn is_blocked(&self, source: &Participant) -> bool {
        self.block_blacklisted && source.blacklisted
    }

    async fn find_counterpart_with_tx<'t>(
        &self,
        source: &Participant,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<i64>> {
        let token = self
            .detector
            .find_token_counterpart_with_tx(self.survey_id, &Identity::from(source), tx)
            .await?;
        Ok(token.map(|t| t.tid))
    }

    async fn create_destination_with_tx<'t>(
        &self,
        source: &Participant,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<i64> {
        let token = NewTokenRecord {
            participant_id: Some(source.participant_id.clone()),
            firstname: source.firstname.clone(),
            lastname: source.lastname.clone(),
            email: source.email.clone(),
            language: source.language.clone(),
            token: None,
        };
        let tid = self.survey_repo.insert_token_with_tx(self.survey_id, &token, tx).await?;
        self.survey_repo
            .create_survey_link_with_tx(&source.participant_id, tid, self.survey_id, tx)
            .await?;
        log::debug!(
            "Added participant {} to survey {} as token {}",
            source.participant_id,
            self.survey_id,
            tid
        );
        Ok(tid)
    }

    async fn write_attribute_with_tx<'t>(
        &self,
        source: &Participant,
        destination: &i64,
        write: &AttributeWrite,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        self.propagator
            .copy_to_token_with_tx(
                self.survey_id,
                &source.participant_id,
                &write.attribute_id,
                &write.token_field,
                &TokenRowRef::Token(*destination),
                tx,
            )
            .await
    }
}

/// Survey token rows into the central participant table
pub struct SurveyToCentral {
    pub survey_id: i64,
    /// Owner of created participants
    pub auth: AuthContext,
    pub participant_repo: Arc<dyn ParticipantRepository>,
    pub survey_repo: Arc<dyn SurveyRepository>,
    pub detector: Arc<DuplicateDetector>,
    pub propagator: Arc<ValuePropagator>,
}

#[async_trait]
impl MergeDirection for SurveyToCentral {
    /// Token id
    type Key = i64;
    type Source = TokenRecord;
    /// Participant id
    type Destination = String;

    fn name(&self) -> &'static str {
        "survey_to_central"
    }

    async fn load_source_with_tx<'t>(
        &self,
        key: &i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<TokenRecord>> {
        self.survey_repo.find_token_with_tx(self.survey_id, *key, tx).await
    }

    // Token rows carry no blacklist flag
    fn is_blocked(&self, _source: &TokenRecord) -> bool {
        false
    }

    async fn find_counterpart_with_tx<'t>(
        &self,
        source: &TokenRecord,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<String>> {
        let participant = self
            .detector
            .find_participant_counterpart_with_tx(&Identity::from(source), tx)
            .await?;
        Ok(participant.map(|p| p.participant_id))
    }

    async fn create_destination_with_tx<'t>(
        &self,
        source: &TokenRecord,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<String> {
        let participant_id = source
            .participant_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let new_participant = NewParticipant {
            participant_id: Some(participant_id),
            firstname: source.firstname.clone(),
            lastname: source.lastname.clone(),
            email: source.email.clone(),
            language: source.language.clone(),
            blacklisted: Some("N".to_string()),
            owner_uid: None,
        };
        let participant = self
            .participant_repo
            .create_with_tx(&new_participant, &self.auth, tx)
            .await?;

        self.survey_repo
            .set_token_participant_with_tx(self.survey_id, source.tid, &participant.participant_id, tx)
            .await?;
        self.survey_repo
            .create_survey_link_with_tx(&participant.participant_id, source.tid, self.survey_id, tx)
            .await?;
        log::debug!(
            "Created participant {} from token {} of survey {}",
            participant.participant_id,
            source.tid,
            self.survey_id
        );
        Ok(participant.participant_id)
    }

    async fn write_attribute_with_tx<'t>(
        &self,
        source: &TokenRecord,
        destination: &String,
        write: &AttributeWrite,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        self.propagator
            .copy_to_central_with_tx(
                self.survey_id,
                &TokenRowRef::Token(source.tid),
                destination,
                &write.attribute_id,
                &write.token_field,
                tx,
            )
            .await
    }
}
