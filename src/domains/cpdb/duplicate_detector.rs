use crate::domains::participant::repository::ParticipantRepository;
use crate::domains::participant::types::Participant;
use crate::domains::survey::{SurveyRepository, TokenRecord};
use crate::errors::DomainResult;
use sqlx::{Sqlite, Transaction};
use std::sync::Arc;

/// Identity used to find a record's counterpart on the other side.
///
/// Matching is exact: case and whitespace differences make two records distinct.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub explicit_id: Option<String>,
}

impl From<&Participant> for Identity {
    fn from(participant: &Participant) -> Self {
        Self {
            firstname: participant.firstname.clone(),
            lastname: participant.lastname.clone(),
            email: participant.email.clone(),
            explicit_id: Some(participant.participant_id.clone()),
        }
    }
}

impl From<&TokenRecord> for Identity {
    fn from(token: &TokenRecord) -> Self {
        Self {
            firstname: token.firstname.clone(),
            lastname: token.lastname.clone(),
            email: token.email.clone(),
            explicit_id: token.participant_id.clone().filter(|id| !id.is_empty()),
        }
    }
}

pub struct DuplicateDetector {
    participant_repo: Arc<dyn ParticipantRepository>,
    survey_repo: Arc<dyn SurveyRepository>,
}

impl DuplicateDetector {
    pub fn new(participant_repo: Arc<dyn ParticipantRepository>, survey_repo: Arc<dyn SurveyRepository>) -> Self {
        Self {
            participant_repo,
            survey_repo,
        }
    }

    /// Token row matching the identity, or already linked to its participant id
    pub async fn find_token_counterpart_with_tx<'t>(
        &self,
        survey_id: i64,
        identity: &Identity,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<TokenRecord>> {
        self.survey_repo
            .find_token_by_identity_with_tx(
                survey_id,
                identity.firstname.as_deref(),
                identity.lastname.as_deref(),
                identity.email.as_deref(),
                identity.explicit_id.as_deref(),
                tx,
            )
            .await
    }

    /// Central participant matching the identity, or carrying its explicit id
    pub async fn find_participant_counterpart_with_tx<'t>(
        &self,
        identity: &Identity,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Participant>> {
        self.participant_repo
            .find_by_identity_with_tx(
                identity.firstname.as_deref(),
                identity.lastname.as_deref(),
                identity.email.as_deref(),
                identity.explicit_id.as_deref(),
                tx,
            )
            .await
    }
}
