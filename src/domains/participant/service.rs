use crate::auth::AuthContext;
use crate::domains::core::repository::{BatchDeleteResult, FindById};
use crate::domains::participant::repository::ParticipantRepository;
use crate::domains::participant::types::{
    NewParticipant, OwnedParticipant, Participant, ParticipantListEntry, ParticipantListQuery, SharedParticipant,
    UpdateParticipant,
};
use crate::domains::permission::{GlobalPermission, PermissionAction, PermissionService, SurveyResource};
use crate::domains::search::SearchExpression;
use crate::domains::settings::CpdbSettings;
use crate::domains::survey::SurveyRepository;
use crate::errors::{DbError, DomainError, ServiceError, ServiceResult};
use crate::types::{PaginatedResult, PaginationParams};
use crate::validation::Validate;
use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;

/// How far a participant delete reaches into survey tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteScope {
    Participants,
    Tokens,
    TokensAndResponses,
}

/// Trait defining participant service operations
#[async_trait]
pub trait ParticipantService: Send + Sync {
    async fn insert_participant(&self, new_participant: NewParticipant, auth: &AuthContext) -> ServiceResult<Participant>;

    async fn update_row(
        &self,
        participant_id: &str,
        update: UpdateParticipant,
        auth: &AuthContext,
    ) -> ServiceResult<Participant>;

    async fn get_participant(&self, participant_id: &str, auth: &AuthContext) -> ServiceResult<Participant>;

    async fn check_for_duplicate(&self, firstname: &str, lastname: &str, email: &str) -> ServiceResult<Option<String>>;

    async fn get_participants_owner(&self, auth: &AuthContext) -> ServiceResult<Vec<OwnedParticipant>>;

    async fn count_participants_owner(&self, auth: &AuthContext) -> ServiceResult<i64>;

    async fn count_all(&self, auth: &AuthContext) -> ServiceResult<i64>;

    async fn count_shared_by_owner(&self, auth: &AuthContext) -> ServiceResult<i64>;

    async fn get_participant_shared(&self, owner_uid: i64, auth: &AuthContext) -> ServiceResult<Vec<SharedParticipant>>;

    async fn get_participant_shared_all(&self, auth: &AuthContext) -> ServiceResult<Vec<SharedParticipant>>;

    /// Share with a user, or with everyone when `share_uid` is 0
    async fn share_participant(
        &self,
        participant_id: &str,
        share_uid: i64,
        can_edit: bool,
        auth: &AuthContext,
    ) -> ServiceResult<()>;

    async fn get_survey_count(&self, participant_id: &str) -> ServiceResult<i64>;

    async fn is_owner(&self, participant_id: &str, auth: &AuthContext) -> ServiceResult<bool>;

    /// Non-superadmins keep only the ids they own
    async fn filter_participant_ids(&self, ids: &[String], auth: &AuthContext) -> ServiceResult<Vec<String>>;

    async fn delete_participants(
        &self,
        ids: &[String],
        filter: bool,
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<BatchDeleteResult>;

    async fn delete_participant_tokens(
        &self,
        ids: &[String],
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<BatchDeleteResult>;

    async fn delete_participant_tokens_and_responses(
        &self,
        ids: &[String],
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<BatchDeleteResult>;

    async fn list_participants(
        &self,
        search: Option<&str>,
        attribute_ids: &[i64],
        params: PaginationParams,
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<PaginatedResult<ParticipantListEntry>>;

    async fn count_participants(
        &self,
        search: Option<&str>,
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<i64>;
}

/// Implementation of the participant service
#[derive(Clone)]
pub struct ParticipantServiceImpl {
    pool: SqlitePool,
    repo: Arc<dyn ParticipantRepository>,
    survey_repo: Arc<dyn SurveyRepository>,
    permission_service: Arc<dyn PermissionService>,
}

impl ParticipantServiceImpl {
    pub fn new(
        pool: SqlitePool,
        repo: Arc<dyn ParticipantRepository>,
        survey_repo: Arc<dyn SurveyRepository>,
        permission_service: Arc<dyn PermissionService>,
    ) -> Self {
        Self {
            pool,
            repo,
            survey_repo,
            permission_service,
        }
    }

    async fn require_global(
        &self,
        auth: &AuthContext,
        permission: GlobalPermission,
        action: PermissionAction,
    ) -> ServiceResult<()> {
        if self.permission_service.has_global_permission(auth, permission, action).await? {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(format!(
                "User {} lacks {} permission on {}",
                auth.user_id,
                action.as_str(),
                permission.as_str()
            )))
        }
    }

    fn list_query(
        &self,
        search: Option<&str>,
        attribute_ids: &[i64],
        settings: &CpdbSettings,
        superadmin: bool,
        auth: &AuthContext,
    ) -> ServiceResult<ParticipantListQuery> {
        let search = match search.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(SearchExpression::parse(raw)?),
            None => None,
        };
        Ok(ParticipantListQuery {
            search,
            attribute_ids: attribute_ids.to_vec(),
            visible_to: if superadmin { None } else { Some(auth.user_id) },
            hide_blacklisted: settings.hide_blacklisted,
        })
    }

    async fn delete_family(
        &self,
        ids: &[String],
        filter: bool,
        scope: DeleteScope,
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<BatchDeleteResult> {
        self.require_global(auth, GlobalPermission::ParticipantPanel, PermissionAction::Delete)
            .await?;

        let mut unique: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids {
            if !id.is_empty() && !unique.contains(id) {
                unique.push(id.clone());
            }
        }

        let mut result = BatchDeleteResult::new(ids.len());
        let targets = if filter {
            let kept = self.filter_participant_ids(&unique, auth).await?;
            result.filtered_out = unique.iter().filter(|id| !kept.contains(id)).cloned().collect();
            kept
        } else {
            unique
        };

        for chunk in targets.chunks(settings.delete_chunk_size.max(1)) {
            let mut tx = self.pool.begin().await.map_err(DbError::from)?;
            match self.delete_chunk_with_tx(chunk, scope, auth, &mut tx).await {
                Ok(chunk_result) => {
                    tx.commit().await.map_err(DbError::from)?;
                    result.absorb(chunk_result);
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    log::error!("Participant delete chunk rolled back: {}", e);
                    return Err(e);
                }
            }
        }

        log::info!(
            "User {} deleted {} participant(s), {} token(s), {} response(s)",
            auth.user_id,
            result.deleted_participants,
            result.deleted_tokens,
            result.deleted_responses
        );
        Ok(result)
    }

    async fn delete_chunk_with_tx<'t>(
        &self,
        chunk: &[String],
        scope: DeleteScope,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> ServiceResult<BatchDeleteResult> {
        let mut deleted_tokens = 0;
        let mut deleted_responses = 0;

        if scope != DeleteScope::Participants {
            for survey_id in self.survey_repo.linked_survey_ids_with_tx(chunk, tx).await? {
                if !self.survey_repo.token_table_exists(survey_id).await? {
                    continue;
                }

                if scope == DeleteScope::TokensAndResponses
                    && self.survey_repo.response_table_exists(survey_id).await?
                    && self
                        .permission_service
                        .has_survey_permission(auth, survey_id, SurveyResource::Responses, PermissionAction::Delete)
                        .await?
                {
                    let tokens = self.survey_repo.token_strings_with_tx(survey_id, chunk, tx).await?;
                    deleted_responses += self
                        .survey_repo
                        .delete_responses_by_token_with_tx(survey_id, &tokens, tx)
                        .await?;
                }

                if self
                    .permission_service
                    .has_survey_permission(auth, survey_id, SurveyResource::Tokens, PermissionAction::Delete)
                    .await?
                {
                    deleted_tokens += self
                        .survey_repo
                        .delete_tokens_by_participant_with_tx(survey_id, chunk, tx)
                        .await?;
                } else {
                    log::debug!("User {} may not delete tokens of survey {}", auth.user_id, survey_id);
                }
            }
        }

        let mut chunk_result = self.repo.delete_with_tx(chunk, tx).await?;
        chunk_result.deleted_tokens = deleted_tokens;
        chunk_result.deleted_responses = deleted_responses;
        Ok(chunk_result)
    }
}

#[async_trait]
impl ParticipantService for ParticipantServiceImpl {
    async fn insert_participant(&self, new_participant: NewParticipant, auth: &AuthContext) -> ServiceResult<Participant> {
        self.require_global(auth, GlobalPermission::ParticipantPanel, PermissionAction::Create)
            .await?;
        new_participant.validate()?;

        let created = self.repo.create(&new_participant, auth).await?;
        log::info!("User {} created participant {}", auth.user_id, created.participant_id);
        Ok(created)
    }

    async fn update_row(
        &self,
        participant_id: &str,
        update: UpdateParticipant,
        auth: &AuthContext,
    ) -> ServiceResult<Participant> {
        if !self.is_owner(participant_id, auth).await? {
            return Err(ServiceError::PermissionDenied(format!(
                "User {} cannot edit participant {}",
                auth.user_id, participant_id
            )));
        }
        update.validate()?;
        Ok(self.repo.update_row(participant_id, &update).await?)
    }

    async fn get_participant(&self, participant_id: &str, auth: &AuthContext) -> ServiceResult<Participant> {
        if !self.is_owner(participant_id, auth).await? {
            // Hide existence from users who may not see it
            return Err(ServiceError::Domain(DomainError::EntityNotFound(
                "Participant".to_string(),
                participant_id.to_string(),
            )));
        }
        Ok(self.repo.find_by_id(participant_id).await?)
    }

    async fn check_for_duplicate(&self, firstname: &str, lastname: &str, email: &str) -> ServiceResult<Option<String>> {
        Ok(self.repo.check_for_duplicate(firstname, lastname, email).await?)
    }

    async fn get_participants_owner(&self, auth: &AuthContext) -> ServiceResult<Vec<OwnedParticipant>> {
        Ok(self.repo.get_participants_owner(auth.user_id).await?)
    }

    async fn count_participants_owner(&self, auth: &AuthContext) -> ServiceResult<i64> {
        Ok(self.repo.count_participants_owner(auth.user_id).await?)
    }

    async fn count_all(&self, auth: &AuthContext) -> ServiceResult<i64> {
        if !self.permission_service.is_superadmin(auth).await? {
            return Err(ServiceError::PermissionDenied("Counting all participants requires superadmin".to_string()));
        }
        Ok(self.repo.count_all().await?)
    }

    async fn count_shared_by_owner(&self, auth: &AuthContext) -> ServiceResult<i64> {
        Ok(self.repo.count_shared_by_owner(auth.user_id).await?)
    }

    async fn get_participant_shared(&self, owner_uid: i64, auth: &AuthContext) -> ServiceResult<Vec<SharedParticipant>> {
        if owner_uid != auth.user_id && !self.permission_service.is_superadmin(auth).await? {
            return Err(ServiceError::PermissionDenied(
                "You do not have permission to access this resource".to_string(),
            ));
        }
        Ok(self.repo.get_participant_shared(owner_uid).await?)
    }

    async fn get_participant_shared_all(&self, auth: &AuthContext) -> ServiceResult<Vec<SharedParticipant>> {
        if !self.permission_service.is_superadmin(auth).await? {
            return Err(ServiceError::PermissionDenied("Listing all shares requires superadmin".to_string()));
        }
        Ok(self.repo.get_participant_shared_all().await?)
    }

    async fn share_participant(
        &self,
        participant_id: &str,
        share_uid: i64,
        can_edit: bool,
        auth: &AuthContext,
    ) -> ServiceResult<()> {
        let participant = self.repo.find_by_id(participant_id).await?;
        if participant.owner_uid != auth.user_id && !self.permission_service.is_superadmin(auth).await? {
            return Err(ServiceError::PermissionDenied(format!(
                "Only the owner can share participant {}",
                participant_id
            )));
        }
        self.repo.add_share(participant_id, share_uid, can_edit).await?;
        log::debug!("Participant {} shared with {} (edit: {})", participant_id, share_uid, can_edit);
        Ok(())
    }

    async fn get_survey_count(&self, participant_id: &str) -> ServiceResult<i64> {
        Ok(self.repo.get_survey_count(participant_id).await?)
    }

    async fn is_owner(&self, participant_id: &str, auth: &AuthContext) -> ServiceResult<bool> {
        if self.permission_service.is_superadmin(auth).await? {
            return Ok(true);
        }
        Ok(self.repo.is_owned_or_shared(auth.user_id, participant_id).await?)
    }

    async fn filter_participant_ids(&self, ids: &[String], auth: &AuthContext) -> ServiceResult<Vec<String>> {
        if self.permission_service.is_superadmin(auth).await? {
            return Ok(ids.to_vec());
        }
        Ok(self.repo.filter_owned_ids(auth.user_id, ids).await?)
    }

    async fn delete_participants(
        &self,
        ids: &[String],
        filter: bool,
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<BatchDeleteResult> {
        self.delete_family(ids, filter, DeleteScope::Participants, settings, auth).await
    }

    async fn delete_participant_tokens(
        &self,
        ids: &[String],
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<BatchDeleteResult> {
        self.delete_family(ids, true, DeleteScope::Tokens, settings, auth).await
    }

    async fn delete_participant_tokens_and_responses(
        &self,
        ids: &[String],
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<BatchDeleteResult> {
        self.delete_family(ids, true, DeleteScope::TokensAndResponses, settings, auth).await
    }

    async fn list_participants(
        &self,
        search: Option<&str>,
        attribute_ids: &[i64],
        params: PaginationParams,
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<PaginatedResult<ParticipantListEntry>> {
        let superadmin = self.permission_service.is_superadmin(auth).await?;
        let query = self.list_query(search, attribute_ids, settings, superadmin, auth)?;

        let total = self.repo.count(&query).await?;
        let items = self.repo.list(&query, Some(params)).await?;
        Ok(PaginatedResult::new(items, total.max(0) as u64, params))
    }

    async fn count_participants(
        &self,
        search: Option<&str>,
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<i64> {
        let superadmin = self.permission_service.is_superadmin(auth).await?;
        let query = self.list_query(search, &[], settings, superadmin, auth)?;
        Ok(self.repo.count(&query).await?)
    }
}
