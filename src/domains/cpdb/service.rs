use crate::auth::AuthContext;
use crate::domains::attribute::{AttributeDefinition, AttributeId, AttributeRepository, SqliteAttributeRepository};
use crate::domains::core::identifiers::quote_identifier;
use crate::domains::cpdb::directions::{CentralToSurvey, SurveyToCentral};
use crate::domains::cpdb::duplicate_detector::DuplicateDetector;
use crate::domains::cpdb::merge_engine::MergeEngine;
use crate::domains::cpdb::provisioner::AttributeProvisioner;
use crate::domains::cpdb::schema_inspector::SchemaInspector;
use crate::domains::cpdb::types::{
    AttributeWrite, MappedAttribute, MappingKind, MergeOptions, MergeSummary, ProvisionedAttribute,
};
use crate::domains::cpdb::value_propagator::ValuePropagator;
use crate::domains::participant::repository::{ParticipantRepository, SqliteParticipantRepository};
use crate::domains::participant::service::{ParticipantService, ParticipantServiceImpl};
use crate::domains::permission::{
    GlobalPermission, PermissionAction, PermissionService, SqlitePermissionService, SurveyResource,
};
use crate::domains::settings::CpdbSettings;
use crate::domains::survey::types::is_standard_token_column;
use crate::domains::survey::{SqliteSurveyRepository, SurveyRepository, TokenFieldDescription};
use crate::errors::{DomainError, ServiceError, ServiceResult};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Copy and mapping operations between the central participant table and survey token tables
#[async_trait]
pub trait CpdbService: Send + Sync {
    /// Copy central participants into a survey's token table.
    ///
    /// `new_attributes` are central attribute ids that get a fresh `attribute_<id>` column;
    /// `mapped` pairs existing token columns with central attributes.
    async fn copy_participants_to_survey(
        &self,
        survey_id: i64,
        participant_ids: &[String],
        mapped: &[MappedAttribute],
        new_attributes: &[String],
        options: MergeOptions,
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<MergeSummary>;

    /// Copy token rows into the central table.
    ///
    /// `to_create` maps token fields to the display name of a central attribute created for them.
    async fn copy_tokens_to_central(
        &self,
        survey_id: i64,
        token_ids: &[i64],
        to_create: &BTreeMap<String, String>,
        mapped: &[MappedAttribute],
        options: MergeOptions,
        auth: &AuthContext,
    ) -> ServiceResult<MergeSummary>;

    /// Tag (token field, attribute id) pairs using the survey's stored automap
    async fn classify_mappings(
        &self,
        survey_id: i64,
        pairs: &[(String, String)],
    ) -> ServiceResult<Vec<MappedAttribute>>;

    async fn load_automap(&self, survey_id: i64) -> ServiceResult<Vec<MappedAttribute>>;

    async fn copy_value(
        &self,
        survey_id: i64,
        participant_id: &str,
        attribute_id: &str,
        destination_field: &str,
        auth: &AuthContext,
    ) -> ServiceResult<bool>;

    async fn list_attribute_columns(&self, survey_id: i64, auth: &AuthContext) -> ServiceResult<BTreeMap<usize, String>>;

    async fn list_attribute_definitions(&self) -> ServiceResult<Vec<AttributeDefinition>>;

    async fn provision_columns(
        &self,
        survey_id: i64,
        attribute_ids: &[String],
        auth: &AuthContext,
    ) -> ServiceResult<Vec<ProvisionedAttribute>>;
}

pub struct CpdbServiceImpl {
    survey_repo: Arc<dyn SurveyRepository>,
    permission_service: Arc<dyn PermissionService>,
    participant_repo: Arc<dyn ParticipantRepository>,
    inspector: Arc<SchemaInspector>,
    provisioner: Arc<AttributeProvisioner>,
    detector: Arc<DuplicateDetector>,
    propagator: Arc<ValuePropagator>,
    engine: MergeEngine,
}

impl CpdbServiceImpl {
    pub fn new(
        pool: SqlitePool,
        participant_repo: Arc<dyn ParticipantRepository>,
        survey_repo: Arc<dyn SurveyRepository>,
        attribute_repo: Arc<dyn AttributeRepository>,
        permission_service: Arc<dyn PermissionService>,
    ) -> Self {
        let inspector = Arc::new(SchemaInspector::new(survey_repo.clone(), attribute_repo.clone()));
        let provisioner = Arc::new(AttributeProvisioner::new(
            pool.clone(),
            survey_repo.clone(),
            attribute_repo.clone(),
            inspector.clone(),
        ));
        let detector = Arc::new(DuplicateDetector::new(participant_repo.clone(), survey_repo.clone()));
        let propagator = Arc::new(ValuePropagator::new(pool.clone(), attribute_repo, survey_repo.clone()));

        Self {
            survey_repo,
            permission_service,
            participant_repo,
            inspector,
            provisioner,
            detector,
            propagator,
            engine: MergeEngine::new(pool),
        }
    }

    async fn require_survey(
        &self,
        auth: &AuthContext,
        survey_id: i64,
        resource: SurveyResource,
        action: PermissionAction,
    ) -> ServiceResult<()> {
        if self
            .permission_service
            .has_survey_permission(auth, survey_id, resource, action)
            .await?
        {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(format!(
                "User {} lacks {} permission on {} of survey {}",
                auth.user_id,
                action.as_str(),
                resource.as_str(),
                survey_id
            )))
        }
    }

    async fn require_token_table(&self, survey_id: i64) -> ServiceResult<()> {
        if self.survey_repo.token_table_exists(survey_id).await? {
            Ok(())
        } else {
            Err(DomainError::EntityNotFound("Token table".to_string(), survey_id.to_string()).into())
        }
    }

    /// Fail before any write when a named token column is unsafe or absent
    async fn require_columns(&self, survey_id: i64, fields: &[&str]) -> ServiceResult<()> {
        for field in fields {
            quote_identifier(field)?;
            if !self.inspector.has_column(survey_id, field).await? {
                return Err(DomainError::EntityNotFound("Token column".to_string(), field.to_string()).into());
            }
        }
        Ok(())
    }

    /// Record `cpdbmap` on each field so later merges classify it as automatic
    async fn persist_automap(&self, survey_id: i64, pairs: &[(String, AttributeId)]) -> ServiceResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }

        let mut descriptions = self.survey_repo.load_field_descriptions(survey_id).await?;
        for (field, attribute_id) in pairs {
            descriptions
                .entry(field.clone())
                .or_insert_with(|| TokenFieldDescription::new(field))
                .cpdbmap = Some(attribute_id.to_string());
        }
        self.survey_repo.save_field_descriptions(survey_id, &descriptions).await?;

        log::info!("Stored automap for {} field(s) of survey {}", pairs.len(), survey_id);
        Ok(())
    }

    /// Fields touched by this call that can be auto-applied later
    fn automap_pairs(provisioned: &[ProvisionedAttribute], mapped: &[MappedAttribute]) -> Vec<(String, AttributeId)> {
        let mut pairs: Vec<(String, AttributeId)> = provisioned
            .iter()
            .map(|attribute| (attribute.token_field.clone(), attribute.attribute_id))
            .collect();

        for attribute in mapped.iter().filter(|a| a.kind != MappingKind::Standard) {
            match AttributeId::parse(&attribute.attribute_id) {
                Ok(id) => pairs.push((attribute.token_field.clone(), id)),
                Err(_) => log::debug!("Not storing automap for {}: invalid attribute id", attribute.token_field),
            }
        }
        pairs
    }

    fn writes(provisioned: &[ProvisionedAttribute], mapped: &[MappedAttribute]) -> Vec<AttributeWrite> {
        provisioned
            .iter()
            .map(AttributeWrite::from_provisioned)
            .chain(mapped.iter().map(AttributeWrite::from_mapped))
            .collect()
    }
}

#[async_trait]
impl CpdbService for CpdbServiceImpl {
    async fn copy_participants_to_survey(
        &self,
        survey_id: i64,
        participant_ids: &[String],
        mapped: &[MappedAttribute],
        new_attributes: &[String],
        options: MergeOptions,
        settings: &CpdbSettings,
        auth: &AuthContext,
    ) -> ServiceResult<MergeSummary> {
        self.require_survey(auth, survey_id, SurveyResource::Tokens, PermissionAction::Create)
            .await?;
        self.require_token_table(survey_id).await?;

        let new_ids = new_attributes
            .iter()
            .map(|raw| AttributeId::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        // Columns created by this call do not exist yet, everything else must
        let pending: Vec<String> = new_ids.iter().map(AttributeId::column_name).collect();
        let existing: Vec<&str> = mapped
            .iter()
            .map(|a| a.token_field.as_str())
            .filter(|field| !pending.iter().any(|column| column == field))
            .collect();
        self.require_columns(survey_id, &existing).await?;

        let provisioned = self
            .provisioner
            .provision_columns(survey_id, &new_ids, &auth.language)
            .await?;

        let direction = CentralToSurvey {
            survey_id,
            block_blacklisted: settings.block_adding_to_surveys,
            participant_repo: self.participant_repo.clone(),
            survey_repo: self.survey_repo.clone(),
            detector: self.detector.clone(),
            propagator: self.propagator.clone(),
        };
        let writes = Self::writes(&provisioned, mapped);
        let summary = self
            .engine
            .merge(&direction, participant_ids, &writes, &options)
            .await?;

        if options.create_automap {
            self.persist_automap(survey_id, &Self::automap_pairs(&provisioned, mapped))
                .await?;
        }
        Ok(summary)
    }

    async fn copy_tokens_to_central(
        &self,
        survey_id: i64,
        token_ids: &[i64],
        to_create: &BTreeMap<String, String>,
        mapped: &[MappedAttribute],
        options: MergeOptions,
        auth: &AuthContext,
    ) -> ServiceResult<MergeSummary> {
        if !self
            .permission_service
            .has_global_permission(auth, GlobalPermission::ParticipantPanel, PermissionAction::Create)
            .await?
        {
            return Err(ServiceError::PermissionDenied(format!(
                "User {} may not create central participants",
                auth.user_id
            )));
        }
        self.require_survey(auth, survey_id, SurveyResource::Tokens, PermissionAction::Read)
            .await?;
        self.require_token_table(survey_id).await?;
        let fields: Vec<&str> = to_create
            .keys()
            .map(String::as_str)
            .chain(mapped.iter().map(|a| a.token_field.as_str()))
            .collect();
        self.require_columns(survey_id, &fields).await?;

        let provisioned = self
            .provisioner
            .provision_definitions(to_create, &auth.language)
            .await?;

        let direction = SurveyToCentral {
            survey_id,
            auth: auth.clone(),
            participant_repo: self.participant_repo.clone(),
            survey_repo: self.survey_repo.clone(),
            detector: self.detector.clone(),
            propagator: self.propagator.clone(),
        };
        let writes = Self::writes(&provisioned, mapped);
        let summary = self.engine.merge(&direction, token_ids, &writes, &options).await?;

        if options.create_automap {
            self.persist_automap(survey_id, &Self::automap_pairs(&provisioned, mapped))
                .await?;
        }
        Ok(summary)
    }

    async fn classify_mappings(
        &self,
        survey_id: i64,
        pairs: &[(String, String)],
    ) -> ServiceResult<Vec<MappedAttribute>> {
        let descriptions = self.survey_repo.load_field_descriptions(survey_id).await?;

        Ok(pairs
            .iter()
            .map(|(field, attribute_id)| {
                let stored = descriptions
                    .get(field)
                    .and_then(|d| d.cpdbmap.as_deref())
                    .and_then(|raw| AttributeId::parse(raw).ok());
                let kind = if is_standard_token_column(field) {
                    MappingKind::Standard
                } else if stored.is_some() && stored == AttributeId::parse(attribute_id).ok() {
                    MappingKind::Automatic
                } else {
                    MappingKind::Manual
                };
                MappedAttribute::new(field, attribute_id, kind)
            })
            .collect())
    }

    async fn load_automap(&self, survey_id: i64) -> ServiceResult<Vec<MappedAttribute>> {
        let descriptions = self.survey_repo.load_field_descriptions(survey_id).await?;
        Ok(descriptions
            .iter()
            .filter_map(|(field, description)| {
                description
                    .cpdbmap
                    .as_deref()
                    .map(|attribute_id| MappedAttribute::new(field, attribute_id, MappingKind::Automatic))
            })
            .collect())
    }

    async fn copy_value(
        &self,
        survey_id: i64,
        participant_id: &str,
        attribute_id: &str,
        destination_field: &str,
        auth: &AuthContext,
    ) -> ServiceResult<bool> {
        self.require_survey(auth, survey_id, SurveyResource::Tokens, PermissionAction::Update)
            .await?;
        Ok(self
            .propagator
            .copy_value(survey_id, participant_id, attribute_id, destination_field)
            .await?)
    }

    async fn list_attribute_columns(&self, survey_id: i64, auth: &AuthContext) -> ServiceResult<BTreeMap<usize, String>> {
        self.require_survey(auth, survey_id, SurveyResource::Tokens, PermissionAction::Read)
            .await?;
        Ok(self.inspector.list_attribute_columns(survey_id).await?)
    }

    async fn list_attribute_definitions(&self) -> ServiceResult<Vec<AttributeDefinition>> {
        Ok(self.inspector.list_definitions().await?)
    }

    async fn provision_columns(
        &self,
        survey_id: i64,
        attribute_ids: &[String],
        auth: &AuthContext,
    ) -> ServiceResult<Vec<ProvisionedAttribute>> {
        self.require_survey(auth, survey_id, SurveyResource::Tokens, PermissionAction::Create)
            .await?;
        self.require_token_table(survey_id).await?;

        let ids = attribute_ids
            .iter()
            .map(|raw| AttributeId::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self
            .provisioner
            .provision_columns(survey_id, &ids, &auth.language)
            .await?)
    }
}

/// Everything a host needs, wired over one pool
pub struct CpdbServices {
    pub settings: CpdbSettings,
    pub permissions: Arc<dyn PermissionService>,
    pub participants: Arc<dyn ParticipantService>,
    pub cpdb: Arc<dyn CpdbService>,
    pub participant_repo: Arc<dyn ParticipantRepository>,
    pub attribute_repo: Arc<dyn AttributeRepository>,
    pub survey_repo: Arc<dyn SurveyRepository>,
}

impl CpdbServices {
    pub fn new(pool: SqlitePool, settings: CpdbSettings) -> Self {
        let participant_repo: Arc<dyn ParticipantRepository> =
            Arc::new(SqliteParticipantRepository::new(pool.clone()));
        let attribute_repo: Arc<dyn AttributeRepository> = Arc::new(SqliteAttributeRepository::new(pool.clone()));
        let survey_repo: Arc<dyn SurveyRepository> = Arc::new(SqliteSurveyRepository::new(pool.clone()));
        let permissions: Arc<dyn PermissionService> = Arc::new(SqlitePermissionService::new(pool.clone()));

        let participants: Arc<dyn ParticipantService> = Arc::new(ParticipantServiceImpl::new(
            pool.clone(),
            participant_repo.clone(),
            survey_repo.clone(),
            permissions.clone(),
        ));
        let cpdb: Arc<dyn CpdbService> = Arc::new(CpdbServiceImpl::new(
            pool,
            participant_repo.clone(),
            survey_repo.clone(),
            attribute_repo.clone(),
            permissions.clone(),
        ));

        Self {
            settings,
            permissions,
            participants,
            cpdb,
            participant_repo,
            attribute_repo,
            survey_repo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::repository::FindById;
    use crate::domains::participant::types::{NewParticipant, Participant};
    use crate::domains::survey::{NewTokenRecord, TokenRowRef};
    use crate::test_support::{admin, test_pool, viewer};

    const SID: i64 = 100;

    struct Fixture {
        pool: SqlitePool,
        service: CpdbServiceImpl,
        participants: Arc<SqliteParticipantRepository>,
        surveys: Arc<SqliteSurveyRepository>,
        attributes: Arc<SqliteAttributeRepository>,
        permissions: Arc<SqlitePermissionService>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let (pool, dir) = test_pool().await;
        let participants = Arc::new(SqliteParticipantRepository::new(pool.clone()));
        let surveys = Arc::new(SqliteSurveyRepository::new(pool.clone()));
        let attributes = Arc::new(SqliteAttributeRepository::new(pool.clone()));
        let permissions = Arc::new(SqlitePermissionService::new(pool.clone()));
        surveys.create_survey(SID, "en", "Customer survey").await.unwrap();
        surveys.create_token_table(SID).await.unwrap();

        let service = CpdbServiceImpl::new(
            pool.clone(),
            participants.clone(),
            surveys.clone(),
            attributes.clone(),
            permissions.clone(),
        );
        Fixture { pool, service, participants, surveys, attributes, permissions, _dir: dir }
    }

    async fn participant(f: &Fixture, first: &str, last: &str, email: &str, blacklisted: bool) -> Participant {
        f.participants
            .create(
                &NewParticipant {
                    firstname: Some(first.to_string()),
                    lastname: Some(last.to_string()),
                    email: Some(email.to_string()),
                    blacklisted: Some(if blacklisted { "Y" } else { "N" }.to_string()),
                    ..Default::default()
                },
                &admin(),
            )
            .await
            .unwrap()
    }

    async fn definition(f: &Fixture, name: &str) -> AttributeId {
        let mut tx = f.pool.begin().await.unwrap();
        let id = f.attributes.create_definition_with_tx(name, "en", &mut tx).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    async fn set_value(f: &Fixture, participant_id: &str, attribute_id: AttributeId, value: &str) {
        let mut tx = f.pool.begin().await.unwrap();
        if f.attributes.value_exists_with_tx(participant_id, attribute_id, &mut tx).await.unwrap() {
            f.attributes.update_value_with_tx(participant_id, attribute_id, value, &mut tx).await.unwrap();
        } else {
            f.attributes.insert_value_with_tx(participant_id, attribute_id, value, &mut tx).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    async fn add_column(f: &Fixture, column: &str) {
        let mut tx = f.pool.begin().await.unwrap();
        f.surveys.add_token_column_with_tx(SID, column, &mut tx).await.unwrap();
        tx.commit().await.unwrap();
    }

    async fn copy(
        f: &Fixture,
        ids: &[String],
        mapped: &[MappedAttribute],
        new_attributes: &[String],
        options: MergeOptions,
    ) -> ServiceResult<MergeSummary> {
        f.service
            .copy_participants_to_survey(SID, ids, mapped, new_attributes, options, &CpdbSettings::default(), &admin())
            .await
    }

    #[tokio::test]
    async fn test_first_copy_creates_then_repeat_is_duplicate() {
        let f = fixture().await;
        let jason = participant(&f, "Jason", "Cleeland", "j@x.com", false).await;
        let ids = vec![jason.participant_id.clone()];

        let summary = copy(&f, &ids, &[], &[], MergeOptions::default()).await.unwrap();
        assert_eq!(
            (summary.created_count, summary.duplicate_count, summary.skipped_count),
            (1, 0, 0)
        );
        let tokens = f.surveys.list_tokens(SID).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].participant_id.as_deref(), Some(jason.participant_id.as_str()));
        assert_eq!(tokens[0].firstname.as_deref(), Some("Jason"));
        let links = f.surveys.find_links_for_survey(SID).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].token_id, tokens[0].tid);

        let again = copy(&f, &ids, &[], &[], MergeOptions::default()).await.unwrap();
        assert_eq!((again.created_count, again.duplicate_count, again.skipped_count), (0, 1, 0));
        assert_eq!(f.surveys.list_tokens(SID).await.unwrap(), tokens);
        assert_eq!(f.surveys.find_links_for_survey(SID).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blacklisted_participant_follows_block_setting() {
        let f = fixture().await;
        let banned = participant(&f, "Ban", "Ned", "b@x.com", true).await;
        let ids = vec![banned.participant_id.clone()];

        let blocking = CpdbSettings { block_adding_to_surveys: true, ..Default::default() };
        let summary = f
            .service
            .copy_participants_to_survey(SID, &ids, &[], &[], MergeOptions::default(), &blocking, &admin())
            .await
            .unwrap();
        assert_eq!(summary.skipped_count, 1);
        assert_eq!(summary.created_count, 0);
        assert!(f.surveys.list_tokens(SID).await.unwrap().is_empty());
        assert!(f.surveys.find_links_for_survey(SID).await.unwrap().is_empty());

        let summary = copy(&f, &ids, &[], &[], MergeOptions::default()).await.unwrap();
        assert_eq!(summary.created_count, 1);
    }

    #[tokio::test]
    async fn test_new_and_mapped_attributes_written_on_create() {
        let f = fixture().await;
        let gender = definition(&f, "Gender").await;
        let dept = definition(&f, "Department").await;
        add_column(&f, "attribute_dept").await;

        let ann = participant(&f, "Ann", "Lee", "a@x.com", false).await;
        set_value(&f, &ann.participant_id, gender, "f").await;
        set_value(&f, &ann.participant_id, dept, "sales").await;

        let summary = copy(
            &f,
            &[ann.participant_id.clone()],
            &[MappedAttribute::new("attribute_dept", &dept.to_string(), MappingKind::Manual)],
            &[gender.to_string()],
            MergeOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.created_count, 1);

        let token = &f.surveys.list_tokens(SID).await.unwrap()[0];
        assert_eq!(token.field(&gender.column_name()), Some("f"));
        assert_eq!(token.field("attribute_dept"), Some("sales"));

        let descriptions = f.surveys.load_field_descriptions(SID).await.unwrap();
        assert_eq!(descriptions[&gender.column_name()].description, "Gender");
        assert_eq!(descriptions[&gender.column_name()].mandatory, "N");
    }

    #[tokio::test]
    async fn test_duplicate_overwrites_follow_flags() {
        let f = fixture().await;
        let manual = definition(&f, "Team").await;
        let automatic = definition(&f, "Region").await;
        add_column(&f, "attribute_team").await;
        add_column(&f, "attribute_region").await;

        let ann = participant(&f, "Ann", "Lee", "a@x.com", false).await;
        set_value(&f, &ann.participant_id, manual, "one").await;
        set_value(&f, &ann.participant_id, automatic, "one").await;

        let mapped = vec![
            MappedAttribute::new("attribute_team", &manual.to_string(), MappingKind::Manual),
            MappedAttribute::new("attribute_region", &automatic.to_string(), MappingKind::Automatic),
        ];
        let ids = vec![ann.participant_id.clone()];
        copy(&f, &ids, &mapped, &[], MergeOptions::default()).await.unwrap();

        set_value(&f, &ann.participant_id, manual, "two").await;
        set_value(&f, &ann.participant_id, automatic, "two").await;

        let read = |f: &Fixture| {
            let surveys = f.surveys.clone();
            async move {
                let token = surveys.list_tokens(SID).await.unwrap().remove(0);
                (
                    token.field("attribute_team").map(str::to_string),
                    token.field("attribute_region").map(str::to_string),
                )
            }
        };

        let summary = copy(&f, &ids, &mapped, &[], MergeOptions::default()).await.unwrap();
        assert_eq!(summary.duplicate_count, 1);
        assert_eq!(read(&f).await, (Some("one".to_string()), Some("one".to_string())));

        let manual_only = MergeOptions { overwrite_manual: true, ..Default::default() };
        let summary = copy(&f, &ids, &mapped, &[], manual_only).await.unwrap();
        assert!(summary.overwrite_manual);
        assert_eq!(read(&f).await, (Some("two".to_string()), Some("one".to_string())));

        let automatic_only = MergeOptions { overwrite_automatic: true, ..Default::default() };
        copy(&f, &ids, &mapped, &[], automatic_only).await.unwrap();
        assert_eq!(read(&f).await, (Some("two".to_string()), Some("two".to_string())));
        assert_eq!(f.surveys.list_tokens(SID).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_participant_is_rolled_back_and_counted() {
        let f = fixture().await;
        add_column(&f, "attribute_local").await;
        let ann = participant(&f, "Ann", "Lee", "a@x.com", false).await;

        let summary = copy(
            &f,
            &[ann.participant_id.clone()],
            &[MappedAttribute::new("attribute_local", "abc", MappingKind::Manual)],
            &[],
            MergeOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.created_count, 0);
        assert!(f.surveys.list_tokens(SID).await.unwrap().is_empty());
        assert!(f.surveys.find_links_for_survey(SID).await.unwrap().is_empty());

        let summary = copy(
            &f,
            &["no-such-participant".to_string(), ann.participant_id.clone()],
            &[],
            &[],
            MergeOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.created_count, 1);
        assert_eq!(summary.processed(), 2);
    }

    #[tokio::test]
    async fn test_schema_errors_abort_before_any_write() {
        let f = fixture().await;
        let gender = definition(&f, "Gender").await;
        let ann = participant(&f, "Ann", "Lee", "a@x.com", false).await;
        let bob = participant(&f, "Bob", "Ray", "b@x.com", false).await;

        copy(&f, &[ann.participant_id.clone()], &[], &[gender.to_string()], MergeOptions::default())
            .await
            .unwrap();
        let columns_before = f.surveys.token_columns(SID).await.unwrap();

        let err = copy(&f, &[bob.participant_id.clone()], &[], &[gender.to_string()], MergeOptions::default())
            .await
            .unwrap_err();
        match err {
            ServiceError::Domain(DomainError::DuplicateAttribute(name)) => assert_eq!(name, "Gender"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(f.surveys.token_columns(SID).await.unwrap(), columns_before);
        assert_eq!(f.surveys.list_tokens(SID).await.unwrap().len(), 1);

        let err = copy(&f, &[bob.participant_id.clone()], &[], &["0".to_string()], MergeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Domain(DomainError::InvalidAttributeId(_))));

        let err = copy(
            &f,
            &[bob.participant_id.clone()],
            &[MappedAttribute::new("attribute_missing", &gender.to_string(), MappingKind::Manual)],
            &[],
            MergeOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::Domain(DomainError::EntityNotFound(_, _))));
        assert_eq!(f.surveys.list_tokens(SID).await.unwrap().len(), 1);

        let err = f
            .service
            .copy_participants_to_survey(999, &[], &[], &[], MergeOptions::default(), &CpdbSettings::default(), &admin())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Domain(DomainError::EntityNotFound(_, _))));
    }

    #[tokio::test]
    async fn test_bad_mapping_leaves_new_columns_uncreated() {
        let f = fixture().await;
        let city = definition(&f, "City").await;
        let bob = participant(&f, "Bob", "Ray", "b@x.com", false).await;
        set_value(&f, &bob.participant_id, city, "Perth").await;
        let ids = vec![bob.participant_id.clone()];
        let columns_before = f.surveys.token_columns(SID).await.unwrap();

        let err = copy(
            &f,
            &ids,
            &[MappedAttribute::new("attribute_missing", &city.to_string(), MappingKind::Manual)],
            &[city.to_string()],
            MergeOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::Domain(DomainError::EntityNotFound(_, ref field)) if field == "attribute_missing"));
        assert_eq!(f.surveys.token_columns(SID).await.unwrap(), columns_before);
        assert!(!f
            .surveys
            .load_field_descriptions(SID)
            .await
            .unwrap()
            .contains_key(&city.column_name()));
        assert!(f.surveys.list_tokens(SID).await.unwrap().is_empty());

        // A mapping onto the column this call creates is allowed
        let summary = copy(
            &f,
            &ids,
            &[MappedAttribute::new(&city.column_name(), &city.to_string(), MappingKind::Manual)],
            &[city.to_string()],
            MergeOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.created_count, 1);
        assert_eq!(f.surveys.list_tokens(SID).await.unwrap()[0].field(&city.column_name()), Some("Perth"));
    }

    #[tokio::test]
    async fn test_copy_to_survey_stores_automap_for_touched_fields() {
        let f = fixture().await;
        let dept = definition(&f, "Department").await;
        let gender = definition(&f, "Gender").await;
        let lang = definition(&f, "Preferred language").await;
        add_column(&f, "attribute_dept").await;

        let ann = participant(&f, "Ann", "Lee", "a@x.com", false).await;
        set_value(&f, &ann.participant_id, dept, "sales").await;
        set_value(&f, &ann.participant_id, gender, "f").await;
        set_value(&f, &ann.participant_id, lang, "de").await;

        let mapped = vec![
            MappedAttribute::new("attribute_dept", &dept.column_name(), MappingKind::Manual),
            MappedAttribute::new("language", &lang.to_string(), MappingKind::Standard),
        ];
        let options = MergeOptions { create_automap: true, ..Default::default() };
        let summary = copy(&f, &[ann.participant_id.clone()], &mapped, &[gender.to_string()], options)
            .await
            .unwrap();
        assert_eq!((summary.created_count, summary.failed_count), (1, 0));

        let token = &f.surveys.list_tokens(SID).await.unwrap()[0];
        assert_eq!(token.field("attribute_dept"), Some("sales"));
        assert_eq!(token.field(&gender.column_name()), Some("f"));
        assert_eq!(token.field("language"), Some("de"));

        let automap = f.service.load_automap(SID).await.unwrap();
        assert_eq!(automap.len(), 2);
        assert!(automap.iter().all(|m| m.token_field != "language"));

        let pairs = vec![
            ("attribute_dept".to_string(), dept.to_string()),
            (gender.column_name(), gender.to_string()),
            ("language".to_string(), lang.to_string()),
        ];
        let kinds: Vec<MappingKind> = f
            .service
            .classify_mappings(SID, &pairs)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(kinds, vec![MappingKind::Automatic, MappingKind::Automatic, MappingKind::Standard]);
    }

    #[tokio::test]
    async fn test_tokens_copied_to_central_with_automap() {
        let f = fixture().await;
        let dept = definition(&f, "Department").await;
        add_column(&f, "attribute_dept").await;
        add_column(&f, "attribute_floor").await;
        let ann = participant(&f, "Ann", "Lee", "a@x.com", false).await;

        let mut tx = f.pool.begin().await.unwrap();
        let ann_tid = f
            .surveys
            .insert_token_with_tx(
                SID,
                &NewTokenRecord {
                    firstname: Some("Ann".to_string()),
                    lastname: Some("Lee".to_string()),
                    email: Some("a@x.com".to_string()),
                    ..Default::default()
                },
                &mut tx,
            )
            .await
            .unwrap();
        let bob_tid = f
            .surveys
            .insert_token_with_tx(
                SID,
                &NewTokenRecord {
                    firstname: Some("Bob".to_string()),
                    lastname: Some("Ray".to_string()),
                    email: Some("b@x.com".to_string()),
                    ..Default::default()
                },
                &mut tx,
            )
            .await
            .unwrap();
        for (tid, field, value) in [
            (ann_tid, "attribute_dept", "Ops"),
            (bob_tid, "attribute_dept", "R&D"),
            (bob_tid, "attribute_floor", "3"),
        ] {
            f.surveys
                .update_token_field_with_tx(SID, &TokenRowRef::Token(tid), field, value, &mut tx)
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let to_create = BTreeMap::from([("attribute_floor".to_string(), "Floor".to_string())]);
        let mapped = vec![MappedAttribute::new("attribute_dept", &dept.to_string(), MappingKind::Manual)];
        let options = MergeOptions { create_automap: true, ..Default::default() };

        let summary = f
            .service
            .copy_tokens_to_central(SID, &[ann_tid, bob_tid], &to_create, &mapped, options, &admin())
            .await
            .unwrap();
        assert_eq!((summary.created_count, summary.duplicate_count, summary.failed_count), (1, 1, 0));

        // Duplicate with no overwrite flags keeps the central side untouched
        assert!(f.attributes.find_values(&ann.participant_id).await.unwrap().is_empty());

        let bob_token = f.surveys.find_token(SID, bob_tid).await.unwrap().unwrap();
        let bob_id = bob_token.participant_id.clone().unwrap();
        let bob = f.participants.find_by_id(&bob_id).await.unwrap();
        assert_eq!(bob.firstname.as_deref(), Some("Bob"));
        assert_eq!(bob.owner_uid, 1);
        assert!(!bob.blacklisted);

        let automap = f.service.load_automap(SID).await.unwrap();
        let floor = automap
            .iter()
            .find(|m| m.token_field == "attribute_floor")
            .map(|m| AttributeId::parse(&m.attribute_id).unwrap())
            .unwrap();
        assert!(automap.iter().all(|m| m.kind == MappingKind::Automatic));
        assert!(automap
            .iter()
            .any(|m| m.token_field == "attribute_dept" && m.attribute_id == dept.to_string()));

        let values = f.attributes.find_values(&bob_id).await.unwrap();
        assert_eq!(values.get(&dept.value()).map(String::as_str), Some("R&D"));
        assert_eq!(values.get(&floor.value()).map(String::as_str), Some("3"));

        let links = f.surveys.find_links_for_survey(SID).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].participant_id, bob_id);
    }

    #[tokio::test]
    async fn test_classify_mappings_uses_stored_automap() {
        let f = fixture().await;
        let mut descriptions = f.surveys.load_field_descriptions(SID).await.unwrap();
        let mut auto = TokenFieldDescription::new("Gender");
        auto.cpdbmap = Some("7".to_string());
        descriptions.insert("attribute_7".to_string(), auto);
        f.surveys.save_field_descriptions(SID, &descriptions).await.unwrap();

        let pairs: Vec<(String, String)> = [
            ("attribute_7", "7"),
            ("attribute_7", "8"),
            ("email", "3"),
            ("attribute_local", "4"),
        ]
        .iter()
        .map(|(field, id)| (field.to_string(), id.to_string()))
        .collect();

        let kinds: Vec<MappingKind> = f
            .service
            .classify_mappings(SID, &pairs)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![MappingKind::Automatic, MappingKind::Manual, MappingKind::Standard, MappingKind::Manual]
        );
    }

    #[tokio::test]
    async fn test_copy_requires_token_permission() {
        let f = fixture().await;
        let ann = participant(&f, "Ann", "Lee", "a@x.com", false).await;
        let ids = vec![ann.participant_id.clone()];

        let denied = f
            .service
            .copy_participants_to_survey(SID, &ids, &[], &[], MergeOptions::default(), &CpdbSettings::default(), &viewer())
            .await;
        assert!(matches!(denied, Err(ServiceError::PermissionDenied(_))));
        assert!(f.service.list_attribute_columns(SID, &viewer()).await.is_err());

        f.permissions
            .grant(3, "survey", SID, "tokens", &[PermissionAction::Create])
            .await
            .unwrap();
        let summary = f
            .service
            .copy_participants_to_survey(SID, &ids, &[], &[], MergeOptions::default(), &CpdbSettings::default(), &viewer())
            .await
            .unwrap();
        assert_eq!(summary.created_count, 1);

        let denied = f
            .service
            .copy_tokens_to_central(SID, &[], &BTreeMap::new(), &[], MergeOptions::default(), &viewer())
            .await;
        assert!(matches!(denied, Err(ServiceError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_single_value_copy_and_column_listing() {
        let f = fixture().await;
        let gender = definition(&f, "Gender").await;
        let ann = participant(&f, "Ann", "Lee", "a@x.com", false).await;
        copy(&f, &[ann.participant_id.clone()], &[], &[], MergeOptions::default()).await.unwrap();

        let provisioned = f.service.provision_columns(SID, &[gender.to_string()], &admin()).await.unwrap();
        assert_eq!(provisioned[0].token_field, gender.column_name());
        let columns = f.service.list_attribute_columns(SID, &admin()).await.unwrap();
        assert_eq!(columns.values().cloned().collect::<Vec<_>>(), vec![gender.column_name()]);
        assert_eq!(f.service.list_attribute_definitions().await.unwrap().len(), 1);

        set_value(&f, &ann.participant_id, gender, "f").await;
        assert!(f
            .service
            .copy_value(SID, &ann.participant_id, &gender.to_string(), &gender.column_name(), &admin())
            .await
            .unwrap());
        let token = f.surveys.list_tokens(SID).await.unwrap().remove(0);
        assert_eq!(token.field(&gender.column_name()), Some("f"));
    }
}
