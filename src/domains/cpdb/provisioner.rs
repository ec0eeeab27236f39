use crate::domains::attribute::{AttributeId, AttributeRepository};
use crate::domains::cpdb::schema_inspector::SchemaInspector;
use crate::domains::cpdb::types::ProvisionedAttribute;
use crate::domains::core::identifiers::quote_identifier;
use crate::domains::survey::{SurveyRepository, TokenFieldDescription};
use crate::errors::{DbError, DomainError, DomainResult};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Creates token columns for central attributes and central definitions for token fields
pub struct AttributeProvisioner {
    pool: SqlitePool,
    survey_repo: Arc<dyn SurveyRepository>,
    attribute_repo: Arc<dyn AttributeRepository>,
    inspector: Arc<SchemaInspector>,
    survey_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl AttributeProvisioner {
    pub fn new(
        pool: SqlitePool,
        survey_repo: Arc<dyn SurveyRepository>,
        attribute_repo: Arc<dyn AttributeRepository>,
        inspector: Arc<SchemaInspector>,
    ) -> Self {
        Self {
            pool,
            survey_repo,
            attribute_repo,
            inspector,
            survey_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn survey_lock(&self, survey_id: i64) -> Arc<Mutex<()>> {
        self.survey_locks
            .lock()
            .await
            .entry(survey_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Add a text column `attribute_<id>` per attribute and describe it in the survey metadata.
    ///
    /// Runs the duplicate check first; if any attribute already has a column nothing is created.
    pub async fn provision_columns(
        &self,
        survey_id: i64,
        attribute_ids: &[AttributeId],
        operator_language: &str,
    ) -> DomainResult<Vec<ProvisionedAttribute>> {
        let mut requested: Vec<AttributeId> = Vec::with_capacity(attribute_ids.len());
        for id in attribute_ids {
            if !requested.contains(id) {
                requested.push(*id);
            }
        }
        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let lock = self.survey_lock(survey_id).await;
        let _guard = lock.lock().await;

        // Another call may have changed the schema while we waited
        self.inspector.invalidate(survey_id).await;
        self.inspector
            .has_duplicate_attribute(survey_id, &requested, operator_language)
            .await?;

        let survey = self.survey_repo.find_survey(survey_id).await?;

        let mut provisioned = Vec::with_capacity(requested.len());
        for id in &requested {
            let definition = self
                .attribute_repo
                .find_definition(*id)
                .await?
                .ok_or_else(|| DomainError::EntityNotFound("Attribute".to_string(), id.to_string()))?;

            let description = definition
                .display_name(&[survey.language.as_str(), operator_language])
                .unwrap_or(definition.defaultname.as_str())
                .to_string();

            provisioned.push(ProvisionedAttribute {
                token_field: id.column_name(),
                attribute_id: *id,
                description,
            });
        }

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let result = async {
            let mut descriptions = self.survey_repo.load_field_descriptions_with_tx(survey_id, &mut tx).await?;
            for attribute in &provisioned {
                self.survey_repo
                    .add_token_column_with_tx(survey_id, &attribute.token_field, &mut tx)
                    .await?;
                descriptions.insert(
                    attribute.token_field.clone(),
                    TokenFieldDescription::new(&attribute.description),
                );
            }
            self.survey_repo
                .save_field_descriptions_with_tx(survey_id, &descriptions, &mut tx)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await.map_err(DbError::from)?;
            }
            Err(e) => {
                let _ = tx.rollback().await;
                self.inspector.invalidate(survey_id).await;
                return Err(e);
            }
        }

        self.inspector.invalidate(survey_id).await;
        log::info!(
            "Provisioned {} attribute column(s) in survey {}",
            provisioned.len(),
            survey_id
        );
        Ok(provisioned)
    }

    /// Create one central definition per token field (token field -> display name)
    pub async fn provision_definitions(
        &self,
        fields: &BTreeMap<String, String>,
        operator_language: &str,
    ) -> DomainResult<Vec<ProvisionedAttribute>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        for token_field in fields.keys() {
            quote_identifier(token_field)?;
        }

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut provisioned = Vec::with_capacity(fields.len());

        for (token_field, name) in fields {
            match self
                .attribute_repo
                .create_definition_with_tx(name, operator_language, &mut tx)
                .await
            {
                Ok(attribute_id) => provisioned.push(ProvisionedAttribute {
                    token_field: token_field.clone(),
                    attribute_id,
                    description: name.clone(),
                }),
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(e);
                }
            }
        }

        tx.commit().await.map_err(DbError::from)?;
        log::info!("Created {} central attribute definition(s)", provisioned.len());
        Ok(provisioned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::attribute::SqliteAttributeRepository;
    use crate::domains::survey::SqliteSurveyRepository;
    use crate::test_support::test_pool;

    struct Fixture {
        pool: SqlitePool,
        surveys: Arc<SqliteSurveyRepository>,
        attributes: Arc<SqliteAttributeRepository>,
        inspector: Arc<SchemaInspector>,
        provisioner: AttributeProvisioner,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let (pool, dir) = test_pool().await;
        let surveys = Arc::new(SqliteSurveyRepository::new(pool.clone()));
        let attributes = Arc::new(SqliteAttributeRepository::new(pool.clone()));
        surveys.create_survey(42, "de", "Umfrage").await.unwrap();
        surveys.create_token_table(42).await.unwrap();
        let inspector = Arc::new(SchemaInspector::new(surveys.clone(), attributes.clone()));
        let provisioner = AttributeProvisioner::new(pool.clone(), surveys.clone(), attributes.clone(), inspector.clone());
        Fixture { pool, surveys, attributes, inspector, provisioner, _dir: dir }
    }

    async fn definition(f: &Fixture, name: &str, lang: &str) -> AttributeId {
        let mut tx = f.pool.begin().await.unwrap();
        let id = f.attributes.create_definition_with_tx(name, lang, &mut tx).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_provision_columns_prefers_survey_language() {
        let f = fixture().await;
        let gender = definition(&f, "Gender", "en").await;
        sqlx::query("INSERT INTO participant_attribute_names_lang (attribute_id, attribute_name, lang) VALUES (?, 'Geschlecht', 'de')")
            .bind(gender.value())
            .execute(&f.pool)
            .await
            .unwrap();
        let city = definition(&f, "City", "en").await;

        let created = f.provisioner.provision_columns(42, &[gender, city, gender], "fr").await.unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].token_field, gender.column_name());
        assert_eq!(created[0].description, "Geschlecht");
        assert_eq!(created[1].description, "City");

        let columns = f.inspector.list_attribute_columns(42).await.unwrap();
        assert_eq!(columns.len(), 2);

        let descriptions = f.surveys.load_field_descriptions(42).await.unwrap();
        let entry = &descriptions[&gender.column_name()];
        assert_eq!(entry.description, "Geschlecht");
        assert_eq!(entry.mandatory, "N");
        assert_eq!(entry.show_register, "N");
    }

    #[tokio::test]
    async fn test_duplicate_aborts_before_any_column() {
        let f = fixture().await;
        let existing = definition(&f, "Gender", "en").await;
        let fresh = definition(&f, "City", "en").await;

        let mut descriptions = crate::domains::survey::FieldDescriptions::new();
        descriptions.insert("attribute_keep".to_string(), TokenFieldDescription::new("Keep me"));
        f.surveys.save_field_descriptions(42, &descriptions).await.unwrap();

        f.provisioner.provision_columns(42, &[existing], "en").await.unwrap();
        let before = f.surveys.token_columns(42).await.unwrap();

        let err = f.provisioner.provision_columns(42, &[fresh, existing], "en").await.unwrap_err();
        assert!(matches!(err, DomainError::DuplicateAttribute(ref name) if name == "Gender"));
        assert_eq!(f.surveys.token_columns(42).await.unwrap(), before);

        let descriptions = f.surveys.load_field_descriptions(42).await.unwrap();
        assert!(descriptions.contains_key("attribute_keep"));
        assert!(!descriptions.contains_key(&fresh.column_name()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_overlapping_requests_create_once() {
        let f = fixture().await;
        let gender = definition(&f, "Gender", "en").await;
        let city = definition(&f, "City", "en").await;

        let first_request = [gender];
        let second_request = [gender, city];
        let (first, second) = tokio::join!(
            f.provisioner.provision_columns(42, &first_request, "en"),
            f.provisioner.provision_columns(42, &second_request, "en"),
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(DomainError::DuplicateAttribute(name)) if name == "Gender")));

        let columns = f.surveys.token_columns(42).await.unwrap();
        assert_eq!(columns.iter().filter(|c| **c == gender.column_name()).count(), 1);
        let descriptions = f.surveys.load_field_descriptions(42).await.unwrap();
        assert_eq!(
            descriptions.contains_key(&city.column_name()),
            columns.contains(&city.column_name())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_disjoint_requests_both_apply() {
        let f = fixture().await;
        let gender = definition(&f, "Gender", "en").await;
        let city = definition(&f, "City", "en").await;

        let first_request = [gender];
        let second_request = [city];
        let (first, second) = tokio::join!(
            f.provisioner.provision_columns(42, &first_request, "en"),
            f.provisioner.provision_columns(42, &second_request, "en"),
        );
        first.unwrap();
        second.unwrap();

        let columns = f.inspector.list_attribute_columns(42).await.unwrap();
        assert_eq!(columns.len(), 2);
        let descriptions = f.surveys.load_field_descriptions(42).await.unwrap();
        assert_eq!(descriptions[&gender.column_name()].description, "Gender");
        assert_eq!(descriptions[&city.column_name()].description, "City");
    }

    #[tokio::test]
    async fn test_unknown_attribute_creates_nothing() {
        let f = fixture().await;
        let missing = AttributeId::new(77).unwrap();
        let err = f.provisioner.provision_columns(42, &[missing], "en").await.unwrap_err();
        assert!(matches!(err, DomainError::EntityNotFound(_, _)));
        assert!(f.inspector.list_attribute_columns(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provision_definitions() {
        let f = fixture().await;
        let mut fields = BTreeMap::new();
        fields.insert("attribute_1".to_string(), "Department".to_string());
        fields.insert("attribute_2".to_string(), "Floor".to_string());

        let created = f.provisioner.provision_definitions(&fields, "de").await.unwrap();
        assert_eq!(created.len(), 2);

        let definition = f.attributes.find_definition(created[0].attribute_id).await.unwrap().unwrap();
        assert_eq!(definition.defaultname, "Department");
        assert_eq!(definition.name_in("de"), Some("Department"));

        let mut bad = BTreeMap::new();
        bad.insert("no good".to_string(), "x".to_string());
        assert!(f.provisioner.provision_definitions(&bad, "de").await.is_err());
        assert_eq!(f.attributes.list_definitions().await.unwrap().len(), 2);
    }
}
