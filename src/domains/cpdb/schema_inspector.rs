use crate::domains::attribute::{AttributeDefinition, AttributeId, AttributeRepository, MISSING_ATTRIBUTE_NAME};
use crate::domains::core::identifiers::ATTRIBUTE_COLUMN_MARKER;
use crate::domains::survey::SurveyRepository;
use crate::errors::{DomainError, DomainResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Reads token table columns and central attribute definitions.
///
/// Column lists are cached per survey; callers that change a token table's
/// schema must call [`SchemaInspector::invalidate`] afterwards.
pub struct SchemaInspector {
    survey_repo: Arc<dyn SurveyRepository>,
    attribute_repo: Arc<dyn AttributeRepository>,
    columns: RwLock<HashMap<i64, Arc<Vec<String>>>>,
}

impl SchemaInspector {
    pub fn new(survey_repo: Arc<dyn SurveyRepository>, attribute_repo: Arc<dyn AttributeRepository>) -> Self {
        Self {
            survey_repo,
            attribute_repo,
            columns: RwLock::new(HashMap::new()),
        }
    }

    /// All token table columns in declaration order
    pub async fn columns(&self, survey_id: i64) -> DomainResult<Arc<Vec<String>>> {
        if let Some(cached) = self.columns.read().await.get(&survey_id) {
            return Ok(cached.clone());
        }

        let fresh = Arc::new(self.survey_repo.token_columns(survey_id).await?);
        self.columns.write().await.insert(survey_id, fresh.clone());
        Ok(fresh)
    }

    pub async fn invalidate(&self, survey_id: i64) {
        self.columns.write().await.remove(&survey_id);
    }

    /// Attribute columns keyed by their 1-based position among all columns
    pub async fn list_attribute_columns(&self, survey_id: i64) -> DomainResult<BTreeMap<usize, String>> {
        let columns = self.columns(survey_id).await?;
        Ok(columns
            .iter()
            .enumerate()
            .filter(|(_, name)| name.contains(ATTRIBUTE_COLUMN_MARKER))
            .map(|(index, name)| (index + 1, name.clone()))
            .collect())
    }

    pub async fn has_column(&self, survey_id: i64, column: &str) -> DomainResult<bool> {
        Ok(self.columns(survey_id).await?.iter().any(|c| c == column))
    }

    /// Fails with `DuplicateAttribute` naming the first candidate that already has a column.
    pub async fn has_duplicate_attribute(
        &self,
        survey_id: i64,
        candidates: &[AttributeId],
        operator_language: &str,
    ) -> DomainResult<bool> {
        let attribute_columns = self.list_attribute_columns(survey_id).await?;

        for column in attribute_columns.values() {
            let suffix = column
                .find(ATTRIBUTE_COLUMN_MARKER)
                .map(|at| &column[at + ATTRIBUTE_COLUMN_MARKER.len()..])
                .unwrap_or_default();

            if let Some(existing) = candidates.iter().find(|id| id.to_string() == suffix) {
                let name = self.attribute_name(*existing, operator_language).await?;
                log::warn!("Token table of survey {} already has a column for attribute {}", survey_id, existing);
                return Err(DomainError::DuplicateAttribute(name));
            }
        }

        Ok(false)
    }

    pub async fn list_definitions(&self) -> DomainResult<Vec<AttributeDefinition>> {
        self.attribute_repo.list_definitions().await
    }

    /// Name of the attribute in the given language, or the placeholder when it has none
    pub async fn attribute_name(&self, attribute_id: AttributeId, language: &str) -> DomainResult<String> {
        let name = self
            .attribute_repo
            .find_definition(attribute_id)
            .await?
            .and_then(|definition| definition.name_in(language).map(str::to_string));
        Ok(name.unwrap_or_else(|| MISSING_ATTRIBUTE_NAME.to_string()))
    }
}
