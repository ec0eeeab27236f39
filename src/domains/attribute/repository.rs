use crate::domains::attribute::types::{
    AttributeDefinition, AttributeDefinitionRow, AttributeId, AttributeName, AttributeNameRow, TEXT_BOX_TYPE,
};
use crate::errors::{DbError, DomainResult};
use async_trait::async_trait;
use sqlx::{query, query_as, query_scalar, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;

/// Central attribute definitions and per-participant values
#[async_trait]
pub trait AttributeRepository: Send + Sync {
    async fn list_definitions(&self) -> DomainResult<Vec<AttributeDefinition>>;

    async fn find_definition(&self, attribute_id: AttributeId) -> DomainResult<Option<AttributeDefinition>>;

    /// Insert a visible text definition with one translation; returns the new id
    async fn create_definition_with_tx<'t>(
        &self,
        name: &str,
        lang: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<AttributeId>;

    async fn find_value_with_tx<'t>(
        &self,
        participant_id: &str,
        attribute_id: AttributeId,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<String>>;

    async fn value_exists_with_tx<'t>(
        &self,
        participant_id: &str,
        attribute_id: AttributeId,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool>;

    async fn update_value_with_tx<'t>(
        &self,
        participant_id: &str,
        attribute_id: AttributeId,
        value: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    async fn insert_value_with_tx<'t>(
        &self,
        participant_id: &str,
        attribute_id: AttributeId,
        value: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// All values of one participant keyed by attribute id
    async fn find_values(&self, participant_id: &str) -> DomainResult<BTreeMap<i64, String>>;

    async fn count_values(&self, participant_id: &str, attribute_id: AttributeId) -> DomainResult<i64>;
}

#[derive(Clone)]
pub struct SqliteAttributeRepository {
    pool: SqlitePool,
}

impl SqliteAttributeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn assemble(
        rows: Vec<AttributeDefinitionRow>,
        name_rows: Vec<AttributeNameRow>,
    ) -> Vec<AttributeDefinition> {
        let mut names: BTreeMap<i64, Vec<AttributeName>> = BTreeMap::new();
        for row in name_rows {
            names.entry(row.attribute_id).or_default().push(AttributeName {
                lang: row.lang,
                name: row.attribute_name,
            });
        }

        rows.into_iter()
            .map(|row| {
                let translations = names.remove(&row.attribute_id).unwrap_or_default();
                row.into_entity(translations)
            })
            .collect()
    }
}

#[async_trait]
impl AttributeRepository for SqliteAttributeRepository {
    async fn list_definitions(&self) -> DomainResult<Vec<AttributeDefinition>> {
        let rows = query_as::<_, AttributeDefinitionRow>(
            "SELECT attribute_id, attribute_type, defaultname, visible FROM participant_attribute_names ORDER BY attribute_id"
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let name_rows = query_as::<_, AttributeNameRow>(
            "SELECT attribute_id, attribute_name, lang FROM participant_attribute_names_lang ORDER BY attribute_id, lang"
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(Self::assemble(rows, name_rows))
    }

    async fn find_definition(&self, attribute_id: AttributeId) -> DomainResult<Option<AttributeDefinition>> {
        let row = query_as::<_, AttributeDefinitionRow>(
            "SELECT attribute_id, attribute_type, defaultname, visible FROM participant_attribute_names WHERE attribute_id = ?"
        )
        .bind(attribute_id.value())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let name_rows = query_as::<_, AttributeNameRow>(
            "SELECT attribute_id, attribute_name, lang FROM participant_attribute_names_lang WHERE attribute_id = ? ORDER BY lang"
        )
        .bind(attribute_id.value())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(Self::assemble(vec![row], name_rows).pop())
    }

    async fn create_definition_with_tx<'t>(
        &self,
        name: &str,
        lang: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<AttributeId> {
        let result = query(
            "INSERT INTO participant_attribute_names (attribute_type, defaultname, visible) VALUES (?, ?, 'Y')"
        )
        .bind(TEXT_BOX_TYPE)
        .bind(name)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        let attribute_id = AttributeId::new(result.last_insert_rowid())?;

        query("INSERT INTO participant_attribute_names_lang (attribute_id, attribute_name, lang) VALUES (?, ?, ?)")
            .bind(attribute_id.value())
            .bind(name)
            .bind(lang)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        log::debug!("Created attribute definition {} '{}' ({})", attribute_id, name, lang);
        Ok(attribute_id)
    }

    async fn find_value_with_tx<'t>(
        &self,
        participant_id: &str,
        attribute_id: AttributeId,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<String>> {
        let value = query_scalar::<_, String>(
            "SELECT value FROM participant_attribute WHERE participant_id = ? AND attribute_id = ?"
        )
        .bind(participant_id)
        .bind(attribute_id.value())
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?;
        Ok(value)
    }

    async fn value_exists_with_tx<'t>(
        &self,
        participant_id: &str,
        attribute_id: AttributeId,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM participant_attribute WHERE participant_id = ? AND attribute_id = ?"
        )
        .bind(participant_id)
        .bind(attribute_id.value())
        .fetch_one(&mut **tx)
        .await
        .map_err(DbError::from)?;
        Ok(count > 0)
    }

    async fn update_value_with_tx<'t>(
        &self,
        participant_id: &str,
        attribute_id: AttributeId,
        value: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query("UPDATE participant_attribute SET value = ? WHERE participant_id = ? AND attribute_id = ?")
            .bind(value)
            .bind(participant_id)
            .bind(attribute_id.value())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn insert_value_with_tx<'t>(
        &self,
        participant_id: &str,
        attribute_id: AttributeId,
        value: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query("INSERT INTO participant_attribute (participant_id, attribute_id, value) VALUES (?, ?, ?)")
            .bind(participant_id)
            .bind(attribute_id.value())
            .bind(value)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn find_values(&self, participant_id: &str) -> DomainResult<BTreeMap<i64, String>> {
        let rows: Vec<(i64, String)> = query_as(
            "SELECT attribute_id, value FROM participant_attribute WHERE participant_id = ? ORDER BY attribute_id"
        )
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(rows.into_iter().collect())
    }

    async fn count_values(&self, participant_id: &str, attribute_id: AttributeId) -> DomainResult<i64> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM participant_attribute WHERE participant_id = ? AND attribute_id = ?"
        )
        .bind(participant_id)
        .bind(attribute_id.value())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(count)
    }
}
