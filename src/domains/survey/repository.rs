use crate::domains::core::identifiers::{
    placeholders, quote_identifier, response_table, response_table_name, token_table, token_table_name,
};
use crate::domains::participant::types::format_db_timestamp;
use crate::domains::survey::types::{
    is_standard_token_column, FieldDescriptions, NewTokenRecord, Survey, SurveyLink, SurveyRow, TokenRecord,
    TokenRowRef,
};
use crate::errors::{DbError, DomainError, DomainResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{query, query_as, query_scalar, Executor, Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;

/// Surveys, their token and response tables, and participant links
#[async_trait]
pub trait SurveyRepository: Send + Sync {
    async fn create_survey(&self, survey_id: i64, language: &str, title: &str) -> DomainResult<()>;

    async fn find_survey(&self, survey_id: i64) -> DomainResult<Survey>;

    async fn create_token_table(&self, survey_id: i64) -> DomainResult<()>;

    async fn create_response_table(&self, survey_id: i64) -> DomainResult<()>;

    async fn token_table_exists(&self, survey_id: i64) -> DomainResult<bool>;

    async fn response_table_exists(&self, survey_id: i64) -> DomainResult<bool>;

    /// Column names of the token table in declaration order, read from schema metadata
    async fn token_columns(&self, survey_id: i64) -> DomainResult<Vec<String>>;

    async fn load_field_descriptions(&self, survey_id: i64) -> DomainResult<FieldDescriptions>;

    async fn load_field_descriptions_with_tx<'t>(
        &self,
        survey_id: i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<FieldDescriptions>;

    async fn save_field_descriptions(&self, survey_id: i64, descriptions: &FieldDescriptions) -> DomainResult<()>;

    async fn save_field_descriptions_with_tx<'t>(
        &self,
        survey_id: i64,
        descriptions: &FieldDescriptions,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Add a nullable text column to the token table
    async fn add_token_column_with_tx<'t>(
        &self,
        survey_id: i64,
        column: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Insert a token row and return its `tid`
    async fn insert_token_with_tx<'t>(
        &self,
        survey_id: i64,
        token: &NewTokenRecord,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<i64>;

    async fn find_token(&self, survey_id: i64, tid: i64) -> DomainResult<Option<TokenRecord>>;

    async fn find_token_with_tx<'t>(
        &self,
        survey_id: i64,
        tid: i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<TokenRecord>>;

    /// Exact (firstname, lastname, email) match, or a row already linked to `participant_id`
    async fn find_token_by_identity_with_tx<'t>(
        &self,
        survey_id: i64,
        firstname: Option<&str>,
        lastname: Option<&str>,
        email: Option<&str>,
        participant_id: Option<&str>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<TokenRecord>>;

    async fn list_tokens(&self, survey_id: i64) -> DomainResult<Vec<TokenRecord>>;

    async fn set_token_participant_with_tx<'t>(
        &self,
        survey_id: i64,
        tid: i64,
        participant_id: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Write one column of a token row without checking the row exists
    async fn update_token_field_with_tx<'t>(
        &self,
        survey_id: i64,
        row: &TokenRowRef,
        field: &str,
        value: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    async fn read_token_field_with_tx<'t>(
        &self,
        survey_id: i64,
        row: &TokenRowRef,
        field: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<String>>;

    async fn create_survey_link_with_tx<'t>(
        &self,
        participant_id: &str,
        token_id: i64,
        survey_id: i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<SurveyLink>;

    async fn find_survey_links(&self, participant_id: &str) -> DomainResult<Vec<SurveyLink>>;

    async fn find_links_for_survey(&self, survey_id: i64) -> DomainResult<Vec<SurveyLink>>;

    /// Distinct survey ids linked to any of the participants
    async fn linked_survey_ids_with_tx<'t>(
        &self,
        participant_ids: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Vec<i64>>;

    /// Non-empty token strings of the participants' rows in one survey
    async fn token_strings_with_tx<'t>(
        &self,
        survey_id: i64,
        participant_ids: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Vec<String>>;

    async fn delete_tokens_by_participant_with_tx<'t>(
        &self,
        survey_id: i64,
        participant_ids: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    async fn delete_responses_by_token_with_tx<'t>(
        &self,
        survey_id: i64,
        tokens: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;
}

#[derive(Clone)]
pub struct SqliteSurveyRepository {
    pool: SqlitePool,
}

impl SqliteSurveyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current token table columns, read on the executor that will run the select
    async fn token_columns_on<'e, E>(executor: E, survey_id: i64) -> DomainResult<Vec<String>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let columns = query_scalar::<_, String>("SELECT name FROM pragma_table_info(?) ORDER BY cid")
            .bind(token_table_name(survey_id))
            .fetch_all(executor)
            .await
            .map_err(DbError::from)?;

        if columns.is_empty() {
            return Err(DomainError::EntityNotFound(
                "Token table".to_string(),
                token_table_name(survey_id),
            ));
        }
        Ok(columns)
    }

    /// Explicit select over the given columns. The column list is part of the SQL text,
    /// so a statement prepared before an `ALTER TABLE` is never reused for the wider table.
    fn token_select(survey_id: i64, columns: &[String], tail: &str) -> DomainResult<String> {
        let list = columns
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<DomainResult<Vec<_>>>()?
            .join(", ");
        Ok(format!("SELECT {} FROM {} {}", list, token_table(survey_id), tail))
    }

    fn map_token_row(row: &SqliteRow, columns: &[String]) -> DomainResult<TokenRecord> {
        let mut attributes = BTreeMap::new();
        for name in columns.iter().filter(|name| !is_standard_token_column(name)) {
            let value: Option<String> = row.try_get(name.as_str()).map_err(DbError::from)?;
            attributes.insert(name.clone(), value);
        }

        Ok(TokenRecord {
            tid: row.try_get("tid").map_err(DbError::from)?,
            participant_id: row.try_get("participant_id").map_err(DbError::from)?,
            firstname: row.try_get("firstname").map_err(DbError::from)?,
            lastname: row.try_get("lastname").map_err(DbError::from)?,
            email: row.try_get("email").map_err(DbError::from)?,
            emailstatus: row.try_get("emailstatus").map_err(DbError::from)?,
            token: row.try_get("token").map_err(DbError::from)?,
            language: row.try_get("language").map_err(DbError::from)?,
            attributes,
        })
    }

    async fn table_exists(&self, table: &str) -> DomainResult<bool> {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count > 0)
    }

    fn row_filter(row: &TokenRowRef) -> &'static str {
        match row {
            TokenRowRef::Participant(_) => "participant_id = ?",
            TokenRowRef::Token(_) => "tid = ?",
        }
    }
}

#[async_trait]
impl SurveyRepository for SqliteSurveyRepository {
    async fn create_survey(&self, survey_id: i64, language: &str, title: &str) -> DomainResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        query("INSERT INTO surveys (sid, language, attributedescriptions) VALUES (?, ?, NULL)")
            .bind(survey_id)
            .bind(language)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        query("INSERT INTO surveys_languagesettings (surveyls_survey_id, surveyls_language, surveyls_title) VALUES (?, ?, ?)")
            .bind(survey_id)
            .bind(language)
            .bind(title)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn find_survey(&self, survey_id: i64) -> DomainResult<Survey> {
        query_as::<_, SurveyRow>("SELECT sid, language, attributedescriptions FROM surveys WHERE sid = ?")
            .bind(survey_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("Survey".to_string(), survey_id.to_string()))?
            .into_entity()
    }

    async fn create_token_table(&self, survey_id: i64) -> DomainResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                tid INTEGER PRIMARY KEY AUTOINCREMENT,
                participant_id TEXT,
                firstname TEXT,
                lastname TEXT,
                email TEXT,
                emailstatus TEXT,
                token TEXT,
                language TEXT
            )",
            token_table(survey_id)
        );
        query(&sql).execute(&self.pool).await.map_err(DbError::from)?;
        log::info!("Created token table {}", token_table_name(survey_id));
        Ok(())
    }

    async fn create_response_table(&self, survey_id: i64) -> DomainResult<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT,
                submitdate TEXT
            )",
            response_table(survey_id)
        );
        query(&sql).execute(&self.pool).await.map_err(DbError::from)?;
        log::info!("Created response table {}", response_table_name(survey_id));
        Ok(())
    }

    async fn token_table_exists(&self, survey_id: i64) -> DomainResult<bool> {
        self.table_exists(&token_table_name(survey_id)).await
    }

    async fn response_table_exists(&self, survey_id: i64) -> DomainResult<bool> {
        self.table_exists(&response_table_name(survey_id)).await
    }

    async fn token_columns(&self, survey_id: i64) -> DomainResult<Vec<String>> {
        Self::token_columns_on(&self.pool, survey_id).await
    }

    async fn load_field_descriptions(&self, survey_id: i64) -> DomainResult<FieldDescriptions> {
        Ok(self.find_survey(survey_id).await?.field_descriptions)
    }

    async fn load_field_descriptions_with_tx<'t>(
        &self,
        survey_id: i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<FieldDescriptions> {
        query_as::<_, SurveyRow>("SELECT sid, language, attributedescriptions FROM surveys WHERE sid = ?")
            .bind(survey_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("Survey".to_string(), survey_id.to_string()))?
            .into_entity()
            .map(|survey| survey.field_descriptions)
    }

    async fn save_field_descriptions(&self, survey_id: i64, descriptions: &FieldDescriptions) -> DomainResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        self.save_field_descriptions_with_tx(survey_id, descriptions, &mut tx).await?;
        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn save_field_descriptions_with_tx<'t>(
        &self,
        survey_id: i64,
        descriptions: &FieldDescriptions,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let json = serde_json::to_string(descriptions)?;
        let result = query("UPDATE surveys SET attributedescriptions = ? WHERE sid = ?")
            .bind(json)
            .bind(survey_id)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("Survey".to_string(), survey_id.to_string()));
        }
        Ok(())
    }

    async fn add_token_column_with_tx<'t>(
        &self,
        survey_id: i64,
        column: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} TEXT",
            token_table(survey_id),
            quote_identifier(column)?
        );
        query(&sql).execute(&mut **tx).await.map_err(DbError::from)?;
        log::debug!("Added column {} to {}", column, token_table_name(survey_id));
        Ok(())
    }

    async fn insert_token_with_tx<'t>(
        &self,
        survey_id: i64,
        token: &NewTokenRecord,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<i64> {
        let sql = format!(
            "INSERT INTO {} (participant_id, firstname, lastname, email, emailstatus, token, language)
             VALUES (?, ?, ?, ?, 'OK', ?, ?)",
            token_table(survey_id)
        );
        let result = query(&sql)
            .bind(&token.participant_id)
            .bind(&token.firstname)
            .bind(&token.lastname)
            .bind(&token.email)
            .bind(&token.token)
            .bind(&token.language)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(result.last_insert_rowid())
    }

    async fn find_token(&self, survey_id: i64, tid: i64) -> DomainResult<Option<TokenRecord>> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let token = self.find_token_with_tx(survey_id, tid, &mut tx).await?;
        tx.commit().await.map_err(DbError::from)?;
        Ok(token)
    }

    async fn find_token_with_tx<'t>(
        &self,
        survey_id: i64,
        tid: i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<TokenRecord>> {
        let columns = Self::token_columns_on(&mut **tx, survey_id).await?;
        let sql = Self::token_select(survey_id, &columns, "WHERE tid = ?")?;
        let row = query(&sql)
            .persistent(false)
            .bind(tid)
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?;
        row.map(|row| Self::map_token_row(&row, &columns)).transpose()
    }

    async fn find_token_by_identity_with_tx<'t>(
        &self,
        survey_id: i64,
        firstname: Option<&str>,
        lastname: Option<&str>,
        email: Option<&str>,
        participant_id: Option<&str>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<TokenRecord>> {
        let columns = Self::token_columns_on(&mut **tx, survey_id).await?;
        let sql = Self::token_select(
            survey_id,
            &columns,
            "WHERE (firstname = ? AND lastname = ? AND email = ?) OR participant_id = ? ORDER BY tid LIMIT 1",
        )?;
        let row = query(&sql)
            .persistent(false)
            .bind(firstname)
            .bind(lastname)
            .bind(email)
            .bind(participant_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?;
        row.map(|row| Self::map_token_row(&row, &columns)).transpose()
    }

    async fn list_tokens(&self, survey_id: i64) -> DomainResult<Vec<TokenRecord>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;
        let columns = Self::token_columns_on(&mut *conn, survey_id).await?;
        let sql = Self::token_select(survey_id, &columns, "ORDER BY tid")?;
        let rows = query(&sql)
            .persistent(false)
            .fetch_all(&mut *conn)
            .await
            .map_err(DbError::from)?;
        rows.iter().map(|row| Self::map_token_row(row, &columns)).collect()
    }

    async fn set_token_participant_with_tx<'t>(
        &self,
        survey_id: i64,
        tid: i64,
        participant_id: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let sql = format!("UPDATE {} SET participant_id = ? WHERE tid = ?", token_table(survey_id));
        query(&sql)
            .bind(participant_id)
            .bind(tid)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn update_token_field_with_tx<'t>(
        &self,
        survey_id: i64,
        row: &TokenRowRef,
        field: &str,
        value: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {}",
            token_table(survey_id),
            quote_identifier(field)?,
            Self::row_filter(row)
        );
        let q = query(&sql).bind(value);
        let q = match row {
            TokenRowRef::Participant(id) => q.bind(id.as_str()),
            TokenRowRef::Token(tid) => q.bind(*tid),
        };
        let result = q.execute(&mut **tx).await.map_err(DbError::from)?;
        Ok(result.rows_affected())
    }

    async fn read_token_field_with_tx<'t>(
        &self,
        survey_id: i64,
        row: &TokenRowRef,
        field: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<String>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY tid LIMIT 1",
            quote_identifier(field)?,
            token_table(survey_id),
            Self::row_filter(row)
        );
        let q = query_scalar::<_, Option<String>>(&sql);
        let q = match row {
            TokenRowRef::Participant(id) => q.bind(id.as_str()),
            TokenRowRef::Token(tid) => q.bind(*tid),
        };
        let value = q.fetch_optional(&mut **tx).await.map_err(DbError::from)?;
        Ok(value.flatten())
    }

    async fn create_survey_link_with_tx<'t>(
        &self,
        participant_id: &str,
        token_id: i64,
        survey_id: i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<SurveyLink> {
        let link = SurveyLink {
            participant_id: participant_id.to_string(),
            token_id,
            survey_id,
            date_created: format_db_timestamp(Utc::now()),
            date_invited: None,
            date_completed: None,
        };

        query("INSERT INTO survey_links (participant_id, token_id, survey_id, date_created) VALUES (?, ?, ?, ?)")
            .bind(&link.participant_id)
            .bind(link.token_id)
            .bind(link.survey_id)
            .bind(&link.date_created)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        Ok(link)
    }

    async fn find_survey_links(&self, participant_id: &str) -> DomainResult<Vec<SurveyLink>> {
        let links = query_as::<_, SurveyLink>(
            "SELECT participant_id, token_id, survey_id, date_created, date_invited, date_completed
             FROM survey_links WHERE participant_id = ? ORDER BY survey_id, token_id"
        )
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(links)
    }

    async fn find_links_for_survey(&self, survey_id: i64) -> DomainResult<Vec<SurveyLink>> {
        let links = query_as::<_, SurveyLink>(
            "SELECT participant_id, token_id, survey_id, date_created, date_invited, date_completed
             FROM survey_links WHERE survey_id = ? ORDER BY token_id"
        )
        .bind(survey_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(links)
    }

    async fn linked_survey_ids_with_tx<'t>(
        &self,
        participant_ids: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Vec<i64>> {
        if participant_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT survey_id FROM survey_links WHERE participant_id IN ({}) ORDER BY survey_id",
            placeholders(participant_ids.len())
        );
        let mut q = query_scalar::<_, i64>(&sql);
        for id in participant_ids {
            q = q.bind(id);
        }
        let ids = q.fetch_all(&mut **tx).await.map_err(DbError::from)?;
        Ok(ids)
    }

    async fn token_strings_with_tx<'t>(
        &self,
        survey_id: i64,
        participant_ids: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Vec<String>> {
        if participant_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT token FROM {} WHERE participant_id IN ({}) AND token IS NOT NULL AND token <> ''",
            token_table(survey_id),
            placeholders(participant_ids.len())
        );
        let mut q = query_scalar::<_, String>(&sql);
        for id in participant_ids {
            q = q.bind(id);
        }
        let tokens = q.fetch_all(&mut **tx).await.map_err(DbError::from)?;
        Ok(tokens)
    }

    async fn delete_tokens_by_participant_with_tx<'t>(
        &self,
        survey_id: i64,
        participant_ids: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        if participant_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE participant_id IN ({})",
            token_table(survey_id),
            placeholders(participant_ids.len())
        );
        let mut q = query(&sql);
        for id in participant_ids {
            q = q.bind(id);
        }
        let result = q.execute(&mut **tx).await.map_err(DbError::from)?;
        Ok(result.rows_affected())
    }

    async fn delete_responses_by_token_with_tx<'t>(
        &self,
        survey_id: i64,
        tokens: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        if tokens.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE token IN ({})",
            response_table(survey_id),
            placeholders(tokens.len())
        );
        let mut q = query(&sql);
        for token in tokens {
            q = q.bind(token);
        }
        let result = q.execute(&mut **tx).await.map_err(DbError::from)?;
        Ok(result.rows_affected())
    }
}
