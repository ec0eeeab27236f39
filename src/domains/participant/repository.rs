use crate::auth::AuthContext;
use crate::domains::core::identifiers::placeholders;
use crate::domains::core::repository::{BatchDeleteResult, FindById};
use crate::domains::participant::types::{
    format_db_timestamp, NewParticipant, OwnedParticipant, OwnedParticipantRow, Participant,
    ParticipantListEntry, ParticipantListQuery, ParticipantRow, SharedParticipant,
    SharedParticipantRow, UpdateParticipant,
};
use crate::domains::search::push_expression;
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::validation::Validate;
use crate::types::PaginationParams;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_as, query_scalar, FromRow, QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Participant columns, qualified with the `p` alias
const PARTICIPANT_COLUMNS: &str = "p.participant_id, p.firstname, p.lastname, p.email, p.language, \
     p.blacklisted, p.owner_uid, p.created_by, p.created, p.modified";

/// Trait defining participant repository operations
#[async_trait]
pub trait ParticipantRepository: FindById<Participant, str> + Send + Sync {
    async fn create(&self, new_participant: &NewParticipant, auth: &AuthContext) -> DomainResult<Participant>;

    async fn create_with_tx<'t>(
        &self,
        new_participant: &NewParticipant,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Participant>;

    /// Partial update; untouched columns keep their values
    async fn update_row(&self, participant_id: &str, update: &UpdateParticipant) -> DomainResult<Participant>;

    async fn find_optional_with_tx<'t>(
        &self,
        participant_id: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Participant>>;

    /// Exact match on the (firstname, lastname, email) triple, or on `participant_id` when given
    async fn find_by_identity_with_tx<'t>(
        &self,
        firstname: Option<&str>,
        lastname: Option<&str>,
        email: Option<&str>,
        participant_id: Option<&str>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Participant>>;

    async fn check_for_duplicate(
        &self,
        firstname: &str,
        lastname: &str,
        email: &str,
    ) -> DomainResult<Option<String>>;

    async fn count_all(&self) -> DomainResult<i64>;

    /// Participants owned by or shared with `user_id`
    async fn get_participants_owner(&self, user_id: i64) -> DomainResult<Vec<OwnedParticipant>>;

    async fn count_participants_owner(&self, user_id: i64) -> DomainResult<i64>;

    /// Number of share rows on participants owned by `user_id`
    async fn count_shared_by_owner(&self, user_id: i64) -> DomainResult<i64>;

    async fn get_participant_shared(&self, owner_uid: i64) -> DomainResult<Vec<SharedParticipant>>;

    async fn get_participant_shared_all(&self) -> DomainResult<Vec<SharedParticipant>>;

    /// Share with a user; `share_uid = 0` shares with everyone
    async fn add_share(&self, participant_id: &str, share_uid: i64, can_edit: bool) -> DomainResult<()>;

    async fn get_survey_count(&self, participant_id: &str) -> DomainResult<i64>;

    async fn is_owned_or_shared(&self, user_id: i64, participant_id: &str) -> DomainResult<bool>;

    /// Subset of `ids` owned by `owner_uid`
    async fn filter_owned_ids(&self, owner_uid: i64, ids: &[String]) -> DomainResult<Vec<String>>;

    /// Remove participants with their shares, survey links and attribute values
    async fn delete_with_tx<'t>(
        &self,
        ids: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<BatchDeleteResult>;

    async fn list(
        &self,
        list_query: &ParticipantListQuery,
        params: Option<PaginationParams>,
    ) -> DomainResult<Vec<ParticipantListEntry>>;

    async fn count(&self, list_query: &ParticipantListQuery) -> DomainResult<i64>;
}

/// SQLite implementation for ParticipantRepository
#[derive(Clone)]
pub struct SqliteParticipantRepository {
    pool: SqlitePool,
}

impl SqliteParticipantRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row_to_entity(row: ParticipantRow) -> DomainResult<Participant> {
        row.into_entity()
            .map_err(|e| DomainError::Internal(format!("Failed to map row to entity: {}", e)))
    }

    fn entity_name(&self) -> &'static str {
        "participants"
    }

    fn push_list_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, list_query: &ParticipantListQuery) {
        let mut conditions = 0;
        let mut next = |builder: &mut QueryBuilder<'a, Sqlite>| {
            builder.push(if conditions == 0 { " WHERE " } else { " AND " });
            conditions += 1;
        };

        if let Some(user_id) = list_query.visible_to {
            next(&mut *builder);
            builder.push("(p.owner_uid = ");
            builder.push_bind(user_id);
            builder.push(" OR EXISTS (SELECT 1 FROM participant_shares ps WHERE ps.participant_id = p.participant_id AND (ps.share_uid = ");
            builder.push_bind(user_id);
            builder.push(" OR ps.share_uid = 0)))");
        }
        if let Some(search) = &list_query.search {
            next(&mut *builder);
            push_expression(builder, search);
        }
        if list_query.hide_blacklisted {
            next(&mut *builder);
            builder.push("p.blacklisted <> 'Y'");
        }
    }
}

#[async_trait]
impl FindById<Participant, str> for SqliteParticipantRepository {
    async fn find_by_id(&self, id: &str) -> DomainResult<Participant> {
        let row = query_as::<_, ParticipantRow>(&format!(
            "SELECT {} FROM participants p WHERE p.participant_id = ?",
            PARTICIPANT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::EntityNotFound("Participant".to_string(), id.to_string()))?;

        Self::map_row_to_entity(row)
    }
}

#[async_trait]
impl ParticipantRepository for SqliteParticipantRepository {
    async fn create(&self, new_participant: &NewParticipant, auth: &AuthContext) -> DomainResult<Participant> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.create_with_tx(new_participant, auth, &mut tx).await {
            Ok(participant) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(participant)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn create_with_tx<'t>(
        &self,
        new_participant: &NewParticipant,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Participant> {
        new_participant.validate()?;

        let participant_id = match new_participant.participant_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let now = format_db_timestamp(Utc::now());
        let owner_uid = new_participant.owner_uid.unwrap_or(auth.user_id);
        let blacklisted = if new_participant.blacklisted_flag() { "Y" } else { "N" };

        let insert_result = query(
            "INSERT INTO participants (
                participant_id, firstname, lastname, email, language, blacklisted,
                owner_uid, created_by, created, modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)"
        )
        .bind(&participant_id)
        .bind(&new_participant.firstname)
        .bind(&new_participant.lastname)
        .bind(&new_participant.email)
        .bind(&new_participant.language)
        .bind(blacklisted)
        .bind(owner_uid)
        .bind(auth.user_id)
        .bind(&now)
        .execute(&mut **tx)
        .await;

        match insert_result {
            Ok(_) => {
                log::debug!("Created participant {} owned by {}", participant_id, owner_uid);
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(DomainError::Validation(ValidationError::invalid_value(
                    "participant_id",
                    &format!("a participant with the id '{}' already exists", participant_id),
                )));
            }
            Err(e) => return Err(DomainError::Database(DbError::from(e))),
        }

        self.find_optional_with_tx(&participant_id, tx)
            .await?
            .ok_or_else(|| DomainError::EntityNotFound(self.entity_name().to_string(), participant_id))
    }

    async fn update_row(&self, participant_id: &str, update: &UpdateParticipant) -> DomainResult<Participant> {
        if update.is_empty() {
            return self.find_by_id(participant_id).await;
        }

        let now = format_db_timestamp(Utc::now());
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE participants SET ");
        let mut separated = builder.separated(", ");

        macro_rules! set_if_some {
            ($column:literal, $value:expr) => {
                if let Some(val) = $value {
                    separated.push(concat!($column, " = "));
                    separated.push_bind_unseparated(val.clone());
                }
            };
        }

        set_if_some!("firstname", &update.firstname);
        set_if_some!("lastname", &update.lastname);
        set_if_some!("email", &update.email);
        set_if_some!("language", &update.language);
        set_if_some!("blacklisted", &update.blacklisted);
        set_if_some!("owner_uid", &update.owner_uid);
        separated.push("modified = ");
        separated.push_bind_unseparated(now);

        builder.push(" WHERE participant_id = ");
        builder.push_bind(participant_id);

        let result = builder.build().execute(&self.pool).await.map_err(DbError::from)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("Participant".to_string(), participant_id.to_string()));
        }

        self.find_by_id(participant_id).await
    }

    async fn find_optional_with_tx<'t>(
        &self,
        participant_id: &str,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Participant>> {
        let row = query_as::<_, ParticipantRow>(&format!(
            "SELECT {} FROM participants p WHERE p.participant_id = ?",
            PARTICIPANT_COLUMNS
        ))
        .bind(participant_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?;

        row.map(Self::map_row_to_entity).transpose()
    }

    async fn find_by_identity_with_tx<'t>(
        &self,
        firstname: Option<&str>,
        lastname: Option<&str>,
        email: Option<&str>,
        participant_id: Option<&str>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Participant>> {
        // NULL never equals anything, so a missing component cannot match
        let row = query_as::<_, ParticipantRow>(&format!(
            "SELECT {} FROM participants p
             WHERE (p.firstname = ? AND p.lastname = ? AND p.email = ?) OR p.participant_id = ?
             ORDER BY p.created, p.participant_id
             LIMIT 1",
            PARTICIPANT_COLUMNS
        ))
        .bind(firstname)
        .bind(lastname)
        .bind(email)
        .bind(participant_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?;

        row.map(Self::map_row_to_entity).transpose()
    }

    async fn check_for_duplicate(
        &self,
        firstname: &str,
        lastname: &str,
        email: &str,
    ) -> DomainResult<Option<String>> {
        let id = query_scalar::<_, String>(
            "SELECT participant_id FROM participants WHERE firstname = ? AND lastname = ? AND email = ? LIMIT 1"
        )
        .bind(firstname)
        .bind(lastname)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(id)
    }

    async fn count_all(&self) -> DomainResult<i64> {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM participants")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count)
    }

    async fn get_participants_owner(&self, user_id: i64) -> DomainResult<Vec<OwnedParticipant>> {
        let rows = query_as::<_, OwnedParticipantRow>(&format!(
            "SELECT {},
                (SELECT MAX(ps.can_edit) FROM participant_shares ps
                  WHERE ps.participant_id = p.participant_id AND ps.share_uid = ?) AS can_edit
             FROM participants p
             WHERE p.owner_uid = ?
                OR EXISTS (SELECT 1 FROM participant_shares ps WHERE ps.participant_id = p.participant_id AND ps.share_uid = ?)
             ORDER BY p.participant_id",
            PARTICIPANT_COLUMNS
        ))
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(OwnedParticipantRow::into_entity).collect()
    }

    async fn count_participants_owner(&self, user_id: i64) -> DomainResult<i64> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM participants p
             WHERE p.owner_uid = ?
                OR EXISTS (SELECT 1 FROM participant_shares ps WHERE ps.participant_id = p.participant_id AND ps.share_uid = ?)"
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(count)
    }

    async fn count_shared_by_owner(&self, user_id: i64) -> DomainResult<i64> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM participants p
             JOIN participant_shares ps ON ps.participant_id = p.participant_id
             WHERE p.owner_uid = ?"
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(count)
    }

    async fn get_participant_shared(&self, owner_uid: i64) -> DomainResult<Vec<SharedParticipant>> {
        let rows = query_as::<_, SharedParticipantRow>(&format!(
            "SELECT {}, ps.share_uid, ps.date_added, ps.can_edit
             FROM participants p
             JOIN participant_shares ps ON ps.participant_id = p.participant_id
             WHERE p.owner_uid = ?
             ORDER BY p.participant_id, ps.share_uid",
            PARTICIPANT_COLUMNS
        ))
        .bind(owner_uid)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(SharedParticipantRow::into_entity).collect()
    }

    async fn get_participant_shared_all(&self) -> DomainResult<Vec<SharedParticipant>> {
        let rows = query_as::<_, SharedParticipantRow>(&format!(
            "SELECT {}, ps.share_uid, ps.date_added, ps.can_edit
             FROM participants p
             JOIN participant_shares ps ON ps.participant_id = p.participant_id
             ORDER BY p.participant_id, ps.share_uid",
            PARTICIPANT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(SharedParticipantRow::into_entity).collect()
    }

    async fn add_share(&self, participant_id: &str, share_uid: i64, can_edit: bool) -> DomainResult<()> {
        query(
            "INSERT INTO participant_shares (participant_id, share_uid, date_added, can_edit)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (participant_id, share_uid) DO UPDATE SET can_edit = excluded.can_edit"
        )
        .bind(participant_id)
        .bind(share_uid)
        .bind(format_db_timestamp(Utc::now()))
        .bind(can_edit as i64)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn get_survey_count(&self, participant_id: &str) -> DomainResult<i64> {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM survey_links WHERE participant_id = ?")
            .bind(participant_id)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count)
    }

    async fn is_owned_or_shared(&self, user_id: i64, participant_id: &str) -> DomainResult<bool> {
        let owned: i64 = query_scalar(
            "SELECT COUNT(*) FROM participants WHERE participant_id = ? AND owner_uid = ?"
        )
        .bind(participant_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        if owned > 0 {
            return Ok(true);
        }

        let shared: i64 = query_scalar(
            "SELECT COUNT(*) FROM participant_shares WHERE participant_id = ? AND (share_uid = ? OR share_uid = 0)"
        )
        .bind(participant_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(shared > 0)
    }

    async fn filter_owned_ids(&self, owner_uid: i64, ids: &[String]) -> DomainResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT participant_id FROM participants WHERE owner_uid = ? AND participant_id IN ({})",
            placeholders(ids.len())
        );
        let mut q = query_scalar::<_, String>(&sql).bind(owner_uid);
        for id in ids {
            q = q.bind(id);
        }
        let owned = q.fetch_all(&self.pool).await.map_err(DbError::from)?;

        // Keep caller order
        Ok(ids.iter().filter(|id| owned.contains(id)).cloned().collect())
    }

    async fn delete_with_tx<'t>(
        &self,
        ids: &[String],
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<BatchDeleteResult> {
        let mut result = BatchDeleteResult::default();
        if ids.is_empty() {
            return Ok(result);
        }
        let list = placeholders(ids.len());

        let sql_for = |table: &'static str| format!("DELETE FROM {} WHERE participant_id IN ({})", table, list);

        let statements = [
            ("participants", sql_for("participants")),
            ("participant_shares", sql_for("participant_shares")),
            ("survey_links", sql_for("survey_links")),
            ("participant_attribute", sql_for("participant_attribute")),
        ];

        for (table, sql) in statements.iter() {
            let mut q = query(sql);
            for id in ids {
                q = q.bind(id);
            }
            let affected = q.execute(&mut **tx).await.map_err(DbError::from)?.rows_affected();
            match *table {
                "participants" => result.deleted_participants = affected,
                "survey_links" => result.deleted_links = affected,
                "participant_attribute" => result.deleted_attribute_values = affected,
                _ => {}
            }
        }

        log::debug!(
            "Deleted {} participants, {} links, {} attribute values",
            result.deleted_participants,
            result.deleted_links,
            result.deleted_attribute_values
        );
        Ok(result)
    }

    async fn list(
        &self,
        list_query: &ParticipantListQuery,
        params: Option<PaginationParams>,
    ) -> DomainResult<Vec<ParticipantListEntry>> {
        let attribute_ids = list_query.all_attribute_ids();

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT ");
        builder.push(PARTICIPANT_COLUMNS);
        builder.push(
            ", luser.full_name AS owner_name, luser.users_name AS owner_username, \
             (SELECT COUNT(*) FROM survey_links sl WHERE sl.participant_id = p.participant_id) AS survey_count",
        );
        if let Some(user_id) = list_query.visible_to {
            builder.push(
                ", (SELECT MAX(ps.can_edit) FROM participant_shares ps \
                 WHERE ps.participant_id = p.participant_id AND (ps.share_uid = ",
            );
            builder.push_bind(user_id);
            builder.push(" OR ps.share_uid = 0)) AS can_edit");
        }
        // Attribute ids are integers, safe to splice as aliases
        for id in &attribute_ids {
            builder.push(format!(", a{id}.value AS attr_{id}", id = id));
        }
        builder.push(" FROM participants p LEFT JOIN users luser ON luser.uid = p.owner_uid");
        for id in &attribute_ids {
            builder.push(format!(
                " LEFT JOIN participant_attribute a{id} ON a{id}.participant_id = p.participant_id AND a{id}.attribute_id = {id}",
                id = id
            ));
        }

        Self::push_list_filters(&mut builder, list_query);
        builder.push(" ORDER BY p.lastname, p.firstname, p.participant_id");

        if let Some(params) = params {
            builder.push(" LIMIT ");
            builder.push_bind(params.limit());
            builder.push(" OFFSET ");
            builder.push_bind(params.offset());
        }

        let rows = builder.build().fetch_all(&self.pool).await.map_err(DbError::from)?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let participant = Self::map_row_to_entity(ParticipantRow::from_row(&row).map_err(DbError::from)?)?;
            let mut attributes = BTreeMap::new();
            for id in &attribute_ids {
                let value: Option<String> = row
                    .try_get(format!("attr_{}", id).as_str())
                    .map_err(DbError::from)?;
                attributes.insert(*id, value);
            }
            let can_edit = match list_query.visible_to {
                Some(_) => Some(row.try_get::<Option<i64>, _>("can_edit").map_err(DbError::from)?.unwrap_or(0) != 0),
                None => None,
            };

            entries.push(ParticipantListEntry {
                participant,
                owner_name: row.try_get("owner_name").map_err(DbError::from)?,
                owner_username: row.try_get("owner_username").map_err(DbError::from)?,
                survey_count: row.try_get("survey_count").map_err(DbError::from)?,
                can_edit,
                attributes,
            });
        }

        Ok(entries)
    }

    async fn count(&self, list_query: &ParticipantListQuery) -> DomainResult<i64> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM participants p LEFT JOIN users luser ON luser.uid = p.owner_uid",
        );
        Self::push_list_filters(&mut builder, list_query);

        let count: i64 = builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::search::SearchExpression;
    use crate::test_support::{admin, operator, test_pool};

    fn person(first: &str, last: &str, email: &str) -> NewParticipant {
        NewParticipant {
            firstname: Some(first.to_string()),
            lastname: Some(last.to_string()),
            email: Some(email.to_string()),
            language: Some("en".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_generates_uuid_and_stamps_owner() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteParticipantRepository::new(pool);

        let created = repo.create(&person("Jason", "Cleeland", "j@x.com"), &operator()).await.unwrap();
        assert!(Uuid::parse_str(&created.participant_id).is_ok());
        assert_eq!(created.owner_uid, 2);
        assert_eq!(created.created_by, 2);
        assert!(created.created.is_some());
        assert!(!created.blacklisted);

        let with_id = NewParticipant {
            participant_id: Some("fixed-id".to_string()),
            ..person("Ann", "Lee", "a@x.com")
        };
        let created = repo.create(&with_id, &admin()).await.unwrap();
        assert_eq!(created.participant_id, "fixed-id");
        assert!(matches!(
            repo.create(&with_id, &admin()).await,
            Err(DomainError::Validation(ValidationError::InvalidValue { .. }))
        ));

        let long_name = person(&"x".repeat(200), "Lee", "l@x.com");
        assert!(matches!(
            repo.create(&long_name, &admin()).await,
            Err(DomainError::Validation(ValidationError::MaxLength { .. }))
        ));
        assert_eq!(repo.count_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_row_is_partial() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteParticipantRepository::new(pool);
        let created = repo.create(&person("Jason", "Cleeland", "j@x.com"), &admin()).await.unwrap();

        let updated = repo
            .update_row(&created.participant_id, &UpdateParticipant {
                email: Some("jason@x.com".to_string()),
                blacklisted: Some("Y".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(updated.firstname.as_deref(), Some("Jason"));
        assert_eq!(updated.email.as_deref(), Some("jason@x.com"));
        assert!(updated.blacklisted);
        assert!(updated.modified.is_some());

        let missing = repo.update_row("nope", &UpdateParticipant {
            firstname: Some("x".to_string()),
            ..Default::default()
        }).await;
        assert!(matches!(missing, Err(DomainError::EntityNotFound(_, _))));
    }

    #[tokio::test]
    async fn test_check_for_duplicate_is_exact() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteParticipantRepository::new(pool);
        let created = repo.create(&person("Jason", "Cleeland", "j@x.com"), &admin()).await.unwrap();

        assert_eq!(
            repo.check_for_duplicate("Jason", "Cleeland", "j@x.com").await.unwrap(),
            Some(created.participant_id)
        );
        assert_eq!(repo.check_for_duplicate("Jason ", "Cleeland", "j@x.com").await.unwrap(), None);
        assert_eq!(repo.check_for_duplicate("jason", "Cleeland", "j@x.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ownership_and_shares() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteParticipantRepository::new(pool);

        let own = repo.create(&person("A", "Owner", "a@x.com"), &operator()).await.unwrap();
        let other = repo.create(&person("B", "Other", "b@x.com"), &admin()).await.unwrap();
        let public = repo.create(&person("C", "Public", "c@x.com"), &admin()).await.unwrap();

        repo.add_share(&other.participant_id, 2, true).await.unwrap();
        repo.add_share(&public.participant_id, 0, false).await.unwrap();

        let visible = repo.get_participants_owner(2).await.unwrap();
        let ids: Vec<_> = visible.iter().map(|p| p.participant.participant_id.clone()).collect();
        assert!(ids.contains(&own.participant_id));
        assert!(ids.contains(&other.participant_id));
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().find(|p| p.participant.participant_id == other.participant_id).unwrap().can_edit);
        assert_eq!(repo.count_participants_owner(2).await.unwrap(), 2);

        assert!(repo.is_owned_or_shared(2, &own.participant_id).await.unwrap());
        assert!(repo.is_owned_or_shared(3, &public.participant_id).await.unwrap());
        assert!(!repo.is_owned_or_shared(3, &own.participant_id).await.unwrap());

        assert_eq!(repo.count_shared_by_owner(1).await.unwrap(), 2);
        assert_eq!(repo.get_participant_shared(1).await.unwrap().len(), 2);
        assert_eq!(repo.get_participant_shared_all().await.unwrap().len(), 2);
        assert_eq!(repo.count_all().await.unwrap(), 3);

        let filtered = repo
            .filter_owned_ids(2, &[other.participant_id.clone(), own.participant_id.clone()])
            .await
            .unwrap();
        assert_eq!(filtered, vec![own.participant_id.clone()]);
    }

    #[tokio::test]
    async fn test_delete_with_tx_removes_dependents() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteParticipantRepository::new(pool.clone());
        let created = repo.create(&person("A", "B", "a@x.com"), &admin()).await.unwrap();

        sqlx::query("INSERT INTO survey_links (participant_id, token_id, survey_id, date_created) VALUES (?, 1, 10, '2024-01-01 00:00:00')")
            .bind(&created.participant_id)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO participant_attribute_names (attribute_type, defaultname, visible) VALUES ('TB', 'Gender', 'Y')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO participant_attribute (participant_id, attribute_id, value) VALUES (?, 1, 'f')")
            .bind(&created.participant_id)
            .execute(&pool)
            .await
            .unwrap();

        let mut tx = pool.begin().await.unwrap();
        let result = repo.delete_with_tx(&[created.participant_id.clone()], &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(result.deleted_participants, 1);
        assert_eq!(result.deleted_links, 1);
        assert_eq!(result.deleted_attribute_values, 1);
        assert_eq!(repo.get_survey_count(&created.participant_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_with_search_and_attributes() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteParticipantRepository::new(pool.clone());

        let jason = repo.create(&person("Jason", "Cleeland", "jason@gov.au"), &admin()).await.unwrap();
        repo.create(&person("Alice", "Smith", "alice@example.com"), &admin()).await.unwrap();
        let blocked = repo
            .create(&NewParticipant { blacklisted: Some("Y".to_string()), ..person("Bob", "Gov", "bob@gov.au") }, &operator())
            .await
            .unwrap();

        sqlx::query("INSERT INTO participant_attribute_names (attribute_type, defaultname, visible) VALUES ('TB', 'Gender', 'Y')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO participant_attribute (participant_id, attribute_id, value) VALUES (?, 1, 'male')")
            .bind(&jason.participant_id)
            .execute(&pool)
            .await
            .unwrap();

        let mut list_query = ParticipantListQuery {
            search: Some(SearchExpression::parse("email||contains||gov").unwrap()),
            attribute_ids: vec![1],
            ..Default::default()
        };
        let rows = repo.list(&list_query, None).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(repo.count(&list_query).await.unwrap(), 2);
        let jason_row = rows.iter().find(|r| r.participant.participant_id == jason.participant_id).unwrap();
        assert_eq!(jason_row.attributes.get(&1), Some(&Some("male".to_string())));
        assert_eq!(jason_row.owner_name.as_deref(), Some("Administrator"));
        assert_eq!(jason_row.survey_count, 0);

        list_query.hide_blacklisted = true;
        assert_eq!(repo.count(&list_query).await.unwrap(), 1);

        list_query.hide_blacklisted = false;
        list_query.visible_to = Some(2);
        let rows = repo.list(&list_query, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].participant.participant_id, blocked.participant_id);
        assert_eq!(rows[0].can_edit, Some(false));

        let by_attribute = ParticipantListQuery {
            search: Some(SearchExpression::parse("1||equal||male||or||owner_name||equal||Survey Operator").unwrap()),
            ..Default::default()
        };
        assert_eq!(repo.count(&by_attribute).await.unwrap(), 2);

        let paged = repo
            .list(&ParticipantListQuery::default(), Some(PaginationParams { page: 2, per_page: 2 }))
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }
}
