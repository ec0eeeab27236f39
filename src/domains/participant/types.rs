use crate::domains::search::SearchExpression;
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::types::YesNo;
use crate::validation::{Validate, ValidationBuilder};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

pub const MAX_PARTICIPANT_ID_LENGTH: usize = 50;
pub const MAX_NAME_LENGTH: usize = 40;
pub const MAX_LANGUAGE_LENGTH: usize = 40;
pub const MAX_EMAIL_LENGTH: usize = 254;

/// Timestamp format used by the participant tables
pub const DB_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_db_timestamp(at: DateTime<Utc>) -> String {
    at.format(DB_TIMESTAMP_FORMAT).to_string()
}

/// Accepts both the table format and RFC3339.
pub fn parse_db_timestamp(raw: &str, field_name: &str) -> DomainResult<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, DB_TIMESTAMP_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DomainError::Validation(ValidationError::format(field_name, &format!("Invalid timestamp: {}", raw))))
}

/// Central participant record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub language: Option<String>,
    pub blacklisted: bool,
    pub owner_uid: i64,
    pub created_by: i64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

/// NewParticipant DTO - used when adding a participant to the central table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewParticipant {
    /// Generated when absent
    pub participant_id: Option<String>,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub language: Option<String>,
    /// `Y` or `N`; defaults to `N`
    pub blacklisted: Option<String>,
    /// Defaults to the creating user
    pub owner_uid: Option<i64>,
}

impl NewParticipant {
    pub fn blacklisted_flag(&self) -> bool {
        self.blacklisted
            .as_deref()
            .and_then(YesNo::from_str)
            .map(|flag| flag.is_yes())
            .unwrap_or(false)
    }
}

impl Validate for NewParticipant {
    fn validate(&self) -> DomainResult<()> {
        if let Some(id) = &self.participant_id {
            ValidationBuilder::new("participant_id", Some(id.clone()))
                .required()
                .max_length(MAX_PARTICIPANT_ID_LENGTH)
                .validate()?;
        }
        validate_profile_fields(
            &self.firstname,
            &self.lastname,
            &self.email,
            &self.language,
            &self.blacklisted,
        )
    }
}

/// UpdateParticipant DTO - partial, last write wins
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateParticipant {
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub language: Option<String>,
    pub blacklisted: Option<String>,
    pub owner_uid: Option<i64>,
}

impl UpdateParticipant {
    pub fn is_empty(&self) -> bool {
        self.firstname.is_none()
            && self.lastname.is_none()
            && self.email.is_none()
            && self.language.is_none()
            && self.blacklisted.is_none()
            && self.owner_uid.is_none()
    }
}

impl Validate for UpdateParticipant {
    fn validate(&self) -> DomainResult<()> {
        validate_profile_fields(
            &self.firstname,
            &self.lastname,
            &self.email,
            &self.language,
            &self.blacklisted,
        )
    }
}

fn validate_profile_fields(
    firstname: &Option<String>,
    lastname: &Option<String>,
    email: &Option<String>,
    language: &Option<String>,
    blacklisted: &Option<String>,
) -> DomainResult<()> {
    ValidationBuilder::new("firstname", firstname.clone())
        .max_length(MAX_NAME_LENGTH)
        .validate()?;
    ValidationBuilder::new("lastname", lastname.clone())
        .max_length(MAX_NAME_LENGTH)
        .validate()?;
    ValidationBuilder::new("email", email.clone())
        .max_length(MAX_EMAIL_LENGTH)
        .email()
        .validate()?;
    ValidationBuilder::new("language", language.clone())
        .max_length(MAX_LANGUAGE_LENGTH)
        .validate()?;
    ValidationBuilder::new("blacklisted", blacklisted.clone())
        .one_of(&["Y", "N"], Some("must be Y or N"))
        .validate()
}

/// ParticipantRow - SQLite row representation for mapping from database
#[derive(Debug, Clone, FromRow)]
pub struct ParticipantRow {
    pub participant_id: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub language: Option<String>,
    pub blacklisted: String,
    pub owner_uid: i64,
    pub created_by: i64,
    pub created: Option<String>,
    pub modified: Option<String>,
}

impl ParticipantRow {
    pub fn into_entity(self) -> DomainResult<Participant> {
        let parse_optional_timestamp = |s: &Option<String>, field_name: &str| -> DomainResult<Option<DateTime<Utc>>> {
            match s {
                Some(raw) => parse_db_timestamp(raw, field_name).map(Some),
                None => Ok(None),
            }
        };

        let blacklisted = YesNo::from_str(&self.blacklisted)
            .ok_or_else(|| DomainError::Validation(ValidationError::invalid_value("blacklisted", &format!("expected Y or N, found '{}'", self.blacklisted))))?
            .is_yes();

        Ok(Participant {
            created: parse_optional_timestamp(&self.created, "created")?,
            modified: parse_optional_timestamp(&self.modified, "modified")?,
            participant_id: self.participant_id,
            firstname: self.firstname,
            lastname: self.lastname,
            email: self.email,
            language: self.language,
            blacklisted,
            owner_uid: self.owner_uid,
            created_by: self.created_by,
        })
    }
}

/// Participant visible to a user, with the edit right granted through a share (owners get `false` unless shared)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnedParticipant {
    pub participant: Participant,
    pub can_edit: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct OwnedParticipantRow {
    #[sqlx(flatten)]
    pub participant: ParticipantRow,
    pub can_edit: Option<i64>,
}

impl OwnedParticipantRow {
    pub fn into_entity(self) -> DomainResult<OwnedParticipant> {
        Ok(OwnedParticipant {
            participant: self.participant.into_entity()?,
            can_edit: self.can_edit.unwrap_or(0) != 0,
        })
    }
}

/// A participant together with one of its shares
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedParticipant {
    pub participant: Participant,
    pub share_uid: i64,
    pub date_added: String,
    pub can_edit: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct SharedParticipantRow {
    #[sqlx(flatten)]
    pub participant: ParticipantRow,
    pub share_uid: i64,
    pub date_added: String,
    pub can_edit: i64,
}

impl SharedParticipantRow {
    pub fn into_entity(self) -> DomainResult<SharedParticipant> {
        Ok(SharedParticipant {
            participant: self.participant.into_entity()?,
            share_uid: self.share_uid,
            date_added: self.date_added,
            can_edit: self.can_edit != 0,
        })
    }
}

/// One row of the participant listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantListEntry {
    pub participant: Participant,
    pub owner_name: Option<String>,
    pub owner_username: Option<String>,
    pub survey_count: i64,
    /// Only set for non-superadmin listings
    pub can_edit: Option<bool>,
    /// Requested attribute values keyed by attribute id
    pub attributes: BTreeMap<i64, Option<String>>,
}

/// Filters for the participant listing
#[derive(Debug, Clone, Default)]
pub struct ParticipantListQuery {
    pub search: Option<SearchExpression>,
    /// Attribute values to return with each row; attributes named in `search` are added automatically
    pub attribute_ids: Vec<i64>,
    /// Restrict to participants owned by or shared with this user
    pub visible_to: Option<i64>,
    pub hide_blacklisted: bool,
}

impl ParticipantListQuery {
    /// Requested attribute ids plus the ones the search refers to, deduplicated
    pub fn all_attribute_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.attribute_ids.iter().copied().filter(|id| *id > 0).collect();
        if let Some(search) = &self.search {
            ids.extend(search.attribute_ids());
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
