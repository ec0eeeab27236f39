use crate::errors::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// Built-in token table columns; everything else is a dynamically added attribute column
pub const STANDARD_TOKEN_COLUMNS: [&str; 8] = [
    "tid",
    "participant_id",
    "firstname",
    "lastname",
    "email",
    "emailstatus",
    "token",
    "language",
];

pub fn is_standard_token_column(column: &str) -> bool {
    STANDARD_TOKEN_COLUMNS.contains(&column)
}

/// Metadata kept for one token field in the survey's field description blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenFieldDescription {
    #[serde(default)]
    pub description: String,
    #[serde(default = "no_flag")]
    pub mandatory: String,
    #[serde(default = "no_flag")]
    pub show_register: String,
    /// Central attribute id this field is automatically mapped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpdbmap: Option<String>,
    /// Keys written by other tools, carried through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn no_flag() -> String {
    "N".to_string()
}

impl TokenFieldDescription {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            mandatory: no_flag(),
            show_register: no_flag(),
            cpdbmap: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// Field name -> description
pub type FieldDescriptions = BTreeMap<String, TokenFieldDescription>;

pub fn parse_field_descriptions(raw: Option<&str>) -> DomainResult<FieldDescriptions> {
    match raw.map(str::trim) {
        None | Some("") => Ok(FieldDescriptions::new()),
        Some(json) => serde_json::from_str(json).map_err(DomainError::from),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Survey {
    pub sid: i64,
    /// Default survey language
    pub language: String,
    pub field_descriptions: FieldDescriptions,
}

#[derive(Debug, Clone, FromRow)]
pub struct SurveyRow {
    pub sid: i64,
    pub language: String,
    pub attributedescriptions: Option<String>,
}

impl SurveyRow {
    pub fn into_entity(self) -> DomainResult<Survey> {
        Ok(Survey {
            field_descriptions: parse_field_descriptions(self.attributedescriptions.as_deref())?,
            sid: self.sid,
            language: self.language,
        })
    }
}

/// One row of a survey token table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub tid: i64,
    pub participant_id: Option<String>,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub emailstatus: Option<String>,
    pub token: Option<String>,
    pub language: Option<String>,
    /// Attribute columns by name
    pub attributes: BTreeMap<String, Option<String>>,
}

impl TokenRecord {
    /// Value of a standard or attribute column; NULL and empty both count as absent
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "participant_id" => self.participant_id.as_deref(),
            "firstname" => self.firstname.as_deref(),
            "lastname" => self.lastname.as_deref(),
            "email" => self.email.as_deref(),
            "emailstatus" => self.emailstatus.as_deref(),
            "token" => self.token.as_deref(),
            "language" => self.language.as_deref(),
            other => self.attributes.get(other).and_then(|v| v.as_deref()),
        };
        value.filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTokenRecord {
    pub participant_id: Option<String>,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub language: Option<String>,
    pub token: Option<String>,
}

/// Addresses a token row either through its linked participant or its own id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRowRef {
    Participant(String),
    Token(i64),
}

/// A participant's association with a survey's token row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SurveyLink {
    pub participant_id: String,
    pub token_id: i64,
    pub survey_id: i64,
    pub date_created: String,
    pub date_invited: Option<String>,
    pub date_completed: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_descriptions_keep_unknown_keys() {
        let raw = r#"{"attribute_1":{"description":"Gender","mandatory":"Y","show_register":"N","cpdbmap":"4","colour":"red"}}"#;
        let parsed = parse_field_descriptions(Some(raw)).unwrap();
        let gender = &parsed["attribute_1"];
        assert_eq!(gender.cpdbmap.as_deref(), Some("4"));
        assert_eq!(gender.extra.get("colour"), Some(&serde_json::json!("red")));

        let written = serde_json::to_value(&parsed).unwrap();
        assert_eq!(written["attribute_1"]["colour"], "red");
        assert_eq!(written["attribute_1"]["mandatory"], "Y");
    }

    #[test]
    fn test_empty_blob_is_empty_map() {
        assert!(parse_field_descriptions(None).unwrap().is_empty());
        assert!(parse_field_descriptions(Some("  ")).unwrap().is_empty());
        assert!(parse_field_descriptions(Some("{broken")).is_err());
    }

    #[test]
    fn test_token_field_lookup() {
        let mut attributes = BTreeMap::new();
        attributes.insert("attribute_1".to_string(), Some("".to_string()));
        attributes.insert("attribute_2".to_string(), Some("x".to_string()));
        let token = TokenRecord {
            tid: 1,
            participant_id: None,
            firstname: Some("Jason".to_string()),
            lastname: None,
            email: None,
            emailstatus: Some("OK".to_string()),
            token: None,
            language: None,
            attributes,
        };
        assert_eq!(token.field("firstname"), Some("Jason"));
        assert_eq!(token.field("attribute_1"), None);
        assert_eq!(token.field("attribute_2"), Some("x"));
        assert_eq!(token.field("attribute_9"), None);
        assert!(is_standard_token_column("email"));
        assert!(!is_standard_token_column("attribute_2"));
    }
}
