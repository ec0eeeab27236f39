use crate::domains::core::identifiers::ATTRIBUTE_COLUMN_MARKER;
use crate::errors::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Shown when an attribute has no translation in the requested language
pub const MISSING_ATTRIBUTE_NAME: &str = "[Found no name]";

/// Attribute type tag for free text attributes
pub const TEXT_BOX_TYPE: &str = "TB";

/// Id of a central attribute definition. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributeId(i64);

impl AttributeId {
    /// Accepts positive integers, optionally in column form (`attribute_7`).
    /// Zero and non-numeric input are rejected.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix(ATTRIBUTE_COLUMN_MARKER).unwrap_or(trimmed);
        match digits.parse::<i64>() {
            Ok(id) if id > 0 => Ok(AttributeId(id)),
            _ => Err(DomainError::InvalidAttributeId(raw.to_string())),
        }
    }

    pub fn new(id: i64) -> DomainResult<Self> {
        if id > 0 {
            Ok(AttributeId(id))
        } else {
            Err(DomainError::InvalidAttributeId(id.to_string()))
        }
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Token table column holding this attribute, e.g. `attribute_7`
    pub fn column_name(&self) -> String {
        format!("{}{}", ATTRIBUTE_COLUMN_MARKER, self.0)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeName {
    pub lang: String,
    pub name: String,
}

/// Central, survey independent attribute definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub attribute_id: i64,
    pub attribute_type: String,
    pub defaultname: String,
    pub visible: bool,
    /// Translations ordered by language code
    pub names: Vec<AttributeName>,
}

impl AttributeDefinition {
    pub fn name_in(&self, lang: &str) -> Option<&str> {
        self.names
            .iter()
            .find(|n| n.lang == lang)
            .map(|n| n.name.as_str())
    }

    /// First translation found for the given languages, else the first translation available
    pub fn display_name(&self, preferred: &[&str]) -> Option<&str> {
        preferred
            .iter()
            .find_map(|lang| self.name_in(lang))
            .or_else(|| self.names.first().map(|n| n.name.as_str()))
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AttributeDefinitionRow {
    pub attribute_id: i64,
    pub attribute_type: String,
    pub defaultname: String,
    pub visible: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct AttributeNameRow {
    pub attribute_id: i64,
    pub attribute_name: String,
    pub lang: String,
}

impl AttributeDefinitionRow {
    /// `names` must already be filtered to this definition
    pub fn into_entity(self, names: Vec<AttributeName>) -> AttributeDefinition {
        AttributeDefinition {
            attribute_id: self.attribute_id,
            attribute_type: self.attribute_type,
            defaultname: self.defaultname,
            visible: self.visible == "Y",
            names,
        }
    }
}
