use crate::errors::{DomainError, DomainResult};
use crate::validation::is_safe_identifier;

/// Marker shared by every dynamically added attribute column
pub const ATTRIBUTE_COLUMN_MARKER: &str = "attribute_";

/// Check an identifier before it is spliced into SQL and return it double-quoted.
pub fn quote_identifier(identifier: &str) -> DomainResult<String> {
    if !is_safe_identifier(identifier) {
        return Err(DomainError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(format!("\"{}\"", identifier))
}

/// Unquoted name of a survey's token table
pub fn token_table_name(survey_id: i64) -> String {
    format!("tokens_{}", survey_id)
}

/// Unquoted name of a survey's response table
pub fn response_table_name(survey_id: i64) -> String {
    format!("survey_{}", survey_id)
}

/// Quoted token table name, ready for SQL
pub fn token_table(survey_id: i64) -> String {
    format!("\"{}\"", token_table_name(survey_id))
}

/// Quoted response table name, ready for SQL
pub fn response_table(survey_id: i64) -> String {
    format!("\"{}\"", response_table_name(survey_id))
}

/// Build `?, ?, ?` for an `IN (...)` list
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
