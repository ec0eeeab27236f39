use crate::errors::{ServiceError, ServiceResult, ValidationError};
use crate::types::YesNo;
use serde::{Deserialize, Serialize};

pub const ENV_HIDE_BLACKLISTED: &str = "CPDB_HIDE_BLACKLISTED";
pub const ENV_BLOCK_ADDING_TO_SURVEYS: &str = "CPDB_BLOCK_ADDING_TO_SURVEYS";
pub const ENV_DELETE_CHUNK_SIZE: &str = "CPDB_DELETE_CHUNK_SIZE";

pub const DEFAULT_DELETE_CHUNK_SIZE: usize = 100;

/// Policy switches for the central participant database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpdbSettings {
    /// Blacklisted participants are left out of listings
    pub hide_blacklisted: bool,
    /// Blacklisted participants are never copied into survey token tables
    pub block_adding_to_surveys: bool,
    pub delete_chunk_size: usize,
}

impl Default for CpdbSettings {
    fn default() -> Self {
        Self {
            hide_blacklisted: false,
            block_adding_to_surveys: false,
            delete_chunk_size: DEFAULT_DELETE_CHUNK_SIZE,
        }
    }
}

impl CpdbSettings {
    /// Read settings from the process environment after loading `.env`, if present.
    pub fn from_env() -> ServiceResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> ServiceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(raw) = lookup(ENV_HIDE_BLACKLISTED) {
            settings.hide_blacklisted = parse_flag(ENV_HIDE_BLACKLISTED, &raw)?;
        }
        if let Some(raw) = lookup(ENV_BLOCK_ADDING_TO_SURVEYS) {
            settings.block_adding_to_surveys = parse_flag(ENV_BLOCK_ADDING_TO_SURVEYS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DELETE_CHUNK_SIZE) {
            let size = raw.trim().parse::<usize>().map_err(|_| {
                ServiceError::Configuration(format!("{} must be a positive integer, got '{}'", ENV_DELETE_CHUNK_SIZE, raw))
            })?;
            if size == 0 {
                return Err(ServiceError::Configuration(
                    ValidationError::range(ENV_DELETE_CHUNK_SIZE, 1, usize::MAX).to_string(),
                ));
            }
            settings.delete_chunk_size = size;
        }

        Ok(settings)
    }
}

fn parse_flag(key: &str, raw: &str) -> ServiceResult<bool> {
    YesNo::parse_flag(raw).ok_or_else(|| {
        ServiceError::Configuration(format!("{} must be Y/N, true/false or 1/0, got '{}'", key, raw))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let settings = CpdbSettings::from_lookup(|_| None).unwrap();
        assert_eq!(settings, CpdbSettings::default());
        assert_eq!(settings.delete_chunk_size, 100);
    }

    #[test]
    fn test_flags_accept_platform_spellings() {
        let settings = CpdbSettings::from_lookup(lookup_from(&[
            (ENV_HIDE_BLACKLISTED, "Y"),
            (ENV_BLOCK_ADDING_TO_SURVEYS, "true"),
            (ENV_DELETE_CHUNK_SIZE, "25"),
        ]))
        .unwrap();
        assert!(settings.hide_blacklisted);
        assert!(settings.block_adding_to_surveys);
        assert_eq!(settings.delete_chunk_size, 25);
    }

    #[test]
    fn test_bad_values_are_configuration_errors() {
        let err = CpdbSettings::from_lookup(lookup_from(&[(ENV_HIDE_BLACKLISTED, "sometimes")])).unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));

        let err = CpdbSettings::from_lookup(lookup_from(&[(ENV_DELETE_CHUNK_SIZE, "0")])).unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));
    }
}
