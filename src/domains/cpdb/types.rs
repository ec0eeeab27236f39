use crate::domains::attribute::AttributeId;
use serde::{Deserialize, Serialize};

/// How a token field came to be paired with a central attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingKind {
    /// Stored in the survey's automap from an earlier run
    Automatic,
    /// Chosen by the operator for this call
    Manual,
    /// Destination or source is a built-in token column
    Standard,
}

impl MappingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingKind::Automatic => "automatic",
            MappingKind::Manual => "manual",
            MappingKind::Standard => "standard",
        }
    }
}

/// A token field paired with a central attribute id.
///
/// `attribute_id` stays raw until it is written so that a bad id fails the single
/// write that uses it, not the whole call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedAttribute {
    pub token_field: String,
    pub attribute_id: String,
    pub kind: MappingKind,
}

impl MappedAttribute {
    pub fn new(token_field: &str, attribute_id: &str, kind: MappingKind) -> Self {
        Self {
            token_field: token_field.to_string(),
            attribute_id: attribute_id.to_string(),
            kind,
        }
    }
}

/// Column or definition created during this call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedAttribute {
    pub token_field: String,
    pub attribute_id: AttributeId,
    pub description: String,
}

/// Overwrite policy for counterparts that already exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub overwrite_automatic: bool,
    pub overwrite_manual: bool,
    pub overwrite_standard: bool,
    pub create_automap: bool,
}

impl MergeOptions {
    pub fn allows(&self, kind: MappingKind) -> bool {
        match kind {
            MappingKind::Automatic => self.overwrite_automatic,
            MappingKind::Manual => self.overwrite_manual,
            MappingKind::Standard => self.overwrite_standard,
        }
    }
}

/// Counters returned by one merge call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub created_count: usize,
    pub duplicate_count: usize,
    pub skipped_count: usize,
    /// Participants rolled back after an error
    pub failed_count: usize,
    pub overwrite_automatic: bool,
    pub overwrite_manual: bool,
}

impl MergeSummary {
    pub fn for_options(options: &MergeOptions) -> Self {
        Self {
            overwrite_automatic: options.overwrite_automatic,
            overwrite_manual: options.overwrite_manual,
            ..Default::default()
        }
    }

    pub fn processed(&self) -> usize {
        self.created_count + self.duplicate_count + self.skipped_count + self.failed_count
    }
}

/// One value write the merge engine may perform for a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeWrite {
    pub token_field: String,
    pub attribute_id: String,
    pub kind: MappingKind,
    /// Created in this call; counts as automatically mapped
    pub provisioned: bool,
}

impl AttributeWrite {
    pub fn from_provisioned(attribute: &ProvisionedAttribute) -> Self {
        Self {
            token_field: attribute.token_field.clone(),
            attribute_id: attribute.attribute_id.to_string(),
            kind: MappingKind::Automatic,
            provisioned: true,
        }
    }

    pub fn from_mapped(attribute: &MappedAttribute) -> Self {
        Self {
            token_field: attribute.token_field.clone(),
            attribute_id: attribute.attribute_id.clone(),
            kind: attribute.kind,
            provisioned: false,
        }
    }

    /// Whether this write runs against an existing counterpart
    pub fn applies_to_duplicate(&self, options: &MergeOptions) -> bool {
        if self.provisioned {
            return options.overwrite_automatic;
        }
        options.allows(self.kind)
    }
}

/// What happened to one source record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    Duplicate,
    Skipped,
}
