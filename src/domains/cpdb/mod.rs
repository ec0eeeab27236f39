pub mod directions;
pub mod duplicate_detector;
pub mod merge_engine;
pub mod provisioner;
pub mod schema_inspector;
pub mod service;
pub mod types;
pub mod value_propagator;

pub use merge_engine::{MergeDirection, MergeEngine};
pub use service::{CpdbService, CpdbServiceImpl, CpdbServices};
pub use types::{MappedAttribute, MappingKind, MergeOptions, MergeSummary, ProvisionedAttribute};
