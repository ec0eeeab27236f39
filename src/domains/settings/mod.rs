pub mod types;

pub use types::CpdbSettings;
