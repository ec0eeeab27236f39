pub mod attribute;
pub mod core;
pub mod cpdb;
pub mod participant;
pub mod permission;
pub mod search;
pub mod settings;
pub mod survey;
