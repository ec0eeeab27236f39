pub mod repository;
pub mod types;

pub use repository::{SqliteSurveyRepository, SurveyRepository};
pub use types::{
    FieldDescriptions, NewTokenRecord, Survey, SurveyLink, TokenFieldDescription, TokenRecord, TokenRowRef,
};
