pub mod identifiers;
pub mod repository;

pub use identifiers::{quote_identifier, token_table, token_table_name, response_table, response_table_name};
pub use repository::{BatchDeleteResult, FindById};
