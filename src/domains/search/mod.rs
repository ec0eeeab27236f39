pub mod compiler;
pub mod parser;
pub mod types;

pub use compiler::push_expression;
pub use types::{BoolOp, Condition, SearchExpression, SearchField, SearchOperator, SearchValue, StandardColumn};
