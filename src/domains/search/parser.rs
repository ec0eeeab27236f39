use crate::domains::search::types::{BoolOp, Condition, SearchExpression, SearchField, SearchOperator};
use crate::errors::{DomainError, DomainResult, ValidationError};

pub const TOKEN_SEPARATOR: &str = "||";

fn invalid(reason: &str) -> DomainError {
    DomainError::Validation(ValidationError::format("search", reason))
}

impl SearchExpression {
    /// Parse `field||operator||value||and|or||field||operator||value...`.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let tokens: Vec<&str> = raw.split(TOKEN_SEPARATOR).collect();
        Self::from_tokens(&tokens)
    }

    pub fn from_tokens(tokens: &[&str]) -> DomainResult<Self> {
        if tokens.len() < 3 || (tokens.len() - 3) % 4 != 0 {
            return Err(invalid(&format!(
                "expected field, operator and value groups joined by and/or, got {} tokens",
                tokens.len()
            )));
        }

        let first = parse_condition(&tokens[0..3])?;
        let rest = tokens[3..]
            .chunks(4)
            .map(|group| {
                let op = BoolOp::from_str(group[0])
                    .ok_or_else(|| invalid(&format!("unknown boolean operator '{}'", group[0])))?;
                Ok((op, parse_condition(&group[1..4])?))
            })
            .collect::<DomainResult<Vec<_>>>()?;

        Ok(SearchExpression { first, rest })
    }
}

fn parse_condition(group: &[&str]) -> DomainResult<Condition> {
    let field = SearchField::from_str(group[0])
        .ok_or_else(|| invalid(&format!("unknown search field '{}'", group[0])))?;
    let operator = SearchOperator::from_str(group[1])
        .ok_or_else(|| invalid(&format!("unknown search operator '{}'", group[1])))?;
    Ok(Condition {
        field,
        operator,
        value: group[2].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::search::types::{SearchValue, StandardColumn};

    #[test]
    fn test_parse_single_condition() {
        let expr = SearchExpression::parse("firstname||equal||Jason").unwrap();
        assert_eq!(expr.first.field, SearchField::Standard(StandardColumn::Firstname));
        assert_eq!(expr.first.operator, SearchOperator::Equal);
        assert!(expr.rest.is_empty());
    }

    #[test]
    fn test_parse_chain() {
        let expr = SearchExpression::parse("email||contains||gov||AND||12||beginswith||fem||or||surveys||greaterthan||2").unwrap();
        assert_eq!(expr.rest.len(), 2);
        assert_eq!(expr.rest[0].0, BoolOp::And);
        assert_eq!(expr.rest[0].1.field, SearchField::Attribute(12));
        assert_eq!(expr.rest[1].0, BoolOp::Or);
        assert_eq!(expr.rest[1].1.bound_value(), SearchValue::Integer(2));
        assert_eq!(expr.first.bound_value(), SearchValue::Text("%gov%".to_string()));
        assert_eq!(expr.attribute_ids(), vec![12]);
    }

    #[test]
    fn test_rejects_unknown_field() {
        let err = SearchExpression::parse("password||equal||x").unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(SearchExpression::parse("firstname; DROP TABLE participants||equal||x").is_err());
        assert!(SearchExpression::parse("0||equal||x").is_err());
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(SearchExpression::parse("firstname||equal").is_err());
        assert!(SearchExpression::parse("firstname||equal||a||and||lastname").is_err());
        assert!(SearchExpression::parse("firstname||like||a").is_err());
        assert!(SearchExpression::parse("firstname||equal||a||xor||lastname||equal||b").is_err());
    }
}
