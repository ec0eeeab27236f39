use crate::domains::search::types::{Condition, SearchExpression, SearchField, SearchOperator, SearchValue};
use sqlx::{QueryBuilder, Sqlite};

// Expected aliases in the surrounding query:
//   p     participants
//   luser users joined on p.owner_uid

/// Append the expression as one parenthesised predicate. Conditions combine left to right.
pub fn push_expression<'a>(builder: &mut QueryBuilder<'a, Sqlite>, expr: &SearchExpression) {
    builder.push("(");
    for _ in 0..expr.rest.len() {
        builder.push("(");
    }
    push_condition(builder, &expr.first);
    for (op, condition) in &expr.rest {
        builder.push(op.sql());
        push_condition(builder, condition);
        builder.push(")");
    }
    builder.push(")");
}

fn push_value<'a>(builder: &mut QueryBuilder<'a, Sqlite>, condition: &Condition) {
    match condition.bound_value() {
        SearchValue::Integer(n) => builder.push_bind(n),
        SearchValue::Text(s) => builder.push_bind(s),
    };
}

fn push_comparison<'a>(builder: &mut QueryBuilder<'a, Sqlite>, lhs: &str, condition: &Condition) {
    builder.push(lhs);
    builder.push(" ");
    builder.push(condition.operator.sql());
    builder.push(" ");
    push_value(builder, condition);
}

fn push_condition<'a>(builder: &mut QueryBuilder<'a, Sqlite>, condition: &Condition) {
    builder.push("(");
    match condition.field {
        SearchField::Standard(column) => {
            push_comparison(builder, &format!("p.{}", column.column()), condition);
        }
        SearchField::Email => push_comparison(builder, "p.email", condition),
        SearchField::ParticipantId => push_comparison(builder, "p.participant_id", condition),
        SearchField::OwnerName => push_comparison(builder, "luser.full_name", condition),
        SearchField::SurveyTitle => {
            builder.push(
                "p.participant_id IN (SELECT sl.participant_id FROM survey_links sl \
                 JOIN surveys_languagesettings sls ON sl.survey_id = sls.surveyls_survey_id WHERE ",
            );
            push_comparison(builder, "sls.surveyls_title", condition);
            builder.push(" GROUP BY sl.participant_id)");
        }
        SearchField::SurveyId => {
            builder.push("p.participant_id IN (SELECT sl.participant_id FROM survey_links sl WHERE ");
            push_comparison(builder, "sl.survey_id", condition);
            builder.push(" GROUP BY sl.participant_id)");
        }
        SearchField::SurveyCount => {
            builder.push("p.participant_id IN (SELECT sl.participant_id FROM survey_links sl GROUP BY sl.participant_id HAVING ");
            push_comparison(builder, "COUNT(*)", condition);
            builder.push(")");
            // Participants without any link have a count of zero
            if matches!(condition.operator, SearchOperator::LessThan) {
                builder.push(" OR p.participant_id NOT IN (SELECT sl.participant_id FROM survey_links sl)");
            }
        }
        SearchField::Attribute(attribute_id) => {
            builder.push("p.participant_id IN (SELECT pa.participant_id FROM participant_attribute pa WHERE pa.attribute_id = ");
            builder.push_bind(attribute_id);
            builder.push(" AND ");
            push_comparison(builder, "pa.value", condition);
            builder.push(")");
        }
    }
    builder.push(")");
}
