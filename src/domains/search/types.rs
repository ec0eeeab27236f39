use serde::{Deserialize, Serialize};

/// Plain participant columns that may be searched directly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StandardColumn {
    Firstname,
    Lastname,
    Language,
    Blacklisted,
    OwnerUid,
}

impl StandardColumn {
    pub fn column(&self) -> &'static str {
        match self {
            StandardColumn::Firstname => "firstname",
            StandardColumn::Lastname => "lastname",
            StandardColumn::Language => "language",
            StandardColumn::Blacklisted => "blacklisted",
            StandardColumn::OwnerUid => "owner_uid",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "firstname" => Some(StandardColumn::Firstname),
            "lastname" => Some(StandardColumn::Lastname),
            "language" => Some(StandardColumn::Language),
            "blacklisted" => Some(StandardColumn::Blacklisted),
            "owner_uid" => Some(StandardColumn::OwnerUid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchField {
    Standard(StandardColumn),
    Email,
    ParticipantId,
    /// Full name of the owning user
    OwnerName,
    /// Title of any linked survey
    SurveyTitle,
    /// Id of any linked survey
    SurveyId,
    /// Number of linked surveys
    SurveyCount,
    /// Value of a central attribute
    Attribute(i64),
}

impl SearchField {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "email" => Some(SearchField::Email),
            "participant_id" => Some(SearchField::ParticipantId),
            "owner_name" => Some(SearchField::OwnerName),
            "survey" => Some(SearchField::SurveyTitle),
            "surveyid" => Some(SearchField::SurveyId),
            "surveys" => Some(SearchField::SurveyCount),
            other => {
                if let Some(column) = StandardColumn::from_str(other) {
                    return Some(SearchField::Standard(column));
                }
                match other.parse::<i64>() {
                    Ok(id) if id > 0 => Some(SearchField::Attribute(id)),
                    _ => None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchOperator {
    Equal,
    Contains,
    BeginsWith,
    NotEqual,
    NotContains,
    GreaterThan,
    LessThan,
}

impl SearchOperator {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "equal" => Some(SearchOperator::Equal),
            "contains" => Some(SearchOperator::Contains),
            "beginswith" => Some(SearchOperator::BeginsWith),
            "notequal" => Some(SearchOperator::NotEqual),
            "notcontains" => Some(SearchOperator::NotContains),
            "greaterthan" => Some(SearchOperator::GreaterThan),
            "lessthan" => Some(SearchOperator::LessThan),
            _ => None,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            SearchOperator::Equal => "=",
            SearchOperator::Contains | SearchOperator::BeginsWith => "LIKE",
            SearchOperator::NotEqual => "!=",
            SearchOperator::NotContains => "NOT LIKE",
            SearchOperator::GreaterThan => ">",
            SearchOperator::LessThan => "<",
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            SearchOperator::Contains | SearchOperator::BeginsWith | SearchOperator::NotContains
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOp {
    And,
    Or,
}

impl BoolOp {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "and" => Some(BoolOp::And),
            "or" => Some(BoolOp::Or),
            _ => None,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            BoolOp::And => " AND ",
            BoolOp::Or => " OR ",
        }
    }
}

/// Bound value of a condition. Whole numbers compare numerically, everything else as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchValue {
    Text(String),
    Integer(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field: SearchField,
    pub operator: SearchOperator,
    pub value: String,
}

impl Condition {
    /// Value as it is bound: wrapped in `%` for pattern operators, numeric when it parses as one.
    pub fn bound_value(&self) -> SearchValue {
        match self.operator {
            SearchOperator::Contains | SearchOperator::NotContains => {
                SearchValue::Text(format!("%{}%", self.value))
            }
            SearchOperator::BeginsWith => SearchValue::Text(format!("{}%", self.value)),
            _ => match self.value.parse::<i64>() {
                Ok(n) => SearchValue::Integer(n),
                Err(_) => SearchValue::Text(self.value.clone()),
            },
        }
    }
}

/// `first (op cond)*`, combined left to right
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchExpression {
    pub first: Condition,
    pub rest: Vec<(BoolOp, Condition)>,
}

impl SearchExpression {
    pub fn conditions(&self) -> impl Iterator<Item = &Condition> {
        std::iter::once(&self.first).chain(self.rest.iter().map(|(_, c)| c))
    }

    /// Attribute ids referenced anywhere in the expression
    pub fn attribute_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .conditions()
            .filter_map(|c| match c.field {
                SearchField::Attribute(id) => Some(id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}
