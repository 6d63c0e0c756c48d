//! Record queries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::Record;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    All,
    Equals { field: String, value: Value },
}

impl Predicate {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Equals { field, value } => record.field(field) == Some(value),
        }
    }
}

/// Records of one type matching a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub record_type: String,
    pub predicate: Predicate,
}

impl Query {
    pub fn all(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            predicate: Predicate::All,
        }
    }

    pub fn equals(
        record_type: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            predicate: Predicate::Equals {
                field: field.into(),
                value: value.into(),
            },
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.record_type == self.record_type && self.predicate.matches(record)
    }
}

/// Server-issued position for continuing a paged query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryCursor(String);

impl QueryCursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecordId, ZoneId};

    fn article(name: &str, feed: &str) -> Record {
        Record::new("Article", RecordId::new(name, ZoneId::for_current_user("Articles")))
            .with_field("feed", feed)
    }

    #[test]
    fn equals_matches_field_value_and_type() {
        let query = Query::equals("Article", "feed", "a");

        assert!(query.matches(&article("1", "a")));
        assert!(!query.matches(&article("2", "b")));

        let mut other_type = article("3", "a");
        other_type.record_type = "Feed".into();
        assert!(!query.matches(&other_type));
    }

    #[test]
    fn all_matches_every_record_of_the_type() {
        assert!(Query::all("Article").matches(&article("1", "x")));
    }
}
