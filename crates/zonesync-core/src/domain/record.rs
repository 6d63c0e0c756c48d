//! Records, record keys and change tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::RecordId;

/// A typed bag of fields stored in a zone.
///
/// `change_tag` is the server's version stamp: `None` until the record has been
/// saved once, then replaced by the server on every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub record_type: String,
    #[serde(default)]
    pub change_tag: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(record_type: impl Into<String>, id: RecordId) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            change_tag: None,
            fields: Map::new(),
            modified_at: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            record_type: self.record_type.clone(),
            record_id: self.id.clone(),
        }
    }
}

/// What a deletion reports: the record's type and id, no fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub record_type: String,
    pub record_id: RecordId,
}

/// Opaque server bookmark into a zone's change history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(String);

impl ChangeToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
