//! Zone and record identifiers.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Owner name the remote store substitutes for "the current user".
pub const DEFAULT_OWNER: &str = "__defaultOwner__";

/// Identifies a record zone: a named partition owned by one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId {
    pub zone_name: String,
    pub owner_name: String,
}

impl ZoneId {
    pub fn new(zone_name: impl Into<String>, owner_name: impl Into<String>) -> Self {
        Self {
            zone_name: zone_name.into(),
            owner_name: owner_name.into(),
        }
    }

    /// A zone owned by the signed-in account.
    pub fn for_current_user(zone_name: impl Into<String>) -> Self {
        Self::new(zone_name, DEFAULT_OWNER)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.zone_name, self.owner_name)
    }
}

/// Identifies a record inside a zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub record_name: String,
    pub zone_id: ZoneId,
}

impl RecordId {
    pub fn new(record_name: impl Into<String>, zone_id: ZoneId) -> Self {
        Self {
            record_name: record_name.into(),
            zone_id,
        }
    }

    /// Fresh id with a ULID record name.
    pub fn generate(zone_id: ZoneId) -> Self {
        let timestamp_ms = Utc::now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        Self::new(ulid.to_string(), zone_id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.zone_id.zone_name, self.record_name)
    }
}
