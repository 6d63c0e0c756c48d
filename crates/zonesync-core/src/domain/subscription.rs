//! Zone subscriptions and the push notifications they produce.

use serde::{Deserialize, Serialize};

use super::ids::ZoneId;

/// Asks the server to push a notification whenever the zone changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub zone_id: ZoneId,

    /// Silent ("content available") push rather than a user-visible alert.
    pub content_available: bool,
}

impl Subscription {
    pub fn for_zone(zone_id: ZoneId) -> Self {
        Self {
            id: format!("zone-changes.{}", zone_id.zone_name),
            zone_id,
            content_available: true,
        }
    }
}

/// Decoded remote notification payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneNotification {
    #[serde(default)]
    pub zone_id: Option<ZoneId>,
}

impl ZoneNotification {
    pub fn for_zone(zone_id: ZoneId) -> Self {
        Self {
            zone_id: Some(zone_id),
        }
    }

    /// Notifications only carry a reliable zone name, so that is what is compared.
    pub fn concerns(&self, zone_id: &ZoneId) -> bool {
        self.zone_id
            .as_ref()
            .is_some_and(|note| note.zone_name == zone_id.zone_name)
    }
}
