//! Domain model: zone and record identifiers, records, queries, subscriptions.

pub mod ids;
pub mod query;
pub mod record;
pub mod subscription;

pub use self::ids::{DEFAULT_OWNER, RecordId, ZoneId};
pub use self::query::{Predicate, Query, QueryCursor};
pub use self::record::{ChangeToken, Record, RecordKey};
pub use self::subscription::{Subscription, ZoneNotification};
