//! RemoteDatabase port: the record store the zone client talks to.
//!
//! The transport is not part of this crate. Anything able to answer these calls
//! (a real cloud backend, `impls::InMemoryDatabase`, a test double) plugs in here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::remote_error::RemoteError;
use crate::domain::{
    ChangeToken, Query, QueryCursor, Record, RecordId, RecordKey, Subscription, ZoneId,
};

/// Scheduling hint passed along with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    UserInteractive,
    UserInitiated,
    Default,
    Utility,
    Background,
}

impl QualityOfService {
    /// `UserInitiated` on macOS, where lower classes can stall for a long time;
    /// `Default` elsewhere, where `UserInitiated` starves the UI.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "macos") {
            QualityOfService::UserInitiated
        } else {
            QualityOfService::Default
        }
    }
}

impl Default for QualityOfService {
    fn default() -> Self {
        Self::platform_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub quality_of_service: QualityOfService,
}

/// Zone metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub zone_id: ZoneId,
    pub created_at: DateTime<Utc>,
}

/// First page of a query, or a continuation.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRequest {
    Start(Query),
    Continue(QueryCursor),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage {
    pub records: Vec<Record>,

    /// Present while more results remain.
    pub cursor: Option<QueryCursor>,
}

/// How a save treats the server's copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavePolicy {
    /// Write only the fields present on the client record; ignore change tags.
    ChangedKeys,
    /// Reject a record whose server copy has a different change tag.
    IfServerRecordUnchanged,
    /// Replace the server record entirely.
    AllKeys,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifyRequest {
    pub saves: Vec<Record>,
    pub deletes: Vec<RecordId>,
    pub policy: SavePolicy,

    /// All-or-nothing. A non-atomic request may apply part of the batch and
    /// report the rest as a `PartialFailure`.
    pub atomic: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModifyResponse {
    /// Records as stored by the server, with fresh change tags.
    pub saved: Vec<Record>,
    pub deleted: Vec<RecordId>,
}

/// One page of a zone's change history.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesPage {
    pub changed: Vec<Record>,
    pub deleted: Vec<RecordKey>,

    /// Token covering everything up to and including this page.
    pub token: ChangeToken,
    pub more_coming: bool,
}

/// Remote record store.
///
/// Calls are awaited on the orchestration context, so implementations need not
/// be `Send`.
#[async_trait(?Send)]
pub trait RemoteDatabase {
    /// `ZoneNotFound` when the zone doesn't exist.
    async fn fetch_zone(
        &self,
        zone: &ZoneId,
        options: RequestOptions,
    ) -> Result<Option<ZoneRecord>, RemoteError>;

    /// Idempotent: creating an existing zone returns it.
    async fn create_zone(
        &self,
        zone: &ZoneId,
        options: RequestOptions,
    ) -> Result<ZoneRecord, RemoteError>;

    /// `desired_keys` limits the fields returned; `None` returns them all.
    async fn query(
        &self,
        zone: &ZoneId,
        request: &QueryRequest,
        desired_keys: Option<&[String]>,
        options: RequestOptions,
    ) -> Result<QueryPage, RemoteError>;

    async fn fetch_record(
        &self,
        id: &RecordId,
        options: RequestOptions,
    ) -> Result<Option<Record>, RemoteError>;

    async fn modify_records(
        &self,
        zone: &ZoneId,
        request: &ModifyRequest,
        options: RequestOptions,
    ) -> Result<ModifyResponse, RemoteError>;

    async fn save_subscription(
        &self,
        subscription: &Subscription,
        options: RequestOptions,
    ) -> Result<Subscription, RemoteError>;

    async fn delete_subscription(
        &self,
        subscription_id: &str,
        options: RequestOptions,
    ) -> Result<(), RemoteError>;

    /// Changes since `since` (everything when `None`), one page at a time.
    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        since: Option<&ChangeToken>,
        options: RequestOptions,
    ) -> Result<ChangesPage, RemoteError>;
}
