//! Raw errors reported by a `RemoteDatabase`.
//!
//! These are what the transport hands back. `zone::ZoneResult::refine` turns
//! them into the closed set the zone client switches on.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Record, RecordId};

/// Error category reported by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ServiceUnavailable,
    RequestRateLimited,
    ZoneBusy,
    ZoneNotFound,
    UserDeletedZone,
    ChangeTokenExpired,
    ServerRecordChanged,
    PartialFailure,
    LimitExceeded,
    BatchRequestFailed,
    NetworkUnavailable,
    NetworkFailure,
    NotAuthenticated,
    PermissionFailure,
    QuotaExceeded,
    UnknownItem,
    InvalidArguments,
    InternalError,
    OperationCanceled,
    Other,
}

impl ErrorCode {
    /// Codes the server pairs with a retry-after hint when it wants a retry.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::ServiceUnavailable | ErrorCode::RequestRateLimited | ErrorCode::ZoneBusy
        )
    }

    /// Human-readable explanation.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::ServiceUnavailable => "service unavailable, please try again",
            ErrorCode::RequestRateLimited => "requests to the server are being rate limited",
            ErrorCode::ZoneBusy => "the server is too busy to handle the zone operation",
            ErrorCode::ZoneNotFound => "the record zone does not exist on the server",
            ErrorCode::UserDeletedZone => "the user deleted this zone",
            ErrorCode::ChangeTokenExpired => "the previous server change token is too old",
            ErrorCode::ServerRecordChanged => {
                "the record was rejected because the version on the server is different"
            }
            ErrorCode::PartialFailure => "some items failed, but the operation succeeded overall",
            ErrorCode::LimitExceeded => "the request to the server is too large",
            ErrorCode::BatchRequestFailed => "the entire batch was rejected",
            ErrorCode::NetworkUnavailable | ErrorCode::NetworkFailure => {
                "the internet connection appears to be offline"
            }
            ErrorCode::NotAuthenticated => "no authenticated account is available",
            ErrorCode::PermissionFailure => "the account is not permitted to do this",
            ErrorCode::QuotaExceeded => "saving would exceed the storage quota",
            ErrorCode::UnknownItem => "the specified record does not exist",
            ErrorCode::InvalidArguments => "the request contains bad information",
            ErrorCode::InternalError => "the server hit a non-recoverable error",
            ErrorCode::OperationCanceled => "the operation was explicitly canceled",
            ErrorCode::Other => "unhandled error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Failure of one record inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemError {
    pub record_id: RecordId,
    pub code: ErrorCode,

    /// Server's copy, present for `ServerRecordChanged`.
    pub server_record: Option<Record>,
    pub client_record: Option<Record>,
}

/// Error returned by any `RemoteDatabase` call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,

    /// Server-suggested wait before retrying.
    pub retry_after: Option<Duration>,

    /// Per-record failures for batch calls.
    pub items: Vec<ItemError>,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
            items: Vec::new(),
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn with_items(mut self, items: Vec<ItemError>) -> Self {
        self.items = items;
        self
    }
}

/// What the zone client knows about a rejected save.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDetail {
    pub message: String,
    pub items: Vec<ItemError>,
}

impl ConflictDetail {
    pub fn from_error(error: RemoteError) -> Self {
        Self {
            message: error.message,
            items: error.items,
        }
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.items.iter().map(|item| &item.record_id)
    }

    /// Server copy of `id`, when the server sent one.
    pub fn server_record(&self, id: &RecordId) -> Option<&Record> {
        self.items
            .iter()
            .find(|item| &item.record_id == id)
            .and_then(|item| item.server_record.as_ref())
    }
}

impl fmt::Display for ConflictDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} records)", self.message, self.items.len())
    }
}
