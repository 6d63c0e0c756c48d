use thiserror::Error;

use crate::ports::{ConflictDetail, RemoteError};

/// Failures the zone client surfaces to callers.
///
/// Recoverable conditions (retry hints, missing zones, expired tokens, oversized
/// batches) are handled internally and only show up here when recovery itself
/// failed.
#[derive(Debug, Error)]
pub enum ZoneError {
    #[error(
        "the zone's data was deleted; remove the account and add it again to continue syncing"
    )]
    UserDeletedZone,

    #[error("unrecoverable problem with the account; remove the account and add it again")]
    CorruptAccount,

    #[error("an unexpected remote store error occurred")]
    Unknown,

    #[error("zone still missing after it was recreated")]
    ZoneNotFound,

    #[error("request too large even after splitting it into chunks")]
    LimitExceeded,

    #[error("change token expired on a fetch that started from scratch")]
    ChangeTokenExpired,

    #[error("save conflict: {0}")]
    Conflict(ConflictDetail),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("delegate failed: {0}")]
    Delegate(String),

    #[error("operation canceled")]
    Canceled,

    #[error("{operation} gave up after {attempts} retries")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },
}

/// Failure loading `ZoneConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
