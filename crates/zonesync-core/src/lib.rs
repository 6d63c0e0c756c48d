//! zonesync-core
//!
//! Building blocks for keeping a local store in sync with one remote record zone.
//!
//! # Modules
//! - **queue**: single-threaded operation queue with dependencies and cascading cancellation
//! - **domain**: zone/record ids, records, queries, subscriptions
//! - **ports**: `RemoteDatabase`, `ZoneDelegate`, `ConflictResolver`
//! - **zone**: `CloudZone`, the sync client (result classification, retries, chunking)
//! - **impls**: in-memory ports for development and tests
//! - **observability**: serializable status views
//! - **error**: error types surfaced to callers
//!
//! Everything here runs on one orchestration context: a current-thread tokio
//! runtime driving a `LocalSet`.

pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod zone;

pub use crate::error::{ConfigError, ZoneError};
pub use crate::observability::QueueSnapshot;
pub use crate::queue::{OperationHandle, OperationId, OperationQueue, OperationState};
pub use crate::zone::{CloudZone, FetchSummary, ModifyOutcome, SaveStrategy, ZoneConfig};
