//! In-memory implementations of the ports.
//!
//! - **InMemoryDatabase**: a scriptable remote record store
//! - **MemoryDelegate**: token storage plus a local replica
//!
//! Real backends implement `RemoteDatabase` / `ZoneDelegate` in their own crates.

pub mod memory_database;
pub mod memory_delegate;

pub use self::memory_database::{CallRecord, DatabaseCall, InMemoryDatabase};
pub use self::memory_delegate::{AppliedBatch, MemoryDelegate};
