//! Ports: the collaborators the zone client is written against.
//!
//! - `RemoteDatabase`: the remote record store
//! - `ZoneDelegate`: token persistence + local application of changes
//! - `ConflictResolver`: repairs rejected saves

pub mod conflict;
pub mod database;
pub mod delegate;
pub mod remote_error;

pub use self::conflict::{ClientWins, ConflictResolver};
pub use self::database::{
    ChangesPage, ModifyRequest, ModifyResponse, QualityOfService, QueryPage, QueryRequest,
    RemoteDatabase, RequestOptions, SavePolicy, ZoneRecord,
};
pub use self::delegate::ZoneDelegate;
pub use self::remote_error::{ConflictDetail, ErrorCode, ItemError, RemoteError};
