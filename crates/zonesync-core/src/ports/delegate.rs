//! ZoneDelegate port: the local side of a zone.

use async_trait::async_trait;

use crate::domain::{ChangeToken, Record, RecordKey};
use crate::error::ZoneError;

/// Persists change tokens and applies remote changes to local storage.
#[async_trait(?Send)]
pub trait ZoneDelegate {
    fn find_change_token(&self, key: &str) -> Option<ChangeToken>;

    /// `None` removes the stored token.
    fn store_change_token(&self, token: Option<ChangeToken>, key: &str);

    /// Apply one batch of remote changes.
    ///
    /// Batches arrive one at a time, in fetch order. An error stops the fetch that
    /// produced the batch; its change token is not persisted.
    async fn apply_changes(
        &self,
        changed: Vec<Record>,
        deleted: Vec<RecordKey>,
    ) -> Result<(), ZoneError>;
}
