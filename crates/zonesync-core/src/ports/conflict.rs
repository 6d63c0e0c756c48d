//! ConflictResolver port: repairs saves the server rejected as stale.

use async_trait::async_trait;

use super::remote_error::ConflictDetail;
use crate::domain::Record;
use crate::error::ZoneError;

#[async_trait(?Send)]
pub trait ConflictResolver {
    /// Return corrected versions of `records` to save again.
    ///
    /// `detail` carries the server copies of the rejected records.
    async fn resolve(
        &self,
        records: Vec<Record>,
        detail: &ConflictDetail,
    ) -> Result<Vec<Record>, ZoneError>;
}

/// Keeps the client's fields and adopts the server's change tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientWins;

#[async_trait(?Send)]
impl ConflictResolver for ClientWins {
    async fn resolve(
        &self,
        records: Vec<Record>,
        detail: &ConflictDetail,
    ) -> Result<Vec<Record>, ZoneError> {
        Ok(records
            .into_iter()
            .map(|mut record| {
                if let Some(server) = detail.server_record(&record.id) {
                    record.change_tag = server.change_tag.clone();
                }
                record
            })
            .collect())
    }
}
