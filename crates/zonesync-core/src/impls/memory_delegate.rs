//! MemoryDelegate: keeps tokens and a replica of the zone in memory.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::domain::{ChangeToken, Record, RecordId, RecordKey};
use crate::error::ZoneError;
use crate::ports::ZoneDelegate;

/// Ids of one batch handed to `apply_changes`, in the order received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedBatch {
    pub changed: Vec<RecordId>,
    pub deleted: Vec<RecordId>,
}

/// Local side of a zone for the demo and tests.
#[derive(Default)]
pub struct MemoryDelegate {
    tokens: RefCell<HashMap<String, ChangeToken>>,
    replica: RefCell<BTreeMap<RecordId, Record>>,
    batches: RefCell<Vec<AppliedBatch>>,
    failures: RefCell<VecDeque<String>>,
}

impl MemoryDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self, key: &str) -> Option<ChangeToken> {
        self.tokens.borrow().get(key).cloned()
    }

    pub fn set_token(&self, key: impl Into<String>, token: ChangeToken) {
        self.tokens.borrow_mut().insert(key.into(), token);
    }

    /// Reject the next `apply_changes` call with `message`.
    pub fn fail_next_apply(&self, message: impl Into<String>) {
        self.failures.borrow_mut().push_back(message.into());
    }

    pub fn replica(&self) -> Vec<Record> {
        self.replica.borrow().values().cloned().collect()
    }

    pub fn batches(&self) -> Vec<AppliedBatch> {
        self.batches.borrow().clone()
    }
}

#[async_trait(?Send)]
impl ZoneDelegate for MemoryDelegate {
    fn find_change_token(&self, key: &str) -> Option<ChangeToken> {
        self.token(key)
    }

    fn store_change_token(&self, token: Option<ChangeToken>, key: &str) {
        let mut tokens = self.tokens.borrow_mut();
        match token {
            Some(token) => {
                tokens.insert(key.to_string(), token);
            }
            None => {
                tokens.remove(key);
            }
        }
    }

    async fn apply_changes(
        &self,
        changed: Vec<Record>,
        deleted: Vec<RecordKey>,
    ) -> Result<(), ZoneError> {
        if let Some(message) = self.failures.borrow_mut().pop_front() {
            return Err(ZoneError::Delegate(message));
        }

        debug!(changed = changed.len(), deleted = deleted.len(), "replica updated");
        let batch = AppliedBatch {
            changed: changed.iter().map(|record| record.id.clone()).collect(),
            deleted: deleted.iter().map(|key| key.record_id.clone()).collect(),
        };

        let mut replica = self.replica.borrow_mut();
        for record in changed {
            replica.insert(record.id.clone(), record);
        }
        for key in deleted {
            replica.remove(&key.record_id);
        }
        self.batches.borrow_mut().push(batch);
        Ok(())
    }
}
