//! InMemoryDatabase: a remote record store that lives in process memory.
//!
//! Used by the CLI demo and by tests. Besides answering `RemoteDatabase` calls it
//! can be scripted (`fail_next`) and inspected (`calls`, `records`).

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

use crate::domain::{
    ChangeToken, Query, QueryCursor, Record, RecordId, RecordKey, Subscription, ZoneId,
};
use crate::ports::{
    ChangesPage, ErrorCode, ItemError, ModifyRequest, ModifyResponse, QueryPage, QueryRequest,
    RemoteDatabase, RemoteError, RequestOptions, SavePolicy, ZoneRecord,
};

const DEFAULT_QUERY_PAGE_SIZE: usize = 100;
const DEFAULT_CHANGE_PAGE_SIZE: usize = 100;

/// `RemoteDatabase` entry points, for failure injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseCall {
    FetchZone,
    CreateZone,
    Query,
    FetchRecord,
    ModifyRecords,
    SaveSubscription,
    DeleteSubscription,
    FetchZoneChanges,
}

/// One entry of the call log.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call: DatabaseCall,
    pub at: Instant,
    pub saves: usize,
    pub deletes: usize,
    /// Answered with an injected failure.
    pub failed: bool,
}

enum Change {
    Saved(String),
    Deleted(RecordKey),
}

impl Change {
    fn record_name(&self) -> &str {
        match self {
            Change::Saved(name) => name,
            Change::Deleted(key) => &key.record_id.record_name,
        }
    }
}

struct ZoneData {
    created_at: DateTime<Utc>,

    /// Bumped when the zone is recreated; tokens from another epoch are expired.
    epoch: u64,
    records: BTreeMap<String, Record>,
    log: Vec<Change>,
}

#[derive(Default)]
struct State {
    zones: HashMap<ZoneId, ZoneData>,
    subscriptions: HashMap<String, Subscription>,
    failures: HashMap<DatabaseCall, VecDeque<RemoteError>>,

    /// Failures pinned to the n-th (0-based) call of a kind.
    pinned: HashMap<(DatabaseCall, usize), RemoteError>,
    calls: Vec<CallRecord>,
    next_epoch: u64,
    next_tag: u64,
}

impl State {
    fn create_zone(&mut self, zone: &ZoneId) -> ZoneRecord {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let data = self.zones.entry(zone.clone()).or_insert_with(|| ZoneData {
            created_at: Utc::now(),
            epoch,
            records: BTreeMap::new(),
            log: Vec::new(),
        });
        ZoneRecord {
            zone_id: zone.clone(),
            created_at: data.created_at,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CursorState {
    query: Query,
    offset: usize,
}

fn zone_not_found(zone: &ZoneId) -> RemoteError {
    RemoteError::new(ErrorCode::ZoneNotFound, format!("zone {zone} does not exist"))
}

fn token_for(epoch: u64, position: usize) -> ChangeToken {
    ChangeToken::new(format!("{epoch}:{position}"))
}

fn parse_token(token: &ChangeToken) -> Option<(u64, usize)> {
    let (epoch, position) = token.as_str().split_once(':')?;
    Some((epoch.parse().ok()?, position.parse().ok()?))
}

fn project(record: &Record, desired_keys: Option<&[String]>) -> Record {
    let mut record = record.clone();
    if let Some(keys) = desired_keys {
        record.fields.retain(|key, _| keys.contains(key));
    }
    record
}

pub struct InMemoryDatabase {
    state: RefCell<State>,
    max_batch: Option<usize>,
    query_page_size: usize,
    change_page_size: usize,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State::default()),
            max_batch: None,
            query_page_size: DEFAULT_QUERY_PAGE_SIZE,
            change_page_size: DEFAULT_CHANGE_PAGE_SIZE,
        }
    }

    /// Reject modify requests with more than `max` saves + deletes (`LimitExceeded`).
    pub fn with_max_batch(mut self, max: usize) -> Self {
        self.max_batch = Some(max);
        self
    }

    pub fn with_query_page_size(mut self, size: usize) -> Self {
        self.query_page_size = size.max(1);
        self
    }

    /// Change-log entries per `fetch_zone_changes` page.
    pub fn with_change_page_size(mut self, size: usize) -> Self {
        self.change_page_size = size.max(1);
        self
    }

    /// Create a zone directly, without going through a call.
    pub fn insert_zone(&self, zone: &ZoneId) {
        self.state.borrow_mut().create_zone(zone);
    }

    /// Drop a zone and everything in it, as if deleted on another device.
    pub fn remove_zone(&self, zone: &ZoneId) {
        self.state.borrow_mut().zones.remove(zone);
    }

    /// Invalidate every change token issued for `zone` so far.
    pub fn expire_change_tokens(&self, zone: &ZoneId) {
        let mut state = self.state.borrow_mut();
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        if let Some(data) = state.zones.get_mut(zone) {
            data.epoch = epoch;
        }
    }

    /// Answer the next `call` with `error`. Queued failures are used in order.
    pub fn fail_next(&self, call: DatabaseCall, error: RemoteError) {
        self.state
            .borrow_mut()
            .failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Answer the `index`-th call of kind `call` (counting from 0) with `error`.
    pub fn fail_call(&self, call: DatabaseCall, index: usize, error: RemoteError) {
        self.state.borrow_mut().pinned.insert((call, index), error);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.borrow().calls.clone()
    }

    pub fn calls_of(&self, call: DatabaseCall) -> Vec<CallRecord> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|record| record.call == call)
            .cloned()
            .collect()
    }

    pub fn has_zone(&self, zone: &ZoneId) -> bool {
        self.state.borrow().zones.contains_key(zone)
    }

    /// Records stored in `zone`, by record name.
    pub fn records(&self, zone: &ZoneId) -> Vec<Record> {
        self.state
            .borrow()
            .zones
            .get(zone)
            .map(|data| data.records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, id: &RecordId) -> Option<Record> {
        self.state
            .borrow()
            .zones
            .get(&id.zone_id)
            .and_then(|data| data.records.get(&id.record_name).cloned())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.borrow().subscriptions.values().cloned().collect()
    }

    /// Log the call and pop an injected failure, if any.
    fn begin(&self, call: DatabaseCall, saves: usize, deletes: usize) -> Result<(), RemoteError> {
        let mut state = self.state.borrow_mut();
        let index = state.calls.iter().filter(|record| record.call == call).count();
        let injected = match state.pinned.remove(&(call, index)) {
            Some(error) => Some(error),
            None => state.failures.get_mut(&call).and_then(VecDeque::pop_front),
        };
        trace!(?call, saves, deletes, injected = injected.is_some(), "database call");
        state.calls.push(CallRecord {
            call,
            at: Instant::now(),
            saves,
            deletes,
            failed: injected.is_some(),
        });
        match injected {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl RemoteDatabase for InMemoryDatabase {
    async fn fetch_zone(
        &self,
        zone: &ZoneId,
        _options: RequestOptions,
    ) -> Result<Option<ZoneRecord>, RemoteError> {
        self.begin(DatabaseCall::FetchZone, 0, 0)?;
        let state = self.state.borrow();
        let data = state.zones.get(zone).ok_or_else(|| zone_not_found(zone))?;
        Ok(Some(ZoneRecord {
            zone_id: zone.clone(),
            created_at: data.created_at,
        }))
    }

    async fn create_zone(
        &self,
        zone: &ZoneId,
        _options: RequestOptions,
    ) -> Result<ZoneRecord, RemoteError> {
        self.begin(DatabaseCall::CreateZone, 0, 0)?;
        Ok(self.state.borrow_mut().create_zone(zone))
    }

    async fn query(
        &self,
        zone: &ZoneId,
        request: &QueryRequest,
        desired_keys: Option<&[String]>,
        _options: RequestOptions,
    ) -> Result<QueryPage, RemoteError> {
        self.begin(DatabaseCall::Query, 0, 0)?;
        let state = self.state.borrow();
        let data = state.zones.get(zone).ok_or_else(|| zone_not_found(zone))?;

        let (query, offset) = match request {
            QueryRequest::Start(query) => (query.clone(), 0),
            QueryRequest::Continue(cursor) => {
                let cursor: CursorState = serde_json::from_str(cursor.as_str()).map_err(|e| {
                    RemoteError::new(ErrorCode::InvalidArguments, format!("bad cursor: {e}"))
                })?;
                (cursor.query, cursor.offset)
            }
        };

        let matching: Vec<&Record> = data
            .records
            .values()
            .filter(|record| query.matches(record))
            .collect();
        let records: Vec<Record> = matching
            .iter()
            .skip(offset)
            .take(self.query_page_size)
            .map(|record| project(record, desired_keys))
            .collect();

        let next = offset + records.len();
        let cursor = if next < matching.len() {
            let state = CursorState {
                query,
                offset: next,
            };
            let encoded = serde_json::to_string(&state).map_err(|e| {
                RemoteError::new(ErrorCode::InternalError, format!("cursor encoding: {e}"))
            })?;
            Some(QueryCursor::new(encoded))
        } else {
            None
        };

        Ok(QueryPage { records, cursor })
    }

    async fn fetch_record(
        &self,
        id: &RecordId,
        _options: RequestOptions,
    ) -> Result<Option<Record>, RemoteError> {
        self.begin(DatabaseCall::FetchRecord, 0, 0)?;
        let state = self.state.borrow();
        let data = state
            .zones
            .get(&id.zone_id)
            .ok_or_else(|| zone_not_found(&id.zone_id))?;
        Ok(data.records.get(&id.record_name).cloned())
    }

    async fn modify_records(
        &self,
        zone: &ZoneId,
        request: &ModifyRequest,
        _options: RequestOptions,
    ) -> Result<ModifyResponse, RemoteError> {
        let batch = request.saves.len() + request.deletes.len();
        self.begin(DatabaseCall::ModifyRecords, request.saves.len(), request.deletes.len())?;

        let mut state = self.state.borrow_mut();
        let State {
            zones, next_tag, ..
        } = &mut *state;
        let data = zones.get_mut(zone).ok_or_else(|| zone_not_found(zone))?;

        if let Some(max) = self.max_batch
            && batch > max
        {
            return Err(RemoteError::new(
                ErrorCode::LimitExceeded,
                format!("{batch} items in one request, limit is {max}"),
            ));
        }

        let mut conflicts = Vec::new();
        if request.policy == SavePolicy::IfServerRecordUnchanged {
            for record in &request.saves {
                if let Some(server) = data.records.get(&record.id.record_name)
                    && server.change_tag != record.change_tag
                {
                    conflicts.push(ItemError {
                        record_id: record.id.clone(),
                        code: ErrorCode::ServerRecordChanged,
                        server_record: Some(server.clone()),
                        client_record: Some(record.clone()),
                    });
                }
            }
        }

        if !conflicts.is_empty() && request.atomic {
            let code = if batch == 1 {
                ErrorCode::ServerRecordChanged
            } else {
                ErrorCode::PartialFailure
            };
            return Err(RemoteError::new(code, "records changed on the server").with_items(conflicts));
        }

        let rejected: HashSet<&RecordId> = conflicts.iter().map(|item| &item.record_id).collect();
        let mut response = ModifyResponse::default();

        for record in &request.saves {
            if rejected.contains(&record.id) {
                continue;
            }
            let name = record.id.record_name.clone();
            let mut stored = match (request.policy, data.records.get(&name)) {
                (SavePolicy::ChangedKeys, Some(existing)) => {
                    let mut merged = existing.clone();
                    merged.record_type = record.record_type.clone();
                    for (key, value) in &record.fields {
                        merged.fields.insert(key.clone(), value.clone());
                    }
                    merged
                }
                _ => record.clone(),
            };
            *next_tag += 1;
            stored.change_tag = Some(format!("t{next_tag}"));
            stored.modified_at = Some(Utc::now());
            data.records.insert(name.clone(), stored.clone());
            data.log.push(Change::Saved(name));
            response.saved.push(stored);
        }

        for id in &request.deletes {
            if let Some(removed) = data.records.remove(&id.record_name) {
                data.log.push(Change::Deleted(removed.key()));
                response.deleted.push(id.clone());
            }
        }

        if !conflicts.is_empty() {
            return Err(
                RemoteError::new(ErrorCode::PartialFailure, "some records changed on the server")
                    .with_items(conflicts),
            );
        }
        Ok(response)
    }

    async fn save_subscription(
        &self,
        subscription: &Subscription,
        _options: RequestOptions,
    ) -> Result<Subscription, RemoteError> {
        self.begin(DatabaseCall::SaveSubscription, 0, 0)?;
        let mut state = self.state.borrow_mut();
        if !state.zones.contains_key(&subscription.zone_id) {
            return Err(zone_not_found(&subscription.zone_id));
        }
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(subscription.clone())
    }

    async fn delete_subscription(
        &self,
        subscription_id: &str,
        _options: RequestOptions,
    ) -> Result<(), RemoteError> {
        self.begin(DatabaseCall::DeleteSubscription, 0, 0)?;
        match self.state.borrow_mut().subscriptions.remove(subscription_id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::new(
                ErrorCode::UnknownItem,
                format!("no subscription {subscription_id}"),
            )),
        }
    }

    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        since: Option<&ChangeToken>,
        _options: RequestOptions,
    ) -> Result<ChangesPage, RemoteError> {
        self.begin(DatabaseCall::FetchZoneChanges, 0, 0)?;
        let state = self.state.borrow();
        let data = state.zones.get(zone).ok_or_else(|| zone_not_found(zone))?;

        let from = match since {
            None => 0,
            Some(token) => match parse_token(token) {
                Some((epoch, position)) if epoch == data.epoch && position <= data.log.len() => {
                    position
                }
                _ => {
                    return Err(RemoteError::new(
                        ErrorCode::ChangeTokenExpired,
                        format!("change token {} is no longer valid", token.as_str()),
                    ));
                }
            },
        };
        let to = (from + self.change_page_size).min(data.log.len());
        let entries = &data.log[from..to];

        // Only the last entry per record within a page counts.
        let mut last = HashMap::new();
        for (index, change) in entries.iter().enumerate() {
            last.insert(change.record_name(), index);
        }

        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        for (index, change) in entries.iter().enumerate() {
            if last.get(change.record_name()) != Some(&index) {
                continue;
            }
            match change {
                Change::Saved(name) => {
                    if let Some(record) = data.records.get(name) {
                        changed.push(record.clone());
                    }
                }
                Change::Deleted(key) => deleted.push(key.clone()),
            }
        }

        Ok(ChangesPage {
            changed,
            deleted,
            token: token_for(data.epoch, to),
            more_coming: to < data.log.len(),
        })
    }
}
