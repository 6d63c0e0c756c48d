//! Zone sync client.
//!
//! `CloudZone` wraps one record zone of a `RemoteDatabase`. Every call:
//! - classifies the remote result with `ZoneResult::refine`
//! - sleeps out server retry hints without blocking the orchestration context
//! - recreates a missing zone once and tries again
//! - surfaces only what it could not recover from
//!
//! Change batches reach the `ZoneDelegate` through operations on the shared
//! `OperationQueue`, one batch at a time.

mod apply_changes;
mod config;
mod result;
mod retry;

pub use self::config::{DEFAULT_CHUNK_SIZE, ZoneConfig};
pub use self::result::ZoneResult;
pub use self::retry::RetryPolicy;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use self::apply_changes::apply_on_queue;
use self::retry::RetryState;
use crate::domain::{
    ChangeToken, Query, Record, RecordId, RecordKey, Subscription, ZoneId, ZoneNotification,
};
use crate::error::{ConfigError, ZoneError};
use crate::ports::{
    ConflictResolver, ModifyRequest, QueryRequest, RemoteDatabase, RemoteError, RequestOptions,
    SavePolicy, ZoneDelegate, ZoneRecord,
};
use crate::queue::OperationQueue;

const CHANGE_TOKEN_PREFIX: &str = "zonesync.server.token";

/// How `modify` treats records that changed on the server.
#[derive(Clone)]
pub enum SaveStrategy {
    /// Write the changed fields regardless of the server's version.
    Overwrite,

    /// Reject stale records, let the resolver fix them, save again.
    IfServerRecordUnchanged(Rc<dyn ConflictResolver>),
}

impl SaveStrategy {
    fn save_policy(&self) -> SavePolicy {
        match self {
            SaveStrategy::Overwrite => SavePolicy::ChangedKeys,
            SaveStrategy::IfServerRecordUnchanged(_) => SavePolicy::IfServerRecordUnchanged,
        }
    }
}

impl fmt::Debug for SaveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveStrategy::Overwrite => f.write_str("Overwrite"),
            SaveStrategy::IfServerRecordUnchanged(_) => f.write_str("IfServerRecordUnchanged"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModifyOutcome {
    /// Server copies, with fresh change tags.
    pub saved: Vec<Record>,
    pub deleted: Vec<RecordId>,
}

impl ModifyOutcome {
    fn absorb(&mut self, other: ModifyOutcome) {
        self.saved.extend(other.saved);
        self.deleted.extend(other.deleted);
    }
}

/// What one `fetch_changes_in_zone` call delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    pub pages: usize,
    pub batches: usize,
    pub changed: usize,
    pub deleted: usize,
}

pub struct CloudZone {
    zone_id: ZoneId,
    database: Rc<dyn RemoteDatabase>,
    delegate: Rc<dyn ZoneDelegate>,
    queue: OperationQueue,
    config: ZoneConfig,
}

impl CloudZone {
    /// Fails when `config` does not pass `ZoneConfig::validate`.
    pub fn new(
        zone_id: ZoneId,
        database: Rc<dyn RemoteDatabase>,
        delegate: Rc<dyn ZoneDelegate>,
        queue: OperationQueue,
        config: ZoneConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            zone_id,
            database,
            delegate,
            queue,
            config,
        })
    }

    pub fn zone_id(&self) -> &ZoneId {
        &self.zone_id
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    // ---- change tokens ----

    /// Key the change token is stored under.
    pub fn change_token_key(&self) -> String {
        format!(
            "{CHANGE_TOKEN_PREFIX}.{}.{}",
            self.zone_id.zone_name, self.zone_id.owner_name
        )
    }

    /// Key used before tokens were scoped by owner.
    pub fn old_change_token_key(&self) -> String {
        format!("{CHANGE_TOKEN_PREFIX}.{}", self.zone_id.zone_name)
    }

    pub fn change_token(&self) -> Option<ChangeToken> {
        self.delegate.find_change_token(&self.change_token_key())
    }

    fn store_change_token(&self, token: Option<ChangeToken>) {
        self.delegate
            .store_change_token(token, &self.change_token_key());
    }

    /// Forget the token; the next fetch starts from scratch.
    pub fn reset_change_token(&self) {
        debug!(zone = %self.zone_id, "resetting change token");
        self.store_change_token(None);
    }

    /// Move a token stored under the old key to the current one.
    pub fn migrate_change_token(&self) {
        let old_key = self.old_change_token_key();
        if let Some(token) = self.delegate.find_change_token(&old_key) {
            self.store_change_token(Some(token));
            self.delegate.store_change_token(None, &old_key);
            info!(zone = %self.zone_id, "migrated change token to owner-scoped key");
        }
    }

    pub fn generate_record_id(&self) -> RecordId {
        RecordId::generate(self.zone_id.clone())
    }

    // ---- plumbing ----

    fn options(&self) -> RequestOptions {
        self.config.request_options()
    }

    fn retry_state(&self, operation: &'static str) -> RetryState<'_> {
        RetryState::new(&self.config.retry, &self.zone_id, operation)
    }

    fn classify<T>(&self, result: Result<T, RemoteError>) -> ZoneResult<T> {
        ZoneResult::refine_with(result, &self.config.retry)
    }

    /// Recreate the zone, at most once per call.
    async fn recreate_zone(
        &self,
        repaired: &mut bool,
        operation: &'static str,
    ) -> Result<(), ZoneError> {
        if *repaired {
            error!(zone = %self.zone_id, operation, "zone still missing after recreating it");
            return Err(ZoneError::ZoneNotFound);
        }
        *repaired = true;
        warn!(zone = %self.zone_id, operation, "zone not found, recreating it");
        self.create_zone_record().await.map(|_| ())
    }

    /// Issue `call` until it succeeds or fails for good.
    ///
    /// Handles retry hints and, when `recreate_missing_zone` is set, a missing zone.
    async fn perform<T, F, Fut>(
        &self,
        operation: &'static str,
        recreate_missing_zone: bool,
        mut call: F,
    ) -> Result<T, ZoneError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut retry = self.retry_state(operation);
        let mut repaired = false;
        loop {
            match self.classify(call().await) {
                ZoneResult::Success(value) => return Ok(value),
                ZoneResult::ZoneNotFound if recreate_missing_zone => {
                    self.recreate_zone(&mut repaired, operation).await?
                }
                ZoneResult::RetryAfter(delay) => retry.wait(delay).await?,
                other => return Err(other.into_error()),
            }
        }
    }

    // ---- zone & subscriptions ----

    /// Zone metadata. A missing (or user-deleted) zone is created and fetched again.
    pub async fn fetch_zone_record(&self) -> Result<Option<ZoneRecord>, ZoneError> {
        let mut retry = self.retry_state("fetch zone");
        let mut repaired = false;
        loop {
            let result = self.database.fetch_zone(&self.zone_id, self.options()).await;
            match self.classify(result) {
                ZoneResult::Success(zone) => return Ok(zone),
                ZoneResult::ZoneNotFound | ZoneResult::UserDeletedZone => {
                    self.recreate_zone(&mut repaired, "fetch zone").await?
                }
                ZoneResult::RetryAfter(delay) => retry.wait(delay).await?,
                other => return Err(other.into_error()),
            }
        }
    }

    pub async fn create_zone_record(&self) -> Result<ZoneRecord, ZoneError> {
        let zone = self
            .database
            .create_zone(&self.zone_id, self.options())
            .await?;
        info!(zone = %self.zone_id, "created zone");
        Ok(zone)
    }

    /// Subscribe to silent pushes for this zone. Failures are only logged.
    pub async fn subscribe_to_zone_changes(&self) {
        let subscription = Subscription::for_zone(self.zone_id.clone());
        if let Err(error) = self.save_subscription(&subscription).await {
            error!(zone = %self.zone_id, %error, "subscribing to zone changes failed");
        }
    }

    pub async fn save_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, ZoneError> {
        self.perform("save subscription", true, move || {
            self.database.save_subscription(subscription, self.options())
        })
        .await
    }

    pub async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ZoneError> {
        self.perform("delete subscription", false, move || {
            self.database
                .delete_subscription(subscription_id, self.options())
        })
        .await
    }

    // ---- reads ----

    /// Run `query` to the end, following cursors.
    pub async fn query(
        &self,
        query: &Query,
        desired_keys: Option<&[String]>,
    ) -> Result<Vec<Record>, ZoneError> {
        let mut retry = self.retry_state("query");
        let mut repaired = false;
        let mut records = Vec::new();
        let mut request = QueryRequest::Start(query.clone());
        loop {
            let result = self
                .database
                .query(&self.zone_id, &request, desired_keys, self.options())
                .await;
            match self.classify(result) {
                ZoneResult::Success(page) => {
                    records.extend(page.records);
                    match page.cursor {
                        Some(cursor) => request = QueryRequest::Continue(cursor),
                        None => {
                            debug!(zone = %self.zone_id, count = records.len(), "query finished");
                            return Ok(records);
                        }
                    }
                }
                ZoneResult::ZoneNotFound => self.recreate_zone(&mut repaired, "query").await?,
                ZoneResult::RetryAfter(delay) => retry.wait(delay).await?,
                other => return Err(other.into_error()),
            }
        }
    }

    /// Fetch a record by the record name stored locally as its external id.
    pub async fn fetch(&self, external_id: Option<&str>) -> Result<Record, ZoneError> {
        let Some(external_id) = external_id else {
            return Err(ZoneError::CorruptAccount);
        };
        let record_id = RecordId::new(external_id, self.zone_id.clone());
        let record_id = &record_id;
        let record = self
            .perform("fetch", true, move || {
                self.database.fetch_record(record_id, self.options())
            })
            .await?;
        record.ok_or(ZoneError::Unknown)
    }

    // ---- writes ----

    pub async fn save(&self, record: Record) -> Result<ModifyOutcome, ZoneError> {
        self.modify(vec![record], Vec::new(), SaveStrategy::Overwrite)
            .await
    }

    pub async fn save_all(&self, records: Vec<Record>) -> Result<ModifyOutcome, ZoneError> {
        self.modify(records, Vec::new(), SaveStrategy::Overwrite)
            .await
    }

    /// Save records that don't exist yet (or are unchanged on the server).
    ///
    /// Not atomic: records the server rejects are skipped, not reported as errors.
    /// Returns the ids that were actually saved.
    pub async fn save_if_new(&self, records: Vec<Record>) -> Result<Vec<RecordId>, ZoneError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        match self.save_if_new_batch(&records).await {
            Err(ZoneError::LimitExceeded) => {
                let mut saved = Vec::with_capacity(records.len());
                for chunk in records.chunks(self.config.chunk_size) {
                    let chunk_saved = self.save_if_new_batch(chunk).await?;
                    info!(zone = %self.zone_id, count = chunk_saved.len(), "saved chunk of new records");
                    saved.extend(chunk_saved);
                }
                Ok(saved)
            }
            other => other,
        }
    }

    async fn save_if_new_batch(&self, records: &[Record]) -> Result<Vec<RecordId>, ZoneError> {
        let request = ModifyRequest {
            saves: records.to_vec(),
            deletes: Vec::new(),
            policy: SavePolicy::IfServerRecordUnchanged,
            atomic: false,
        };
        let mut retry = self.retry_state("save if new");
        let mut repaired = false;
        loop {
            let result = self
                .database
                .modify_records(&self.zone_id, &request, self.options())
                .await;
            match self.classify(result) {
                ZoneResult::Success(response) => {
                    debug!(zone = %self.zone_id, count = response.saved.len(), "saved new records");
                    return Ok(response.saved.into_iter().map(|record| record.id).collect());
                }
                ZoneResult::PartialFailure(detail) => {
                    let failed: HashSet<&RecordId> = detail.failed_ids().collect();
                    let saved: Vec<RecordId> = records
                        .iter()
                        .filter(|record| !failed.contains(&record.id))
                        .map(|record| record.id.clone())
                        .collect();
                    debug!(
                        zone = %self.zone_id,
                        count = saved.len(),
                        skipped = failed.len(),
                        "saved new records"
                    );
                    return Ok(saved);
                }
                ZoneResult::ZoneNotFound => {
                    self.recreate_zone(&mut repaired, "save if new").await?
                }
                ZoneResult::RetryAfter(delay) => retry.wait(delay).await?,
                other => return Err(other.into_error()),
            }
        }
    }

    pub async fn delete(&self, record_id: RecordId) -> Result<ModifyOutcome, ZoneError> {
        self.delete_all(vec![record_id]).await
    }

    pub async fn delete_all(&self, record_ids: Vec<RecordId>) -> Result<ModifyOutcome, ZoneError> {
        self.modify(Vec::new(), record_ids, SaveStrategy::Overwrite)
            .await
    }

    pub async fn delete_external(
        &self,
        external_id: Option<&str>,
    ) -> Result<ModifyOutcome, ZoneError> {
        let Some(external_id) = external_id else {
            return Err(ZoneError::CorruptAccount);
        };
        self.delete(RecordId::new(external_id, self.zone_id.clone()))
            .await
    }

    /// Delete every record `query` matches.
    pub async fn delete_matching(&self, query: &Query) -> Result<ModifyOutcome, ZoneError> {
        let no_fields: &[String] = &[];
        let records = self.query(query, Some(no_fields)).await?;
        if records.is_empty() {
            return Ok(ModifyOutcome::default());
        }
        let ids = records.into_iter().map(|record| record.id).collect();
        self.delete_all(ids).await
    }

    /// Save and delete in one atomic request.
    ///
    /// A request the server finds too large is split into chunks of
    /// `config.chunk_size`: saves first, then deletes, stopping at the first
    /// failing chunk.
    pub async fn modify(
        &self,
        saves: Vec<Record>,
        deletes: Vec<RecordId>,
        strategy: SaveStrategy,
    ) -> Result<ModifyOutcome, ZoneError> {
        if saves.is_empty() && deletes.is_empty() {
            return Ok(ModifyOutcome::default());
        }
        match self.modify_batch(&saves, &deletes, &strategy).await {
            Err(ZoneError::LimitExceeded) => {
                info!(
                    zone = %self.zone_id,
                    saves = saves.len(),
                    deletes = deletes.len(),
                    chunk_size = self.config.chunk_size,
                    "request too large, splitting into chunks"
                );
                self.modify_in_chunks(&saves, &deletes, &strategy).await
            }
            other => other,
        }
    }

    async fn modify_in_chunks(
        &self,
        saves: &[Record],
        deletes: &[RecordId],
        strategy: &SaveStrategy,
    ) -> Result<ModifyOutcome, ZoneError> {
        let mut outcome = ModifyOutcome::default();
        for chunk in saves.chunks(self.config.chunk_size) {
            outcome.absorb(self.modify_batch(chunk, &[], strategy).await?);
            info!(zone = %self.zone_id, count = chunk.len(), "saved chunk of records");
        }
        for chunk in deletes.chunks(self.config.chunk_size) {
            outcome.absorb(self.modify_batch(&[], chunk, strategy).await?);
            info!(zone = %self.zone_id, count = chunk.len(), "deleted chunk of records");
        }
        Ok(outcome)
    }

    async fn modify_batch(
        &self,
        saves: &[Record],
        deletes: &[RecordId],
        strategy: &SaveStrategy,
    ) -> Result<ModifyOutcome, ZoneError> {
        let mut request = ModifyRequest {
            saves: saves.to_vec(),
            deletes: deletes.to_vec(),
            policy: strategy.save_policy(),
            atomic: true,
        };
        let mut retry = self.retry_state("modify");
        let mut repaired = false;
        loop {
            let result = self
                .database
                .modify_records(&self.zone_id, &request, self.options())
                .await;
            match self.classify(result) {
                ZoneResult::Success(response) => {
                    debug!(
                        zone = %self.zone_id,
                        saved = response.saved.len(),
                        deleted = response.deleted.len(),
                        "modified records"
                    );
                    return Ok(ModifyOutcome {
                        saved: response.saved,
                        deleted: response.deleted,
                    });
                }
                ZoneResult::ServerRecordChanged(detail) | ZoneResult::PartialFailure(detail) => {
                    let SaveStrategy::IfServerRecordUnchanged(resolver) = strategy else {
                        return Err(ZoneError::Conflict(detail));
                    };
                    retry.note_attempt()?;
                    warn!(zone = %self.zone_id, conflicts = detail.items.len(), "save conflict, resolving");
                    let records = std::mem::take(&mut request.saves);
                    request.saves = resolver.resolve(records, &detail).await?;
                }
                ZoneResult::ZoneNotFound => self.recreate_zone(&mut repaired, "modify").await?,
                ZoneResult::RetryAfter(delay) => retry.wait(delay).await?,
                other => return Err(other.into_error()),
            }
        }
    }

    // ---- change fetching ----

    /// Fetch everything that changed since the stored token and hand it to the
    /// delegate.
    ///
    /// Incremental: each page is delivered, then its token persisted.
    /// Otherwise: all pages are accumulated, delivered once, then the final token
    /// persisted.
    pub async fn fetch_changes_in_zone(&self, incremental: bool) -> Result<FetchSummary, ZoneError> {
        let mut retry = self.retry_state("fetch changes");
        let mut repaired = false;
        let mut summary = FetchSummary::default();

        'fetch: loop {
            let mut token = self.change_token();
            let from_scratch = token.is_none();
            let mut changed = Vec::new();
            let mut deleted = Vec::new();

            loop {
                let result = self
                    .database
                    .fetch_zone_changes(&self.zone_id, token.as_ref(), self.options())
                    .await;
                let page = match self.classify(result) {
                    ZoneResult::Success(page) => page,
                    ZoneResult::ZoneNotFound => {
                        self.recreate_zone(&mut repaired, "fetch changes").await?;
                        self.reset_change_token();
                        continue 'fetch;
                    }
                    ZoneResult::ChangeTokenExpired if !from_scratch => {
                        warn!(zone = %self.zone_id, "change token expired, fetching from scratch");
                        self.reset_change_token();
                        continue 'fetch;
                    }
                    ZoneResult::RetryAfter(delay) => {
                        retry.wait(delay).await?;
                        continue 'fetch;
                    }
                    other => return Err(other.into_error()),
                };

                summary.pages += 1;
                debug!(
                    zone = %self.zone_id,
                    changed = page.changed.len(),
                    deleted = page.deleted.len(),
                    more_coming = page.more_coming,
                    "received zone changes"
                );
                changed.extend(page.changed);
                deleted.extend(page.deleted);
                if incremental {
                    let batch_changed = std::mem::take(&mut changed);
                    let batch_deleted = std::mem::take(&mut deleted);
                    self.deliver(batch_changed, batch_deleted, &mut summary).await?;
                    self.store_change_token(Some(page.token.clone()));
                }
                token = Some(page.token);
                if !page.more_coming {
                    break;
                }
            }

            if !incremental {
                self.deliver(changed, deleted, &mut summary).await?;
                self.store_change_token(token);
            }
            info!(
                zone = %self.zone_id,
                pages = summary.pages,
                changed = summary.changed,
                deleted = summary.deleted,
                "fetched zone changes"
            );
            return Ok(summary);
        }
    }

    /// Hand one batch to the delegate through the queue and wait for it.
    async fn deliver(
        &self,
        changed: Vec<Record>,
        deleted: Vec<RecordKey>,
        summary: &mut FetchSummary,
    ) -> Result<(), ZoneError> {
        if changed.is_empty() && deleted.is_empty() {
            return Ok(());
        }
        summary.batches += 1;
        summary.changed += changed.len();
        summary.deleted += deleted.len();
        apply_on_queue(&self.queue, self.delegate.clone(), changed, deleted).await
    }

    /// Handle a push. Notifications for other zones are ignored; fetch errors
    /// are logged, not returned.
    pub async fn receive_remote_notification(&self, note: &ZoneNotification, incremental: bool) {
        if !note.concerns(&self.zone_id) {
            debug!(zone = %self.zone_id, "ignoring notification for another zone");
            return;
        }
        if let Err(error) = self.fetch_changes_in_zone(incremental).await {
            error!(zone = %self.zone_id, %error, "fetch after remote notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::rc::Rc;
    use std::time::Duration;

    use rstest::rstest;
    use tokio::task::LocalSet;
    use tracing_test::traced_test;

    use super::*;
    use crate::domain::ChangeToken;
    use crate::impls::{DatabaseCall, InMemoryDatabase, MemoryDelegate};
    use crate::ports::{ClientWins, ErrorCode};

    struct Harness {
        db: Rc<InMemoryDatabase>,
        delegate: Rc<MemoryDelegate>,
        zone: CloudZone,
    }

    fn zone_id() -> ZoneId {
        ZoneId::for_current_user("Articles")
    }

    fn article(name: &str) -> Record {
        Record::new("Article", RecordId::new(name, zone_id())).with_field("title", name)
    }

    fn articles(count: usize) -> Vec<Record> {
        (0..count).map(|i| article(&format!("article-{i:04}"))).collect()
    }

    fn harness_with(db: InMemoryDatabase, config: ZoneConfig) -> Harness {
        let db = Rc::new(db);
        let delegate = Rc::new(MemoryDelegate::new());
        let zone = CloudZone::new(
            zone_id(),
            db.clone(),
            delegate.clone(),
            OperationQueue::new(),
            config,
        )
        .unwrap();
        Harness { db, delegate, zone }
    }

    /// Zone already exists on the server.
    fn harness(db: InMemoryDatabase) -> Harness {
        db.insert_zone(&zone_id());
        harness_with(db, ZoneConfig::default())
    }

    fn remote(code: ErrorCode) -> RemoteError {
        RemoteError::new(code, "injected")
    }

    fn hinted(code: ErrorCode, secs: u64) -> RemoteError {
        remote(code).with_retry_after(Duration::from_secs(secs))
    }

    async fn local<F: Future>(future: F) -> F::Output {
        LocalSet::new().run_until(future).await
    }

    fn saves_per_call(db: &InMemoryDatabase) -> Vec<(usize, usize)> {
        db.calls_of(DatabaseCall::ModifyRecords)
            .iter()
            .map(|call| (call.saves, call.deletes))
            .collect()
    }

    // ---- missing zone ----

    #[tokio::test]
    async fn missing_zone_is_created_and_save_retried() {
        let h = harness_with(InMemoryDatabase::new(), ZoneConfig::default());

        let outcome = h.zone.save(article("a")).await.unwrap();

        assert_eq!(outcome.saved.len(), 1);
        assert!(h.db.has_zone(&zone_id()));
        assert_eq!(h.db.calls_of(DatabaseCall::CreateZone).len(), 1);
        assert_eq!(h.db.calls_of(DatabaseCall::ModifyRecords).len(), 2);
    }

    #[tokio::test]
    async fn zone_missing_after_recreation_is_an_error() {
        let h = harness(InMemoryDatabase::new());
        h.db.fail_next(DatabaseCall::ModifyRecords, remote(ErrorCode::ZoneNotFound));
        h.db.fail_next(DatabaseCall::ModifyRecords, remote(ErrorCode::ZoneNotFound));

        let err = h.zone.save(article("a")).await.unwrap_err();

        assert!(matches!(err, ZoneError::ZoneNotFound));
        assert_eq!(h.db.calls_of(DatabaseCall::CreateZone).len(), 1);
    }

    #[tokio::test]
    async fn user_deleted_zone_is_terminal_for_writes() {
        let h = harness(InMemoryDatabase::new());
        h.db.fail_next(DatabaseCall::ModifyRecords, remote(ErrorCode::UserDeletedZone));

        let err = h.zone.save(article("a")).await.unwrap_err();

        assert!(matches!(err, ZoneError::UserDeletedZone));
        assert!(h.db.calls_of(DatabaseCall::CreateZone).is_empty());
    }

    #[tokio::test]
    async fn fetch_zone_record_recreates_a_user_deleted_zone() {
        let h = harness(InMemoryDatabase::new());
        h.db.fail_next(DatabaseCall::FetchZone, remote(ErrorCode::UserDeletedZone));

        let zone = h.zone.fetch_zone_record().await.unwrap().unwrap();

        assert_eq!(zone.zone_id, zone_id());
        assert_eq!(h.db.calls_of(DatabaseCall::CreateZone).len(), 1);
        assert_eq!(h.db.calls_of(DatabaseCall::FetchZone).len(), 2);
    }

    // ---- chunking ----

    #[tokio::test]
    async fn oversized_save_is_split_into_chunks() {
        let h = harness(InMemoryDatabase::new().with_max_batch(200));

        let outcome = h.zone.save_all(articles(450)).await.unwrap();

        assert_eq!(outcome.saved.len(), 450);
        assert_eq!(h.db.records(&zone_id()).len(), 450);
        assert_eq!(
            saves_per_call(&h.db),
            vec![(450, 0), (200, 0), (200, 0), (50, 0)]
        );
    }

    #[tokio::test]
    async fn chunked_modify_saves_before_deleting() {
        let db = InMemoryDatabase::new().with_max_batch(2);
        db.insert_zone(&zone_id());
        let config = ZoneConfig {
            chunk_size: 2,
            ..ZoneConfig::default()
        };
        let h = harness_with(db, config);
        h.zone.save(article("a")).await.unwrap();
        h.zone.save(article("b")).await.unwrap();

        let deletes = vec![RecordId::new("a", zone_id()), RecordId::new("b", zone_id())];
        let outcome = h
            .zone
            .modify(
                vec![article("c"), article("d"), article("e")],
                deletes,
                SaveStrategy::Overwrite,
            )
            .await
            .unwrap();

        assert_eq!(outcome.saved.len(), 3);
        assert_eq!(outcome.deleted.len(), 2);
        assert_eq!(
            saves_per_call(&h.db)[2..],
            [(3, 2), (2, 0), (1, 0), (0, 2)]
        );
    }

    #[tokio::test]
    async fn failing_chunk_stops_the_remaining_chunks() {
        let h = harness(InMemoryDatabase::new().with_max_batch(200));
        // call 0 is the oversized request, call 2 the second chunk
        h.db.fail_call(DatabaseCall::ModifyRecords, 2, remote(ErrorCode::QuotaExceeded));

        let err = h.zone.save_all(articles(450)).await.unwrap_err();

        assert!(matches!(err, ZoneError::Remote(e) if e.code == ErrorCode::QuotaExceeded));
        assert_eq!(saves_per_call(&h.db), vec![(450, 0), (200, 0), (200, 0)]);
        assert_eq!(h.db.records(&zone_id()).len(), 200);
    }

    #[rstest]
    #[case::zero_chunk_size(ZoneConfig { chunk_size: 0, ..ZoneConfig::default() })]
    #[case::huge_jitter(ZoneConfig {
        retry: RetryPolicy { jitter: 1e300, ..RetryPolicy::default() },
        ..ZoneConfig::default()
    })]
    fn invalid_config_is_rejected_up_front(#[case] config: ZoneConfig) {
        let result = CloudZone::new(
            zone_id(),
            Rc::new(InMemoryDatabase::new().with_max_batch(1)),
            Rc::new(MemoryDelegate::new()),
            OperationQueue::new(),
            config,
        );

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn chunk_that_is_still_too_large_fails() {
        let db = InMemoryDatabase::new().with_max_batch(10);
        db.insert_zone(&zone_id());
        let config = ZoneConfig {
            chunk_size: 50,
            ..ZoneConfig::default()
        };
        let h = harness_with(db, config);

        let err = h.zone.save_all(articles(60)).await.unwrap_err();

        assert!(matches!(err, ZoneError::LimitExceeded));
        assert!(h.db.records(&zone_id()).is_empty());
    }

    // ---- retry hints ----

    #[tokio::test(start_paused = true)]
    async fn retry_hint_is_waited_out() {
        let h = harness(InMemoryDatabase::new());
        h.db.fail_next(DatabaseCall::ModifyRecords, hinted(ErrorCode::ZoneBusy, 5));

        h.zone.save(article("a")).await.unwrap();

        let calls = h.db.calls_of(DatabaseCall::ModifyRecords);
        assert_eq!(calls.len(), 2);
        assert!(calls[0].failed);
        assert!(calls[1].at - calls[0].at >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn long_retry_hint_is_waited_out_in_full() {
        let h = harness(InMemoryDatabase::new());
        h.db.fail_next(DatabaseCall::ModifyRecords, hinted(ErrorCode::ServiceUnavailable, 3600));

        h.zone.save(article("a")).await.unwrap();

        let calls = h.db.calls_of(DatabaseCall::ModifyRecords);
        assert_eq!(calls.len(), 2);
        assert!(calls[1].at - calls[0].at >= Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn hint_beyond_max_delay_gives_up_instead_of_retrying_early() {
        let db = InMemoryDatabase::new();
        db.insert_zone(&zone_id());
        let mut config = ZoneConfig::default();
        config.retry.max_delay = Some(Duration::from_secs(2));
        let h = harness_with(db, config);
        h.db.fail_next(DatabaseCall::Query, hinted(ErrorCode::RequestRateLimited, 3600));

        let err = h.zone.query(&Query::all("Article"), None).await.unwrap_err();

        assert!(matches!(err, ZoneError::RetriesExhausted { operation: "query", .. }));
        assert_eq!(h.db.calls_of(DatabaseCall::Query).len(), 1);
    }

    #[tokio::test]
    async fn transient_error_without_hint_fails_by_default() {
        let h = harness(InMemoryDatabase::new());
        h.db.fail_next(DatabaseCall::ModifyRecords, remote(ErrorCode::ServiceUnavailable));

        let err = h.zone.save(article("a")).await.unwrap_err();

        assert!(matches!(err, ZoneError::Remote(e) if e.code == ErrorCode::ServiceUnavailable));
        assert_eq!(h.db.calls_of(DatabaseCall::ModifyRecords).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_gives_up() {
        let db = InMemoryDatabase::new();
        db.insert_zone(&zone_id());
        let mut config = ZoneConfig::default();
        config.retry.max_attempts = Some(2);
        let h = harness_with(db, config);
        for _ in 0..3 {
            h.db.fail_next(DatabaseCall::ModifyRecords, hinted(ErrorCode::RequestRateLimited, 1));
        }

        let err = h.zone.save(article("a")).await.unwrap_err();

        assert!(matches!(err, ZoneError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(h.db.calls_of(DatabaseCall::ModifyRecords).len(), 3);
    }

    // ---- reads ----

    #[tokio::test]
    async fn fetch_by_external_id() {
        let h = harness(InMemoryDatabase::new());
        h.zone.save(article("a")).await.unwrap();

        let record = h.zone.fetch(Some("a")).await.unwrap();
        assert_eq!(record.field("title"), Some(&serde_json::json!("a")));

        assert!(matches!(h.zone.fetch(None).await, Err(ZoneError::CorruptAccount)));
        assert!(matches!(h.zone.fetch(Some("missing")).await, Err(ZoneError::Unknown)));
    }

    #[tokio::test]
    async fn query_follows_cursors() {
        let h = harness(InMemoryDatabase::new().with_query_page_size(2));
        h.zone.save_all(articles(5)).await.unwrap();

        let records = h.zone.query(&Query::all("Article"), None).await.unwrap();

        assert_eq!(records.len(), 5);
        assert_eq!(h.db.calls_of(DatabaseCall::Query).len(), 3);
    }

    // ---- writes ----

    #[tokio::test]
    async fn conflicting_save_is_resolved_and_retried() {
        let h = harness(InMemoryDatabase::new());
        h.zone.save(article("a")).await.unwrap();

        let stale = article("a").with_field("title", "edited offline");
        let outcome = h
            .zone
            .modify(
                vec![stale],
                Vec::new(),
                SaveStrategy::IfServerRecordUnchanged(Rc::new(ClientWins)),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome.saved[0].field("title"),
            Some(&serde_json::json!("edited offline"))
        );
        assert_eq!(h.db.calls_of(DatabaseCall::ModifyRecords).len(), 3);
    }

    #[tokio::test]
    async fn conflict_under_overwrite_is_surfaced() {
        let h = harness(InMemoryDatabase::new());
        h.db.fail_next(DatabaseCall::ModifyRecords, remote(ErrorCode::ServerRecordChanged));

        let err = h.zone.save(article("a")).await.unwrap_err();

        assert!(matches!(err, ZoneError::Conflict(_)));
    }

    #[tokio::test]
    async fn save_if_new_skips_records_that_exist() {
        let h = harness(InMemoryDatabase::new());
        h.zone.save(article("a")).await.unwrap();

        let saved = h
            .zone
            .save_if_new(vec![
                article("a").with_field("title", "duplicate"),
                article("b"),
                article("c"),
            ])
            .await
            .unwrap();

        let names: Vec<_> = saved.iter().map(|id| id.record_name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        let a = h.db.record(&RecordId::new("a", zone_id())).unwrap();
        assert_eq!(a.field("title"), Some(&serde_json::json!("a")));
    }

    #[tokio::test]
    async fn save_if_new_chunks_oversized_batches() {
        let db = InMemoryDatabase::new().with_max_batch(2);
        db.insert_zone(&zone_id());
        let config = ZoneConfig {
            chunk_size: 2,
            ..ZoneConfig::default()
        };
        let h = harness_with(db, config);

        let saved = h.zone.save_if_new(articles(5)).await.unwrap();

        assert_eq!(saved.len(), 5);
        assert_eq!(
            saves_per_call(&h.db),
            vec![(5, 0), (2, 0), (2, 0), (1, 0)]
        );
    }

    #[tokio::test]
    async fn delete_matching_removes_only_matches() {
        let h = harness(InMemoryDatabase::new());
        let mut records = Vec::new();
        for (i, kind) in ["draft", "draft", "published", "draft", "published"]
            .into_iter()
            .enumerate()
        {
            records.push(article(&format!("a{i}")).with_field("kind", kind));
        }
        h.zone.save_all(records).await.unwrap();

        let outcome = h
            .zone
            .delete_matching(&Query::equals("Article", "kind", "draft"))
            .await
            .unwrap();

        assert_eq!(outcome.deleted.len(), 3);
        let left = h.db.records(&zone_id());
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|r| r.field("kind") == Some(&serde_json::json!("published"))));
    }

    #[tokio::test]
    async fn delete_external_needs_an_id() {
        let h = harness(InMemoryDatabase::new());
        h.zone.save(article("a")).await.unwrap();

        assert!(matches!(
            h.zone.delete_external(None).await,
            Err(ZoneError::CorruptAccount)
        ));
        let outcome = h.zone.delete_external(Some("a")).await.unwrap();
        assert_eq!(outcome.deleted, vec![RecordId::new("a", zone_id())]);
    }

    #[tokio::test]
    async fn empty_modify_makes_no_request() {
        let h = harness(InMemoryDatabase::new());

        let outcome = h
            .zone
            .modify(Vec::new(), Vec::new(), SaveStrategy::Overwrite)
            .await
            .unwrap();

        assert_eq!(outcome, ModifyOutcome::default());
        assert!(h.db.calls().is_empty());
    }

    // ---- subscriptions ----

    #[tokio::test]
    async fn subscribe_and_unsubscribe() {
        let h = harness(InMemoryDatabase::new());

        h.zone.subscribe_to_zone_changes().await;
        let subscriptions = h.db.subscriptions();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].zone_id, zone_id());

        h.zone
            .delete_subscription(&subscriptions[0].id)
            .await
            .unwrap();
        assert!(h.db.subscriptions().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn subscription_failure_is_only_logged() {
        let h = harness(InMemoryDatabase::new());
        h.db.fail_next(DatabaseCall::SaveSubscription, remote(ErrorCode::PermissionFailure));

        h.zone.subscribe_to_zone_changes().await;

        assert!(h.db.subscriptions().is_empty());
        assert!(logs_contain("subscribing to zone changes failed"));
    }

    // ---- change tokens ----

    #[test]
    fn token_keys_are_scoped_by_zone_and_owner() {
        let h = harness(InMemoryDatabase::new());
        assert_eq!(
            h.zone.change_token_key(),
            "zonesync.server.token.Articles.__defaultOwner__"
        );
        assert_eq!(h.zone.old_change_token_key(), "zonesync.server.token.Articles");
    }

    #[test]
    fn old_token_is_migrated() {
        let h = harness(InMemoryDatabase::new());
        h.delegate
            .set_token(h.zone.old_change_token_key(), ChangeToken::new("1:7"));

        h.zone.migrate_change_token();

        assert_eq!(h.zone.change_token(), Some(ChangeToken::new("1:7")));
        assert_eq!(h.delegate.token(&h.zone.old_change_token_key()), None);
    }

    #[test]
    fn generated_ids_live_in_the_zone() {
        let h = harness(InMemoryDatabase::new());
        let a = h.zone.generate_record_id();
        let b = h.zone.generate_record_id();
        assert_eq!(a.zone_id, zone_id());
        assert_ne!(a, b);
    }

    // ---- change fetching ----

    #[tokio::test]
    async fn full_fetch_delivers_once_and_stores_the_final_token() {
        local(async {
            let h = harness(InMemoryDatabase::new().with_change_page_size(2));
            h.zone.save_all(articles(5)).await.unwrap();

            let summary = h.zone.fetch_changes_in_zone(false).await.unwrap();

            assert_eq!(summary.pages, 3);
            assert_eq!(summary.batches, 1);
            assert_eq!(summary.changed, 5);
            assert_eq!(h.delegate.batches().len(), 1);
            assert_eq!(h.delegate.replica().len(), 5);
            assert!(h.zone.change_token().is_some());

            // The stored token means only new changes come back.
            h.zone.save(article("late")).await.unwrap();
            let summary = h.zone.fetch_changes_in_zone(false).await.unwrap();
            assert_eq!(summary.changed, 1);
            assert_eq!(h.delegate.batches()[1].changed, vec![RecordId::new("late", zone_id())]);
        })
        .await;
    }

    #[tokio::test]
    async fn incremental_fetch_delivers_each_page_in_order() {
        local(async {
            let h = harness(InMemoryDatabase::new().with_change_page_size(2));
            h.zone.save_all(articles(5)).await.unwrap();

            let summary = h.zone.fetch_changes_in_zone(true).await.unwrap();

            let sizes: Vec<usize> = h.delegate.batches().iter().map(|b| b.changed.len()).collect();
            assert_eq!(sizes, vec![2, 2, 1]);
            assert_eq!(summary.batches, 3);
            let first = &h.delegate.batches()[0].changed[0];
            assert_eq!(first.record_name, "article-0000");
        })
        .await;
    }

    #[tokio::test]
    async fn deletions_reach_the_delegate() {
        local(async {
            let h = harness(InMemoryDatabase::new());
            h.zone.save_all(vec![article("a"), article("b")]).await.unwrap();
            h.zone.fetch_changes_in_zone(false).await.unwrap();

            h.zone.delete(RecordId::new("a", zone_id())).await.unwrap();
            let summary = h.zone.fetch_changes_in_zone(false).await.unwrap();

            assert_eq!(summary.deleted, 1);
            let replica = h.delegate.replica();
            assert_eq!(replica.len(), 1);
            assert_eq!(replica[0].id.record_name, "b");
        })
        .await;
    }

    #[tokio::test]
    async fn delegate_failure_keeps_the_previous_token() {
        local(async {
            let h = harness(InMemoryDatabase::new());
            h.zone.save(article("a")).await.unwrap();
            h.zone.fetch_changes_in_zone(true).await.unwrap();
            let token = h.zone.change_token();

            h.zone.save(article("b")).await.unwrap();
            h.delegate.fail_next_apply("disk full");
            let err = h.zone.fetch_changes_in_zone(true).await.unwrap_err();

            assert!(matches!(err, ZoneError::Delegate(_)));
            assert_eq!(h.zone.change_token(), token);

            // Next fetch picks up where the stored token left off.
            let summary = h.zone.fetch_changes_in_zone(true).await.unwrap();
            assert_eq!(summary.changed, 1);
        })
        .await;
    }

    #[tokio::test]
    #[traced_test]
    async fn expired_token_restarts_from_scratch() {
        local(async {
            let h = harness(InMemoryDatabase::new());
            h.zone.save(article("a")).await.unwrap();
            h.zone.fetch_changes_in_zone(false).await.unwrap();

            h.db.expire_change_tokens(&zone_id());
            h.zone.save(article("b")).await.unwrap();
            let summary = h.zone.fetch_changes_in_zone(false).await.unwrap();

            assert_eq!(summary.changed, 2);
            assert_eq!(h.db.calls_of(DatabaseCall::FetchZoneChanges).len(), 3);
            assert!(logs_contain("change token expired"));
        })
        .await;
    }

    #[tokio::test]
    async fn expired_token_without_stored_token_is_an_error() {
        local(async {
            let h = harness(InMemoryDatabase::new());
            h.db.fail_next(DatabaseCall::FetchZoneChanges, remote(ErrorCode::ChangeTokenExpired));

            let err = h.zone.fetch_changes_in_zone(false).await.unwrap_err();

            assert!(matches!(err, ZoneError::ChangeTokenExpired));
        })
        .await;
    }

    #[tokio::test]
    async fn missing_zone_during_fetch_is_recreated_and_token_reset() {
        local(async {
            let h = harness_with(InMemoryDatabase::new(), ZoneConfig::default());
            let stale = ChangeToken::new("99:3");
            h.delegate.set_token(h.zone.change_token_key(), stale.clone());

            let summary = h.zone.fetch_changes_in_zone(false).await.unwrap();

            assert_eq!(summary.batches, 0);
            assert!(h.db.has_zone(&zone_id()));
            let token = h.zone.change_token().unwrap();
            assert_ne!(token, stale);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_waits_out_retry_hints() {
        local(async {
            let h = harness(InMemoryDatabase::new());
            h.zone.save(article("a")).await.unwrap();
            h.db.fail_next(DatabaseCall::FetchZoneChanges, hinted(ErrorCode::ServiceUnavailable, 30));

            let summary = h.zone.fetch_changes_in_zone(true).await.unwrap();

            assert_eq!(summary.changed, 1);
            let calls = h.db.calls_of(DatabaseCall::FetchZoneChanges);
            assert!(calls[1].at - calls[0].at >= Duration::from_secs(30));
        })
        .await;
    }

    // ---- notifications ----

    #[tokio::test]
    async fn notification_for_another_zone_is_ignored() {
        local(async {
            let h = harness(InMemoryDatabase::new());
            let note = ZoneNotification::for_zone(ZoneId::for_current_user("Other"));

            h.zone.receive_remote_notification(&note, false).await;

            assert!(h.db.calls_of(DatabaseCall::FetchZoneChanges).is_empty());
        })
        .await;
    }

    #[tokio::test]
    async fn notification_for_this_zone_fetches_changes() {
        local(async {
            let h = harness(InMemoryDatabase::new());
            h.zone.save(article("a")).await.unwrap();
            let note = ZoneNotification::for_zone(zone_id());

            h.zone.receive_remote_notification(&note, true).await;

            assert_eq!(h.delegate.replica().len(), 1);
        })
        .await;
    }
}
