use std::cell::RefCell;
use std::error::Error;
use std::rc::Rc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

use zonesync_core::domain::{ChangeToken, Record, RecordKey, ZoneId, ZoneNotification};
use zonesync_core::impls::{InMemoryDatabase, MemoryDelegate};
use zonesync_core::ports::ZoneDelegate;
use zonesync_core::{
    CloudZone, FetchSummary, OperationHandle, OperationQueue, QueueSnapshot, ZoneConfig, ZoneError,
};

/// Prints every batch before handing it to the in-memory replica.
struct PrintingDelegate {
    inner: MemoryDelegate,
}

#[async_trait(?Send)]
impl ZoneDelegate for PrintingDelegate {
    fn find_change_token(&self, key: &str) -> Option<ChangeToken> {
        self.inner.find_change_token(key)
    }

    fn store_change_token(&self, token: Option<ChangeToken>, key: &str) {
        self.inner.store_change_token(token, key)
    }

    async fn apply_changes(
        &self,
        changed: Vec<Record>,
        deleted: Vec<RecordKey>,
    ) -> Result<(), ZoneError> {
        for record in &changed {
            println!("changed: {}", record.id);
        }
        for key in &deleted {
            println!("deleted: {}", key.record_id);
        }
        self.inner.apply_changes(changed, deleted).await
    }
}

#[derive(Serialize)]
struct Report {
    saved: usize,
    fetched: FetchSummary,
    replica: usize,
    queue_order: Vec<String>,
    queue: QueueSnapshot,
}

/// Three operations where `publish` waits for both `index` and `thumbnails`.
async fn run_queue_demo(queue: &OperationQueue) -> Vec<String> {
    let order = Rc::new(RefCell::new(Vec::new()));
    let step = |label: &'static str| {
        let order = order.clone();
        OperationHandle::from_fn(move || order.borrow_mut().push(label.to_string()))
    };
    let publish = step("publish");
    let index = step("index");
    let thumbnails = step("thumbnails");

    queue.add_dependency(&publish, &index);
    queue.add_dependency(&publish, &thumbnails);
    queue.enqueue_many([&publish, &index, &thumbnails]);
    queue.wait_until_idle().await;

    order.take()
}

async fn run(config: ZoneConfig) -> Result<Report, Box<dyn Error>> {
    let queue = OperationQueue::new();
    let queue_order = run_queue_demo(&queue).await;

    let zone_id = ZoneId::for_current_user("Notes");
    let database = Rc::new(InMemoryDatabase::new().with_change_page_size(2));
    let delegate = Rc::new(PrintingDelegate {
        inner: MemoryDelegate::new(),
    });
    let zone = CloudZone::new(zone_id.clone(), database, delegate.clone(), queue.clone(), config)?;

    // The zone does not exist yet; the first save creates it.
    let notes = (1..=5)
        .map(|i| Record::new("Note", zone.generate_record_id()).with_field("title", format!("note {i}")))
        .collect();
    let outcome = zone.save_all(notes).await?;
    info!(count = outcome.saved.len(), "saved notes");

    zone.subscribe_to_zone_changes().await;
    let fetched = zone.fetch_changes_in_zone(true).await?;

    // A push for this zone after the fetch: nothing new arrives.
    zone.receive_remote_notification(&ZoneNotification::for_zone(zone_id), true)
        .await;

    Ok(Report {
        saved: outcome.saved.len(),
        fetched,
        replica: delegate.inner.replica().len(),
        queue_order,
        queue: queue.snapshot(),
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Optional first argument: path to a JSON config.
    let config = match std::env::args().nth(1) {
        Some(path) => ZoneConfig::from_path(&path)?,
        None => ZoneConfig::default(),
    };

    let report = LocalSet::new().run_until(run(config)).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
