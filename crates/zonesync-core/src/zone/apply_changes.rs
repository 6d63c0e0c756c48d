//! Delivers one batch of remote changes to the delegate, as a queued operation.

use std::rc::Rc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::{Record, RecordKey};
use crate::error::ZoneError;
use crate::ports::ZoneDelegate;
use crate::queue::{Operation, OperationContext, OperationHandle, OperationQueue};

/// Runs `ZoneDelegate::apply_changes` and reports back through a oneshot.
///
/// A delegate failure cancels the operation (and anything waiting on it).
pub(crate) struct ApplyChangesOperation {
    delegate: Rc<dyn ZoneDelegate>,
    changed: Vec<Record>,
    deleted: Vec<RecordKey>,
    done: Option<oneshot::Sender<Result<(), ZoneError>>>,
}

impl ApplyChangesOperation {
    pub(crate) fn new(
        delegate: Rc<dyn ZoneDelegate>,
        changed: Vec<Record>,
        deleted: Vec<RecordKey>,
    ) -> (Self, oneshot::Receiver<Result<(), ZoneError>>) {
        let (done, receiver) = oneshot::channel();
        let operation = Self {
            delegate,
            changed,
            deleted,
            done: Some(done),
        };
        (operation, receiver)
    }
}

impl Operation for ApplyChangesOperation {
    fn name(&self) -> Option<&str> {
        Some("ApplyChangesOperation")
    }

    fn run(&mut self, ctx: OperationContext) {
        let delegate = self.delegate.clone();
        let changed = std::mem::take(&mut self.changed);
        let deleted = std::mem::take(&mut self.deleted);
        let Some(done) = self.done.take() else {
            ctx.complete();
            return;
        };

        tokio::task::spawn_local(async move {
            debug!(
                op = %ctx.id(),
                changed = changed.len(),
                deleted = deleted.len(),
                "applying remote changes"
            );
            let result = delegate.apply_changes(changed, deleted).await;
            if ctx.is_canceled() {
                let _ = done.send(Err(ZoneError::Canceled));
                return;
            }
            match result {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                    ctx.complete();
                }
                Err(error) => {
                    warn!(op = %ctx.id(), %error, "delegate rejected remote changes");
                    let _ = done.send(Err(error));
                    ctx.cancel();
                }
            }
        });
    }
}

/// Enqueue one batch on `queue` and wait for the delegate to finish with it.
pub(crate) async fn apply_on_queue(
    queue: &OperationQueue,
    delegate: Rc<dyn ZoneDelegate>,
    changed: Vec<Record>,
    deleted: Vec<RecordKey>,
) -> Result<(), ZoneError> {
    let (operation, done) = ApplyChangesOperation::new(delegate, changed, deleted);
    queue.enqueue(&OperationHandle::new(operation));
    // A dropped sender means the queue canceled the operation before it ran.
    done.await.unwrap_or(Err(ZoneError::Canceled))
}
