//! Operation trait and the context handed to it at run time.

use std::fmt;
use std::rc::Weak;

use serde::{Deserialize, Serialize};

use super::OperationState;
use super::record::OperationRecord;

/// Identifier the queue assigns to an operation.
///
/// Ids come from a per-queue counter and are never reused.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Work run by `OperationQueue`, one at a time, on the orchestration context.
///
/// `run` is called synchronously. The operation may start async work with
/// `tokio::task::spawn_local` and signal completion later through the context.
///
/// # Contract
/// - Call `ctx.complete()` once the work is done. A canceled operation may skip it;
///   the queue has already let go of it.
/// - Poll `ctx.is_canceled()` between steps and stop early when it is set, leaving
///   any persisted state consistent rather than half-written.
/// - Never hold on to the queue; the context is the only link back to it.
pub trait Operation: 'static {
    /// Debug name, used in logs and completions.
    fn name(&self) -> Option<&str> {
        None
    }

    fn run(&mut self, ctx: OperationContext);
}

/// Called once when an operation leaves the queue.
pub type CompletionBlock = Box<dyn FnOnce(Completion)>;

/// What a completion block is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: OperationId,
    pub name: Option<String>,

    /// `Completed` or `Canceled`.
    pub state: OperationState,
}

impl Completion {
    pub fn is_canceled(&self) -> bool {
        self.state == OperationState::Canceled
    }
}

/// The running operation's view of the queue.
///
/// Holds no strong reference to the queue or to the operation itself, so an
/// operation that was canceled and dropped can't be kept alive by its context.
pub struct OperationContext {
    id: OperationId,
    record: Weak<OperationRecord>,
}

impl OperationContext {
    pub(super) fn new(id: OperationId, record: Weak<OperationRecord>) -> Self {
        Self { id, record }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// True once the queue canceled this operation (or dropped it).
    pub fn is_canceled(&self) -> bool {
        self.record
            .upgrade()
            .is_none_or(|record| record.canceled.get())
    }

    /// Signal the queue that this operation is done.
    ///
    /// Ignored when the operation was canceled in the meantime.
    pub fn complete(self) {
        let Some(record) = self.record.upgrade() else {
            return;
        };
        let Some(queue) = record.queue() else {
            return;
        };
        queue.operation_did_complete(&record);
    }

    /// Ask the queue to cancel this operation (and its dependents).
    pub fn cancel(&self) {
        let Some(record) = self.record.upgrade() else {
            return;
        };
        if let Some(queue) = record.queue() {
            queue.cancel_ids(vec![self.id]);
        }
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Runs a closure and completes immediately.
pub struct BlockOperation<F> {
    block: Option<F>,
}

impl<F: FnOnce() + 'static> BlockOperation<F> {
    pub fn new(block: F) -> Self {
        Self { block: Some(block) }
    }
}

impl<F: FnOnce() + 'static> Operation for BlockOperation<F> {
    fn name(&self) -> Option<&str> {
        Some("BlockOperation")
    }

    fn run(&mut self, ctx: OperationContext) {
        if let Some(block) = self.block.take() {
            block();
        }
        ctx.complete();
    }
}
