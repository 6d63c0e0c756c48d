//! Main-thread operation queue: one operation at a time, dependency-aware,
//! cooperative cancellation.
//!
//! Everything here is `!Send`. The queue lives on the orchestration
//! context (a `tokio::task::LocalSet`) and must be driven from it; scheduling is
//! deferred with `spawn_local`, so calling in from outside a `LocalSet` panics.

mod dependency;
mod operation;
mod record;
mod state;

pub use dependency::DependencyTracker;
pub use operation::{BlockOperation, Completion, CompletionBlock, Operation, OperationContext, OperationId};
pub use record::{OperationHandle, WeakOperationHandle};
pub use state::OperationState;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use crate::observability::QueueSnapshot;
use record::OperationRecord;

/// Mutable queue state. Only touched through `QueueInner::state`.
#[derive(Default)]
struct QueueState {
    /// All operations the queue currently owns (pending or running).
    operations: HashMap<OperationId, OperationHandle>,

    /// Ids waiting to start, in insertion order.
    pending: Vec<OperationId>,

    current: Option<OperationId>,

    /// Last id handed out.
    last_id: u64,

    suspended: bool,

    dependencies: DependencyTracker,

    /// Ids handed out (by `add_dependency` or `cancel`) but not enqueued yet.
    unqueued: HashSet<OperationId>,

    /// Ids canceled by a cascade before they were ever enqueued.
    tombstones: HashSet<OperationId>,

    advance_scheduled: bool,
}

impl QueueState {
    fn ensure_id(&mut self, record: &OperationRecord) -> OperationId {
        if let Some(id) = record.id.get() {
            return id;
        }
        self.last_id += 1;
        let id = OperationId::new(self.last_id);
        record.id.set(Some(id));
        self.unqueued.insert(id);
        id
    }

    fn is_available(&self, id: OperationId) -> bool {
        match self.operations.get(&id) {
            Some(operation) => !operation.is_canceled() && !self.dependencies.is_blocked(id),
            None => {
                error!(op = %id, "pending operation missing from storage");
                debug_assert!(false, "pending operation {id} missing from storage");
                false
            }
        }
    }

    fn first_available(&self) -> Option<usize> {
        self.pending.iter().position(|id| self.is_available(*id))
    }

    /// Pop the next eligible operation and mark it current.
    fn take_next(&mut self) -> Option<OperationHandle> {
        let position = self.first_available()?;
        let id = self.pending.remove(position);
        self.current = Some(id);
        self.operations.get(&id).cloned()
    }

    /// `ids` plus everything transitively waiting on them.
    fn with_descendants(&self, ids: Vec<OperationId>) -> Vec<OperationId> {
        let mut seen = HashSet::new();
        let mut all = Vec::new();
        let mut frontier: VecDeque<OperationId> = ids.into();
        while let Some(id) = frontier.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            all.push(id);
            if let Some(children) = self.dependencies.descendant_ids(id) {
                frontier.extend(children);
            }
        }
        all
    }

    fn is_idle(&self) -> bool {
        self.current.is_none() && (self.suspended || self.first_available().is_none())
    }
}

pub(crate) struct QueueInner {
    state: RefCell<QueueState>,
    idle: Notify,
}

impl QueueInner {
    /// Defer an "attempt to advance" to the next turn of the local executor.
    fn schedule_advance(self: &Rc<Self>) {
        {
            let mut state = self.state.borrow_mut();
            if state.advance_scheduled {
                return;
            }
            state.advance_scheduled = true;
        }
        let queue = Rc::downgrade(self);
        tokio::task::spawn_local(async move {
            if let Some(queue) = queue.upgrade() {
                queue.run_next_if_needed();
            }
        });
    }

    fn run_next_if_needed(self: &Rc<Self>) {
        let next = {
            let mut state = self.state.borrow_mut();
            state.advance_scheduled = false;
            if state.current.is_some() {
                return;
            }
            if state.suspended {
                None
            } else {
                state.take_next()
            }
        };

        let Some(operation) = next else {
            self.idle.notify_waiters();
            return;
        };

        let record = &operation.record;
        let Some(id) = record.id.get() else {
            debug_assert!(false, "scheduled operation without id");
            return;
        };
        debug!(op = %id, name = ?operation.name(), "running operation");
        let ctx = OperationContext::new(id, Rc::downgrade(record));
        record.body.borrow_mut().run(ctx);
    }

    pub(crate) fn operation_did_complete(self: &Rc<Self>, record: &Rc<OperationRecord>) {
        let Some(id) = record.id.get() else {
            error!("completion signaled by an operation without id");
            debug_assert!(false, "completion signaled by an operation without id");
            return;
        };

        let canceled = record.canceled.get();
        let removed = {
            let mut state = self.state.borrow_mut();
            if state.current == Some(id) {
                state.current = None;
            }
            if !canceled {
                state.dependencies.mark_completed(id);
            }
            state.operations.remove(&id)
        };
        if removed.is_none() {
            warn!(op = %id, "completion for an operation the queue does not hold");
        }

        record.detach();
        let final_state = if canceled {
            OperationState::Canceled
        } else {
            OperationState::Completed
        };
        trace!(op = %id, state = ?final_state, "operation finished");
        record.finish(final_state);
        drop(removed);

        self.schedule_advance();
    }

    pub(crate) fn cancel_ids(self: &Rc<Self>, ids: Vec<OperationId>) {
        let canceled = {
            let mut state = self.state.borrow_mut();
            let ids = state.with_descendants(ids);
            let targets: HashSet<OperationId> = ids.iter().copied().collect();

            state.pending.retain(|id| !targets.contains(id));
            if state.current.is_some_and(|current| targets.contains(&current)) {
                state.current = None;
            }
            state.dependencies.cancel(&ids);

            let mut canceled = Vec::with_capacity(ids.len());
            for id in ids {
                match state.operations.remove(&id) {
                    Some(operation) => canceled.push(operation),
                    // Already finished ids need nothing.
                    None if state.unqueued.remove(&id) => {
                        state.tombstones.insert(id);
                    }
                    None => {}
                }
            }
            canceled
        };

        if !canceled.is_empty() {
            debug!(count = canceled.len(), "canceled operations");
        }
        for operation in &canceled {
            operation.record.canceled.set(true);
            operation.record.detach();
        }
        for operation in &canceled {
            operation.record.finish(OperationState::Canceled);
        }
        drop(canceled);

        self.schedule_advance();
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut operations: Vec<(OperationId, OperationHandle)> =
            state.operations.drain().collect();
        operations.sort_by_key(|(id, _)| *id);
        state.pending.clear();
        state.current = None;

        for (_, operation) in &operations {
            operation.record.canceled.set(true);
            operation.record.detach();
        }
        for (_, operation) in &operations {
            operation.record.finish(OperationState::Canceled);
        }
    }
}

/// Runs operations one at a time on the orchestration context.
///
/// Not suspended on creation. Cloning gives another handle to the same queue;
/// when the last handle is dropped, every operation it still holds is canceled.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Rc<QueueInner>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(QueueInner {
                state: RefCell::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Add an operation. Assigns its id if it has none yet.
    pub fn enqueue(&self, operation: &OperationHandle) {
        let record = &operation.record;
        let admitted = {
            let mut state = self.inner.state.borrow_mut();
            let id = state.ensure_id(record);
            state.unqueued.remove(&id);

            if state.tombstones.remove(&id) {
                record.canceled.set(true);
            }
            if record.canceled.get() {
                debug!(op = %id, "enqueued an already canceled operation");
                false
            } else if state.operations.contains_key(&id) {
                warn!(op = %id, "operation enqueued twice, ignoring");
                return;
            } else {
                record.attach(Rc::downgrade(&self.inner));
                state.operations.insert(id, operation.clone());
                state.pending.push(id);
                true
            }
        };

        if admitted {
            self.inner.schedule_advance();
        } else {
            record.finish(OperationState::Canceled);
        }
    }

    /// Same as calling `enqueue` for each, in order.
    pub fn enqueue_many<'a>(&self, operations: impl IntoIterator<Item = &'a OperationHandle>) {
        for operation in operations {
            self.enqueue(operation);
        }
    }

    /// Make `child` wait for `parent`.
    ///
    /// Call this *before* enqueueing either one: `enqueue` may start an operation
    /// on the very next turn.
    pub fn add_dependency(&self, child: &OperationHandle, parent: &OperationHandle) {
        let mut state = self.inner.state.borrow_mut();
        let child_id = state.ensure_id(&child.record);
        let parent_id = state.ensure_id(&parent.record);
        state.dependencies.add_dependency(child_id, parent_id);
    }

    /// Cancel the running operation and everything pending.
    ///
    /// The running operation is not interrupted; its canceled flag is set.
    pub fn cancel_all(&self) {
        let ids = {
            let state = self.inner.state.borrow();
            let mut ids = state.pending.clone();
            ids.extend(state.current);
            ids
        };
        self.inner.cancel_ids(ids);
    }

    /// Cancel `operations` and, transitively, everything depending on them.
    pub fn cancel(&self, operations: &[OperationHandle]) {
        let ids = {
            let mut state = self.inner.state.borrow_mut();
            operations
                .iter()
                .map(|operation| {
                    operation.record.canceled.set(true);
                    state.ensure_id(&operation.record)
                })
                .collect()
        };
        self.inner.cancel_ids(ids);
    }

    pub fn cancel_operation(&self, operation: &OperationHandle) {
        self.cancel(std::slice::from_ref(operation));
    }

    /// Stop starting new operations. The running one, if any, runs to completion.
    pub fn suspend(&self) {
        self.inner.state.borrow_mut().suspended = true;
    }

    pub fn resume(&self) {
        self.inner.state.borrow_mut().suspended = false;
        self.inner.schedule_advance();
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.borrow().suspended
    }

    /// Operations added but not yet started.
    pub fn pending_count(&self) -> usize {
        self.inner.state.borrow().pending.len()
    }

    pub fn current(&self) -> Option<OperationId> {
        self.inner.state.borrow().current
    }

    /// Live state of an operation the queue still holds.
    pub fn state_of(&self, id: OperationId) -> Option<OperationState> {
        let state = self.inner.state.borrow();
        if state.current == Some(id) {
            return Some(OperationState::Running);
        }
        if !state.pending.contains(&id) {
            return None;
        }
        if state.dependencies.is_blocked(id) {
            Some(OperationState::Blocked)
        } else {
            Some(OperationState::Pending)
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.borrow();
        QueueSnapshot {
            pending: state.pending.len(),
            running: state.current,
            held: state.operations.len(),
            dependencies: state.dependencies.len(),
            suspended: state.suspended,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.inner.state.borrow().is_idle()
    }

    /// Resolves once nothing is running and nothing eligible is waiting.
    ///
    /// Operations blocked on a parent that was never enqueued don't keep it waiting.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}
