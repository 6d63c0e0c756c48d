//! Operation record: queue-owned metadata + the operation body.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use super::operation::{BlockOperation, Completion, CompletionBlock, Operation, OperationId};
use super::{OperationState, QueueInner};

/// Metadata the queue keeps next to each operation.
///
/// Design:
/// - The queue's table holds `OperationHandle`s (strong); everything pointing
///   back at the queue is a `Weak`.
/// - `id`, `canceled` and `queue` are written by the queue only.
pub(crate) struct OperationRecord {
    pub(super) id: Cell<Option<OperationId>>,
    pub(super) canceled: Cell<bool>,
    name: Option<String>,
    completion: RefCell<Option<CompletionBlock>>,

    /// Back-reference set on enqueue, cleared on completion or cancel.
    queue: RefCell<Option<Weak<QueueInner>>>,

    pub(super) body: RefCell<Box<dyn Operation>>,
}

impl OperationRecord {
    pub(super) fn queue(&self) -> Option<Rc<QueueInner>> {
        self.queue.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(super) fn attach(&self, queue: Weak<QueueInner>) {
        self.queue.replace(Some(queue));
    }

    pub(super) fn detach(&self) {
        self.queue.take();
    }

    /// Fire the completion block, at most once.
    pub(super) fn finish(&self, state: OperationState) {
        let Some(id) = self.id.get() else {
            return;
        };
        // Take before calling: the block may re-enter the queue.
        let block = self.completion.borrow_mut().take();
        if let Some(block) = block {
            block(Completion {
                id,
                name: self.name.clone(),
                state,
            });
        }
    }
}

/// Shared handle to an operation.
///
/// Cheap to clone. Keep one around to declare dependencies or cancel later;
/// dropping it is fine too, the queue owns the operation until it is done.
#[derive(Clone)]
pub struct OperationHandle {
    pub(super) record: Rc<OperationRecord>,
}

impl OperationHandle {
    pub fn new(operation: impl Operation) -> Self {
        let name = operation.name().map(str::to_owned);
        Self::build(Box::new(operation), name)
    }

    /// Like `new`, but overrides the operation's own name.
    pub fn with_name(operation: impl Operation, name: impl Into<String>) -> Self {
        Self::build(Box::new(operation), Some(name.into()))
    }

    /// Wrap a closure in a `BlockOperation`.
    pub fn from_fn(block: impl FnOnce() + 'static) -> Self {
        Self::new(BlockOperation::new(block))
    }

    fn build(body: Box<dyn Operation>, name: Option<String>) -> Self {
        Self {
            record: Rc::new(OperationRecord {
                id: Cell::new(None),
                canceled: Cell::new(false),
                name,
                completion: RefCell::new(None),
                queue: RefCell::new(None),
                body: RefCell::new(body),
            }),
        }
    }

    /// Assigned on first `enqueue` or `add_dependency`.
    pub fn id(&self) -> Option<OperationId> {
        self.record.id.get()
    }

    pub fn name(&self) -> Option<&str> {
        self.record.name.as_deref()
    }

    pub fn is_canceled(&self) -> bool {
        self.record.canceled.get()
    }

    /// Set the block run when the operation completes or is canceled.
    ///
    /// Replaces any block set earlier.
    pub fn on_completion(&self, block: impl FnOnce(Completion) + 'static) {
        self.record.completion.replace(Some(Box::new(block)));
    }

    pub fn downgrade(&self) -> WeakOperationHandle {
        WeakOperationHandle(Rc::downgrade(&self.record))
    }

    pub fn ptr_eq(&self, other: &OperationHandle) -> bool {
        Rc::ptr_eq(&self.record, &other.record)
    }
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Non-owning handle; tells whether anything still keeps the operation alive.
#[derive(Clone)]
pub struct WeakOperationHandle(Weak<OperationRecord>);

impl WeakOperationHandle {
    pub fn upgrade(&self) -> Option<OperationHandle> {
        self.0.upgrade().map(|record| OperationHandle { record })
    }

    pub fn is_released(&self) -> bool {
        self.0.strong_count() == 0
    }
}
