//! Operation state machine for the queue.

use serde::{Deserialize, Serialize};

/// Where an operation is in its lifecycle.
///
/// State transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Blocked -> Pending (parent completed) -> Running -> Completed
/// - Pending | Blocked | Running -> Canceled
///
/// `Blocked` is derived from the dependency tracker, never stored.
/// `Completed` and `Canceled` are only ever observed through a `Completion`,
/// because the queue forgets an operation as soon as it reaches either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Enqueued and eligible to run.
    Pending,

    /// Enqueued, waiting on an incomplete parent.
    Blocked,

    /// Handed to `Operation::run`, completion not yet signaled.
    Running,

    /// Signaled completion without being canceled.
    Completed,

    /// Canceled before or while running.
    Canceled,
}

impl OperationState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Completed | OperationState::Canceled)
    }
}
