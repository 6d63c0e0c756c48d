use serde::{Deserialize, Serialize};

use crate::queue::OperationId;

/// Point-in-time view of an `OperationQueue`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Added, not yet started (blocked ones included).
    pub pending: usize,
    pub running: Option<OperationId>,
    /// Operations the queue still owns, running one included.
    pub held: usize,
    /// Parents with at least one registered child.
    pub dependencies: usize,
    pub suspended: bool,
}
