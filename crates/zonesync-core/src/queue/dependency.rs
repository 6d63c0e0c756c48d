//! Dependency tracker for queued operations.
//!
//! Design:
//! - Entries are keyed by the parent id: parent -> children blocked until it completes.
//! - An entry whose child set becomes empty is pruned right away.
//! - Single-threaded: only the queue touches it, from the orchestration context.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use super::OperationId;

/// Children blocked by one parent.
#[derive(Debug, Default)]
struct Dependency {
    parent_did_complete: bool,

    /// Insertion-ordered so cascades are deterministic.
    children: Vec<OperationId>,
}

impl Dependency {
    fn add(&mut self, child: OperationId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    fn remove(&mut self, child: OperationId) {
        self.children.retain(|id| *id != child);
    }

    fn blocks(&self, id: OperationId) -> bool {
        !self.parent_did_complete && self.children.contains(&id)
    }
}

/// Tracks "child may not run until parent completes" relations.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    /// parent -> dependency entry
    dependencies: HashMap<OperationId, Dependency>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `child` wait for `parent`.
    ///
    /// Idempotent. Has no retroactive effect on a child that already started.
    pub fn add_dependency(&mut self, child: OperationId, parent: OperationId) {
        self.dependencies.entry(parent).or_default().add(child);
    }

    /// Is `id` still waiting on an incomplete parent?
    pub fn is_blocked(&self, id: OperationId) -> bool {
        self.dependencies.values().any(|dependency| dependency.blocks(id))
    }

    /// Children currently registered under `parent`, if it has an entry.
    pub fn descendant_ids(&self, parent: OperationId) -> Option<Vec<OperationId>> {
        self.dependencies
            .get(&parent)
            .map(|dependency| dependency.children.clone())
    }

    /// Call when `id` finished normally (not canceled).
    pub fn mark_completed(&mut self, id: OperationId) {
        if let Some(dependency) = self.dependencies.get_mut(&id) {
            dependency.parent_did_complete = true;
        }
        self.remove_child(id);
        self.prune();
    }

    /// Call when `ids` were canceled: drops them as parents and as children.
    pub fn cancel(&mut self, ids: &[OperationId]) {
        for id in ids {
            self.dependencies.remove(id);
        }
        for id in ids {
            self.remove_child(*id);
        }
        self.prune();
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    fn remove_child(&mut self, child: OperationId) {
        for dependency in self.dependencies.values_mut() {
            dependency.remove(child);
        }
    }

    fn prune(&mut self) {
        let parents: Vec<OperationId> = self.dependencies.keys().copied().collect();
        for parent in parents {
            if let Entry::Occupied(entry) = self.dependencies.entry(parent)
                && entry.get().children.is_empty()
            {
                entry.remove_entry();
            }
        }
    }
}
