//! Concurrency-safe task registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::task::TaskHandle;

/// In-memory mapping from task id to handle.
///
/// Safe for concurrent set/get/delete from arbitrary callers; the only
/// ordering guarantee is last-writer-wins per key.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<TaskHandle>>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a handle, replacing any previous entry for the id.
    pub fn set(&self, id: impl Into<String>, handle: Arc<TaskHandle>) {
        self.tasks.write().insert(id.into(), handle);
    }

    /// Look up a handle.
    pub fn get(&self, id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.read().get(id).cloned()
    }

    /// Whether a task id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.tasks.read().contains_key(id)
    }

    /// Remove a handle.
    pub fn delete(&self, id: &str) {
        self.tasks.write().remove(id);
    }

    /// Snapshot of all registered handles.
    pub fn handles(&self) -> Vec<Arc<TaskHandle>> {
        self.tasks.read().values().cloned().collect()
    }
}
