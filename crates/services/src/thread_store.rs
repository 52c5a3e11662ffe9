//! Persistence seam for conversation-to-thread bindings.

use anyhow::Result;
use parking_lot::Mutex;
use shared::ConversationKey;
use std::collections::HashMap;

/// Storage for [`ConversationKey`] → backend thread id bindings.
///
/// Bindings are never deleted or rebound. `bind_if_absent` must be atomic at
/// the storage layer: when two writers race for the same key exactly one id
/// wins and both callers get the winner back.
///
/// Each binding also remembers the last run whose reply was handed out, so a
/// restarted process does not hand the same reply out again.
pub trait ThreadStore: Send + Sync {
    fn thread_for(&self, key: &ConversationKey) -> Result<Option<String>>;

    /// Insert the binding unless one exists; returns the id now bound to `key`.
    fn bind_if_absent(&self, key: &ConversationKey, thread_id: &str) -> Result<String>;

    fn delivered_run(&self, key: &ConversationKey) -> Result<Option<String>>;

    /// Record `run_id` as delivered; a no-op for keys without a binding.
    fn mark_delivered(&self, key: &ConversationKey, run_id: &str) -> Result<()>;
}

/// In-memory bindings for tests and local development.
#[derive(Default)]
pub struct MemoryThreadStore {
    bindings: Mutex<HashMap<ConversationKey, Binding>>,
}

#[derive(Clone)]
struct Binding {
    thread_id: String,
    delivered_run: Option<String>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ThreadStore for MemoryThreadStore {
    fn thread_for(&self, key: &ConversationKey) -> Result<Option<String>> {
        Ok(self.bindings.lock().get(key).map(|b| b.thread_id.clone()))
    }

    fn bind_if_absent(&self, key: &ConversationKey, thread_id: &str) -> Result<String> {
        let mut bindings = self.bindings.lock();
        Ok(bindings
            .entry(*key)
            .or_insert_with(|| Binding {
                thread_id: thread_id.to_string(),
                delivered_run: None,
            })
            .thread_id
            .clone())
    }

    fn delivered_run(&self, key: &ConversationKey) -> Result<Option<String>> {
        Ok(self
            .bindings
            .lock()
            .get(key)
            .and_then(|b| b.delivered_run.clone()))
    }

    fn mark_delivered(&self, key: &ConversationKey, run_id: &str) -> Result<()> {
        if let Some(binding) = self.bindings.lock().get_mut(key) {
            binding.delivered_run = Some(run_id.to_string());
        }
        Ok(())
    }
}
