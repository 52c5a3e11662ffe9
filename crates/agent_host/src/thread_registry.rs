//! Conversation key → backend thread resolution.
//!
//! Threads are created lazily on first use and reused for the lifetime of the
//! conversation. Creation is serialized per key inside the process, and the
//! store's insert-if-absent collapses cross-process races to a single binding.

use parking_lot::Mutex;
use providers::AssistantBackend;
use services::ThreadStore;
use shared::{ConversationKey, RunError};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ThreadRegistry {
    backend: Arc<dyn AssistantBackend>,
    store: Arc<dyn ThreadStore>,
    creating: Mutex<HashMap<ConversationKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ThreadRegistry {
    pub fn new(backend: Arc<dyn AssistantBackend>, store: Arc<dyn ThreadStore>) -> Self {
        Self {
            backend,
            store,
            creating: Mutex::new(HashMap::new()),
        }
    }

    /// Existing thread for `key`, or a freshly created and persisted one.
    ///
    /// The binding is written before the id is returned; if that write fails
    /// no id is handed out.
    pub async fn get_or_create_thread(&self, key: &ConversationKey) -> Result<String, RunError> {
        if let Some(thread_id) = self.lookup(key).await? {
            return Ok(thread_id);
        }

        let gate = self
            .creating
            .lock()
            .entry(*key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = self.create_under_gate(key, &gate).await;

        let mut creating = self.creating.lock();
        // Nobody else is queued on the gate: only the map and `gate` hold it
        if Arc::strong_count(&gate) == 2 {
            creating.remove(key);
        }
        result
    }

    async fn create_under_gate(
        &self,
        key: &ConversationKey,
        gate: &tokio::sync::Mutex<()>,
    ) -> Result<String, RunError> {
        let _creating = gate.lock().await;

        // Another caller may have finished while we waited
        if let Some(thread_id) = self.lookup(key).await? {
            return Ok(thread_id);
        }

        let created = self.backend.create_thread().await?;
        let store = self.store.clone();
        let (bind_key, candidate) = (*key, created.clone());
        let bound = crate::blocking(move || store.bind_if_absent(&bind_key, &candidate))
            .await
            .map_err(persistence)?;

        if bound == created {
            tracing::info!(conversation = %key, thread_id = %bound, "created conversation thread");
        } else {
            tracing::warn!(
                conversation = %key,
                thread_id = %bound,
                orphaned = %created,
                "thread bound concurrently elsewhere, dropping the one just created"
            );
        }
        Ok(bound)
    }

    /// Id of the last run on `key`'s thread whose reply reached a caller
    pub async fn delivered_run(&self, key: &ConversationKey) -> Result<Option<String>, RunError> {
        let store = self.store.clone();
        let key = *key;
        crate::blocking(move || store.delivered_run(&key))
            .await
            .map_err(persistence)
    }

    pub async fn mark_delivered(&self, key: &ConversationKey, run_id: &str) -> Result<(), RunError> {
        let store = self.store.clone();
        let (key, run_id) = (*key, run_id.to_string());
        crate::blocking(move || store.mark_delivered(&key, &run_id))
            .await
            .map_err(persistence)
    }

    #[cfg(test)]
    pub(crate) fn pending_creations(&self) -> usize {
        self.creating.lock().len()
    }

    async fn lookup(&self, key: &ConversationKey) -> Result<Option<String>, RunError> {
        let store = self.store.clone();
        let key = *key;
        crate::blocking(move || store.thread_for(&key))
            .await
            .map_err(persistence)
    }
}

fn persistence(e: anyhow::Error) -> RunError {
    RunError::Persistence(format!("{:#}", e))
}
