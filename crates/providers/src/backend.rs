//! Backend seams consumed by the orchestration layer.
//!
//! Note: Uses async_trait for object safety

use anyhow::Result;
use shared::agent_api::ChatMessage;
use shared::{RunHandle, ThreadMessage};

/// Stateful thread/run conversation API.
#[async_trait::async_trait]
pub trait AssistantBackend: Send + Sync {
    /// Create an empty thread and return its id
    async fn create_thread(&self) -> Result<String>;

    /// Most recent run on the thread, if any
    async fn latest_run(&self, thread_id: &str) -> Result<Option<RunHandle>>;

    /// Start a run of `assistant_id` over the thread's messages
    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunHandle>;

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunHandle>;

    /// Most recent message on the thread, whoever authored it
    async fn latest_message(&self, thread_id: &str) -> Result<Option<ThreadMessage>>;

    /// Append a user-authored message
    async fn create_message(&self, thread_id: &str, text: &str) -> Result<()>;
}

/// Request knobs for a single completion.
#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Single request/response completion model.
#[async_trait::async_trait]
pub trait ClassifierBackend: Send + Sync {
    async fn complete(&self, messages: Vec<ChatMessage>, params: &CompletionParams)
        -> Result<String>;
}
