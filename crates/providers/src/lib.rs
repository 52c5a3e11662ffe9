//! Outbound clients for the conversation backend and the classifier model.

pub mod assistants;
pub mod backend;
pub mod openai;

pub use assistants::AssistantsClient;
pub use backend::{AssistantBackend, ClassifierBackend, CompletionParams};
pub use openai::OpenAIClient;
