use anyhow::{anyhow, Result};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::{MessageRole, RunHandle, RunStatus, ThreadMessage};
use std::time::Duration;

use crate::backend::AssistantBackend;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

// ── Request types ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

// ── Response types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ThreadObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    thread_id: String,
    status: RunStatus,
    #[serde(default)]
    last_error: Option<RunLastError>,
}

#[derive(Debug, Deserialize)]
struct RunLastError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    role: MessageRole,
    #[serde(default)]
    content: Vec<MessageContent>,
}

/// Only text parts are consumed; image parts and the like are skipped.
#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    value: String,
}

// ── Conversion ───────────────────────────────────────────────────────

impl From<RunObject> for RunHandle {
    fn from(run: RunObject) -> Self {
        let last_error = run.last_error.map(|e| match (e.code, e.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message,
            (Some(code), None) => code,
            (None, None) => "unknown error".to_string(),
        });
        RunHandle {
            thread_id: run.thread_id,
            run_id: run.id,
            status: run.status,
            last_error,
        }
    }
}

impl From<MessageObject> for ThreadMessage {
    fn from(message: MessageObject) -> Self {
        let text = message
            .content
            .into_iter()
            .filter(|c| c.content_type == "text")
            .filter_map(|c| c.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join("\n");
        ThreadMessage {
            role: message.role,
            text,
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// HTTP client for the thread/run/message conversation API.
pub struct AssistantsClient {
    http: Client,
    auth_token: String,
    base_url: String,
}

impl AssistantsClient {
    pub fn new(api_key: &str, base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            http,
            auth_token: api_key.to_string(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.auth_token))
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = self.authorized(req).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let detail: String = body.chars().take(800).collect();
            tracing::debug!(%status, "assistants request rejected");
            if detail.trim().is_empty() {
                return Err(anyhow!("assistants error: {}", status));
            }
            return Err(anyhow!("assistants error: {}\n{}", status, detail));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait::async_trait]
impl AssistantBackend for AssistantsClient {
    async fn create_thread(&self) -> Result<String> {
        let req = self
            .http
            .post(self.url("threads"))
            .json(&serde_json::json!({}));
        let thread: ThreadObject = self.send(req).await?;
        tracing::debug!(thread_id = %thread.id, "thread created");
        Ok(thread.id)
    }

    async fn latest_run(&self, thread_id: &str) -> Result<Option<RunHandle>> {
        let req = self
            .http
            .get(self.url(&format!("threads/{}/runs", thread_id)))
            .query(&[("limit", "1"), ("order", "desc")]);
        let runs: ListResponse<RunObject> = self.send(req).await?;
        Ok(runs.data.into_iter().next().map(RunHandle::from))
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunHandle> {
        let req = self
            .http
            .post(self.url(&format!("threads/{}/runs", thread_id)))
            .json(&CreateRunRequest { assistant_id });
        let run: RunObject = self.send(req).await?;
        Ok(run.into())
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunHandle> {
        let req = self
            .http
            .get(self.url(&format!("threads/{}/runs/{}", thread_id, run_id)));
        let run: RunObject = self.send(req).await?;
        Ok(run.into())
    }

    async fn latest_message(&self, thread_id: &str) -> Result<Option<ThreadMessage>> {
        let req = self
            .http
            .get(self.url(&format!("threads/{}/messages", thread_id)))
            .query(&[("limit", "1"), ("order", "desc")]);
        let messages: ListResponse<MessageObject> = self.send(req).await?;
        Ok(messages.data.into_iter().next().map(ThreadMessage::from))
    }

    async fn create_message(&self, thread_id: &str, text: &str) -> Result<()> {
        let req = self
            .http
            .post(self.url(&format!("threads/{}/messages", thread_id)))
            .json(&CreateMessageRequest {
                role: "user",
                content: text,
            });
        let _: serde_json::Value = self.send(req).await?;
        Ok(())
    }
}
