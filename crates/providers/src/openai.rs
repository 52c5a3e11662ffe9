use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::agent_api::ChatMessage;
use std::time::Duration;

use crate::backend::{ClassifierBackend, CompletionParams};

// ── Request types ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

// ── Response types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────

/// Chat-completions client used for cheap one-shot classification.
pub struct OpenAIClient {
    http: Client,
    auth_token: String,
    model: String,
    base_url: String,
}

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

impl OpenAIClient {
    pub fn new(
        api_key: &str,
        model: &str,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            http,
            auth_token: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let req = OpenAIRequest {
            model: &self.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };
        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.auth_token))
            .header("Content-Type", "application/json")
            .json(&req)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let detail: String = body.chars().take(800).collect();
            if detail.trim().is_empty() {
                return Err(anyhow!("openai error: {}", status));
            }
            return Err(anyhow!("openai error: {}\n{}", status, detail));
        }
        let body: OpenAIResponse = resp.json().await?;
        extract_content(body)
    }
}

/// First choice's text, or an error when the model returned nothing usable.
fn extract_content(body: OpenAIResponse) -> Result<String> {
    body.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| anyhow!("empty completion from model"))
}

#[async_trait::async_trait]
impl ClassifierBackend for OpenAIClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        params: &CompletionParams,
    ) -> Result<String> {
        self.generate(&messages, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let messages = vec![ChatMessage::system("classify"), ChatMessage::user("купить билет")];
        let req = OpenAIRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            temperature: 0.0,
            max_tokens: 120,
        };
        let value = serde_json::to_value(&req).unwrap();

        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["max_tokens"], 120);
        assert_eq!(value["messages"][1]["role"], "user");
    }

    #[test]
    fn test_empty_choices_is_an_error() {
        let body: OpenAIResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(extract_content(body).is_err());

        let body: OpenAIResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"role": "assistant", "content": "  {\"is_action\": true} "}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(body).unwrap(), "{\"is_action\": true}");
    }
}
