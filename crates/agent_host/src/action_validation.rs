//! Two-stage gate in front of the "check action" request.
//!
//! A local heuristic throws away greetings, links and junk without any
//! network call; what survives goes to a cheap classifier model that must
//! answer with a small JSON object. Anything the classifier gets wrong
//! degrades to [`FailureKind::ParseError`] with a canned message.

use providers::{ClassifierBackend, CompletionParams};
use regex::Regex;
use serde::Deserialize;
use shared::agent_api::ChatMessage;
use shared::settings::ClassifierSettings;
use shared::{FailureKind, ValidationResult};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::prompts::{
    validation_user_prompt, HEURISTIC_FAIL_MESSAGE, PARSE_ERROR_FALLBACK, SHORT_ACTION_QUESTION,
    VALIDATION_SYSTEM_PROMPT,
};

/// Accepted input length in characters, after trimming
pub const MIN_LEN: usize = 4;
pub const MAX_LEN: usize = 160;

/// Actions this short are always sent back for clarification
const SHORT_ACTION_WORDS: usize = 2;

const REJECT_PHRASES: &[&str] = &["привет", "как дела", "кто ты", "что ты умеешь"];

static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)https?://\S+|www\.\S+").expect("valid link regex"));

static ONLY_DIGITS_OR_SYMBOLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\d\s\W]+$").expect("valid symbols regex"));

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```(?:json)?\s*").expect("valid fence regex"));

static FENCE_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*```\s*$").expect("valid fence regex"));

/// Why the heuristic stage turned the input away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooShort,
    TooLong,
    NoWords,
    Link,
    SmallTalk,
}

/// Zero-network pre-filter. Pure and synchronous.
pub fn heuristic_check(text: &str) -> Result<(), Rejection> {
    let s = text.trim();
    let len = s.chars().count();
    if len < MIN_LEN {
        return Err(Rejection::TooShort);
    }
    if len > MAX_LEN {
        return Err(Rejection::TooLong);
    }
    if ONLY_DIGITS_OR_SYMBOLS.is_match(s) {
        return Err(Rejection::NoWords);
    }
    if LINK.is_match(s) {
        return Err(Rejection::Link);
    }
    let lower = s.to_lowercase();
    if REJECT_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        return Err(Rejection::SmallTalk);
    }
    Ok(())
}

/// Classifier reply. Missing fields fall back to their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClassifierVerdict {
    is_action: bool,
    action_clean: Option<String>,
    needs_details: bool,
    question_to_user: Option<String>,
}

/// Drop a markdown code fence wrapped around the payload, if any.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let start = FENCE_OPEN.find(trimmed).map_or(0, |m| m.end());
    let body = &trimmed[start..];
    let end = FENCE_CLOSE.find(body).map_or(body.len(), |m| m.start());
    &body[..end]
}

/// Turn the classifier's raw answer into a verdict for `user_text`.
fn interpret(user_text: &str, raw: &str) -> ValidationResult {
    let payload = strip_fences(raw);
    let verdict: ClassifierVerdict = match serde_json::from_str(payload) {
        Ok(verdict) => verdict,
        Err(e) => {
            let preview: String = payload.chars().take(200).collect();
            tracing::debug!(error = %e, raw = %preview, "classifier reply is not valid JSON");
            return ValidationResult::failed(FailureKind::ParseError, PARSE_ERROR_FALLBACK);
        }
    };

    let action_clean = verdict
        .action_clean
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| user_text.trim())
        .to_string();
    let mut needs_details = verdict.needs_details;
    let mut question = verdict
        .question_to_user
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    // "отпуск" or "в школе" is an action only in name; ask where/with whom
    if verdict.is_action
        && !needs_details
        && action_clean.split_whitespace().count() <= SHORT_ACTION_WORDS
    {
        needs_details = true;
        if question.is_empty() {
            question = SHORT_ACTION_QUESTION.to_string();
        }
    }
    if question.is_empty() {
        question = PARSE_ERROR_FALLBACK.to_string();
    }

    ValidationResult {
        is_action: verdict.is_action,
        action_clean,
        needs_details,
        question_to_user: question,
        failure_kind: FailureKind::None,
    }
}

pub struct ActionValidator {
    classifier: Arc<dyn ClassifierBackend>,
    params: CompletionParams,
    timeout: Duration,
}

impl ActionValidator {
    pub fn new(classifier: Arc<dyn ClassifierBackend>, params: CompletionParams, timeout: Duration) -> Self {
        Self {
            classifier,
            params,
            timeout,
        }
    }

    pub fn from_settings(classifier: Arc<dyn ClassifierBackend>, settings: &ClassifierSettings) -> Self {
        Self::new(
            classifier,
            CompletionParams {
                max_tokens: settings.max_tokens,
                temperature: settings.temperature,
            },
            Duration::from_secs(settings.timeout_secs),
        )
    }

    /// Classify free text. Never fails; failures come back as `failure_kind`.
    pub async fn validate(&self, user_text: &str) -> ValidationResult {
        if let Err(reason) = heuristic_check(user_text) {
            tracing::debug!(?reason, "action rejected by heuristic");
            return ValidationResult::failed(FailureKind::HeuristicFail, HEURISTIC_FAIL_MESSAGE);
        }

        let messages = vec![
            ChatMessage::system(VALIDATION_SYSTEM_PROMPT),
            ChatMessage::user(validation_user_prompt(user_text)),
        ];
        let raw = match tokio::time::timeout(
            self.timeout,
            self.classifier.complete(messages, &self.params),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "classifier call failed");
                return ValidationResult::failed(FailureKind::ParseError, PARSE_ERROR_FALLBACK);
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "classifier call timed out"
                );
                return ValidationResult::failed(FailureKind::ParseError, PARSE_ERROR_FALLBACK);
            }
        };

        let result = interpret(user_text, &raw);
        tracing::debug!(
            is_action = result.is_action,
            needs_details = result.needs_details,
            failure = ?result.failure_kind,
            "action classified"
        );
        result
    }
}
