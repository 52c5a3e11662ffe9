//! Conversation partitioning and backend run types.
//!
//! A [`ConversationKey`] decides which backend thread a request lands in.
//! Every (user, mode, context) combination owns its own thread so billing
//! tiers and unrelated topics never share history.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Billing tier the user is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Free,
    Pro,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Free => "free",
            Mode::Pro => "pro",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Mode::Free => "FREE",
            Mode::Pro => "PRO",
        }
    }

    /// Lenient parse used for persisted values; unknown strings map to `None`.
    pub fn parse(raw: &str) -> Option<Mode> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Mode::Free),
            "pro" => Some(Mode::Pro),
            _ => None,
        }
    }
}

/// Topic a conversation thread is dedicated to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationContext {
    Forecast,
    ActionCheck,
}

impl ConversationContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationContext::Forecast => "forecast",
            ConversationContext::ActionCheck => "action_check",
        }
    }
}

/// Identity of one backend conversation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub user_id: i64,
    pub mode: Mode,
    pub context: ConversationContext,
}

impl ConversationKey {
    pub fn new(user_id: i64, mode: Mode, context: ConversationContext) -> Self {
        Self {
            user_id,
            mode,
            context,
        }
    }

    /// Storage discriminator within a user's rows, e.g. `pro:forecast`.
    pub fn scope(&self) -> String {
        format!("{}:{}", self.mode.as_str(), self.context.as_str())
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.scope())
    }
}

/// Run lifecycle status as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
}

impl RunStatus {
    /// A run in one of these states blocks creation of another run on its thread.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunStatus::Queued
                | RunStatus::InProgress
                | RunStatus::RequiresAction
                | RunStatus::Cancelling
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
            RunStatus::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a backend run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub thread_id: String,
    pub run_id: String,
    pub status: RunStatus,
    /// Opaque diagnostic attached by the backend to failed runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Author of a thread message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Text-bearing message read back from a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: MessageRole,
    pub text: String,
}
