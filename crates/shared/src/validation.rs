//! Action validation results and clarification bookkeeping.

use serde::{Deserialize, Serialize};

/// Why validation could not produce a classifier verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[default]
    None,
    /// Rejected locally, no network call was made
    HeuristicFail,
    /// Classifier unreachable or returned unusable output
    ParseError,
}

/// Verdict for one piece of user input. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_action: bool,
    pub action_clean: String,
    pub needs_details: bool,
    pub question_to_user: String,
    pub failure_kind: FailureKind,
}

impl ValidationResult {
    /// A failed validation: not an action, canned message for the user.
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            is_action: false,
            action_clean: String::new(),
            needs_details: false,
            question_to_user: message.into(),
            failure_kind: kind,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure_kind != FailureKind::None
    }

    /// Ready to be sent to the backend as-is.
    pub fn is_dispatchable(&self) -> bool {
        !self.is_failure() && self.is_action && !self.needs_details
    }
}

/// Per-session progress of the check-action flow.
///
/// `round` is 0 while waiting for the first description and 1 after a single
/// clarifying question was asked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationState {
    pub accumulated_draft: String,
    pub round: u8,
}

impl ClarificationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_clarifying(&self) -> bool {
        self.round > 0
    }

    pub fn reset(&mut self) {
        self.accumulated_draft.clear();
        self.round = 0;
    }
}
