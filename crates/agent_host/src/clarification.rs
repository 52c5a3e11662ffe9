//! Bounded clarification for the "check action" flow.
//!
//! The user gets at most one clarifying question. Their answer is appended
//! to the original draft and validated again; if that is still too vague the
//! flow gives up and asks for a one-sentence restatement.

use shared::{ClarificationState, ValidationResult};

use crate::action_validation::ActionValidator;
use crate::prompts::MSG_TOO_GENERAL;

/// What the caller should do after one round of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClarificationStep {
    /// Send `action` to the backend; state is reset
    Dispatch { action: String },
    /// Show the question and wait for the user's next message
    Ask { question: String },
    /// Not a checkable action; state is reset
    Reject { message: String },
    /// Still vague after the one allowed question; state is reset
    Abandon { message: String },
}

/// Validate `input` in the context of `state` and advance the state machine.
pub async fn advance(
    state: &mut ClarificationState,
    validator: &ActionValidator,
    input: &str,
) -> ClarificationStep {
    let draft = if state.is_clarifying() {
        format!("{} {}", state.accumulated_draft.trim(), input.trim())
    } else {
        input.trim().to_string()
    };

    let verdict = validator.validate(&draft).await;
    step(state, draft, verdict)
}

fn step(state: &mut ClarificationState, draft: String, verdict: ValidationResult) -> ClarificationStep {
    if verdict.is_failure() || !verdict.is_action {
        state.reset();
        return ClarificationStep::Reject {
            message: verdict.question_to_user,
        };
    }

    if !verdict.needs_details {
        state.reset();
        return ClarificationStep::Dispatch {
            action: verdict.action_clean,
        };
    }

    if state.is_clarifying() {
        tracing::debug!(draft = %draft, "action still vague after clarification");
        state.reset();
        return ClarificationStep::Abandon {
            message: MSG_TOO_GENERAL.to_string(),
        };
    }

    state.accumulated_draft = draft;
    state.round = 1;
    ClarificationStep::Ask {
        question: verdict.question_to_user,
    }
}
