//! Agent Host - run orchestration between the chat layer and the assistant backend
//!
//! This crate provides:
//! - Per-conversation thread resolution (`thread_registry`)
//! - Run submission and polling with at most one active run per thread (`run_executor`)
//! - Deadline and worker-pool bounded execution of backend calls (`call_guard`)
//! - The two-stage action gate and its one-question clarification loop
//! - `AgentHost`, the facade the chat layer talks to

pub mod action_validation;
pub mod call_guard;
pub mod clarification;
pub mod prompts;
pub mod run_executor;
pub mod thread_registry;

#[cfg(test)]
pub(crate) mod testing;

pub use action_validation::{heuristic_check, ActionValidator, Rejection};
pub use call_guard::CallGuard;
pub use clarification::ClarificationStep;
pub use run_executor::RunExecutor;
pub use thread_registry::ThreadRegistry;

use anyhow::Result;
use providers::{AssistantBackend, ClassifierBackend};
use services::{Database, RequestRecord, ThreadStore};
use shared::settings::{BotSettings, ModeSwitchVisibility};
use shared::{CallOutcome, ClarificationState, ConversationContext, ConversationKey, Mode};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;

/// Run synchronous storage work on the blocking pool, away from the async workers.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| anyhow::anyhow!("join error: {}", e))?
}

/// Canned text for an outcome; the reply itself on success.
pub fn user_message(outcome: &CallOutcome<String>) -> &str {
    match outcome {
        CallOutcome::Success(text) => text,
        CallOutcome::RunTimeout(_) => prompts::MSG_RUN_TIMEOUT,
        CallOutcome::Unavailable => prompts::MSG_SERVICE_UNAVAILABLE,
    }
}

/// Reply to one message of the "check action" flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckActionReply {
    /// Clarifying question, the flow continues
    Question(String),
    /// Input turned away, the flow is over
    Rejected(String),
    /// The action reached the backend
    Answer(CallOutcome<String>),
}

impl CheckActionReply {
    pub fn text(&self) -> &str {
        match self {
            CheckActionReply::Question(text) | CheckActionReply::Rejected(text) => text,
            CheckActionReply::Answer(outcome) => user_message(outcome),
        }
    }

    /// Whether the caller should keep its clarification state for the next message
    pub fn awaits_reply(&self) -> bool {
        matches!(self, CheckActionReply::Question(_))
    }
}

/// Agent host wires persistence, the backend clients and the guard together
pub struct AgentHost {
    db: Arc<Database>,
    executor: Arc<RunExecutor>,
    guard: CallGuard,
    validator: ActionValidator,
    mode_switch: ModeSwitchVisibility,
    mode_switch_users: BTreeSet<i64>,
}

impl AgentHost {
    pub fn new(
        settings: &BotSettings,
        db: Arc<Database>,
        backend: Arc<dyn AssistantBackend>,
        classifier: Arc<dyn ClassifierBackend>,
    ) -> Self {
        let store: Arc<dyn ThreadStore> = db.clone();
        let registry = Arc::new(ThreadRegistry::new(backend.clone(), store));
        let executor = RunExecutor::new(backend, registry, settings.assistants.clone())
            .with_settings(&settings.runs);

        Self {
            db,
            executor: Arc::new(executor),
            guard: CallGuard::from_settings(&settings.runs),
            validator: ActionValidator::from_settings(classifier, &settings.classifier),
            mode_switch: settings.mode_switch_visibility,
            mode_switch_users: settings.mode_switch_users.clone(),
        }
    }

    /// Current mode; FREE when it cannot be read.
    pub async fn user_mode(&self, user_id: i64) -> Mode {
        let db = self.db.clone();
        blocking(move || db.user_mode(user_id))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id, error = %e, "could not read user mode, assuming free");
                Mode::Free
            })
    }

    pub async fn set_mode(&self, user_id: i64, mode: Mode) -> Result<()> {
        let db = self.db.clone();
        blocking(move || db.set_user_mode(user_id, mode)).await
    }

    pub fn can_switch_mode(&self, user_id: i64) -> bool {
        self.mode_switch.allows(user_id, &self.mode_switch_users)
    }

    /// Flip between FREE and PRO. Returns the new mode, or `None` when the
    /// user may not switch.
    pub async fn switch_mode(&self, user_id: i64) -> Result<Option<Mode>> {
        if !self.can_switch_mode(user_id) {
            tracing::info!(user_id, visibility = ?self.mode_switch, "mode switch refused");
            return Ok(None);
        }
        let next = match self.user_mode(user_id).await {
            Mode::Free => Mode::Pro,
            Mode::Pro => Mode::Free,
        };
        self.set_mode(user_id, next).await?;
        Ok(Some(next))
    }

    /// Send a message on the user's conversation for `context` and wait for the reply.
    pub async fn ask(
        &self,
        user_id: i64,
        context: ConversationContext,
        request_type: &str,
        message: &str,
    ) -> CallOutcome<String> {
        let mode = self.user_mode(user_id).await;
        let key = ConversationKey::new(user_id, mode, context);
        let stamped = prompts::date_stamped(chrono::Local::now().date_naive(), message);
        let executor = self.executor.clone();

        let start = Instant::now();
        let outcome = self
            .guard
            .run(request_type, async move {
                executor.send_and_await(&key, &stamped, None).await
            })
            .await;

        self.record(RequestRecord {
            user_id,
            request_type: request_type.to_string(),
            request_text: Some(message.to_string()),
            success: outcome.is_success(),
            response_time_ms: Some(start.elapsed().as_millis() as u64),
            mode,
        })
        .await;
        outcome
    }

    pub async fn forecast(&self, user_id: i64, question: &str) -> CallOutcome<String> {
        self.ask(user_id, ConversationContext::Forecast, "forecast", question)
            .await
    }

    /// One step of the "check action" flow. `state` belongs to the user's session.
    pub async fn check_action(
        &self,
        state: &mut ClarificationState,
        user_id: i64,
        text: &str,
    ) -> CheckActionReply {
        match clarification::advance(state, &self.validator, text).await {
            ClarificationStep::Dispatch { action } => {
                tracing::info!(user_id, action = %action, "dispatching action check");
                let outcome = self
                    .ask(
                        user_id,
                        ConversationContext::ActionCheck,
                        "action_check",
                        &prompts::action_check_request(&action),
                    )
                    .await;
                CheckActionReply::Answer(outcome)
            }
            ClarificationStep::Ask { question } => CheckActionReply::Question(question),
            ClarificationStep::Reject { message } | ClarificationStep::Abandon { message } => {
                CheckActionReply::Rejected(message)
            }
        }
    }

    async fn record(&self, record: RequestRecord) {
        let db = self.db.clone();
        let user_id = record.user_id;
        if let Err(e) = blocking(move || db.log_request(&record)).await {
            tracing::warn!(user_id, error = %e, "failed to write request log");
        }
    }
}
