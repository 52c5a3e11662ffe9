//! Run orchestration against the thread-based backend.
//!
//! At most one run is active per thread. A request first looks at the newest
//! run on its thread:
//! - active (queued / in_progress / requires_action): attach and wait on it
//! - completed with an undelivered reply: return that reply, no new run
//! - anything else, or no run yet: append the message and start a new run
//!
//! A completed reply counts as delivered once the store records its run id
//! for the conversation, or once a user message follows it on the thread.
//!
//! Waiting polls the run at a fixed interval against a monotonic clock and
//! ends in a reply, a typed failure, or [`RunError::RunTimeout`] when the
//! ceiling passes while the run is still active.

use parking_lot::Mutex;
use providers::AssistantBackend;
use shared::settings::{AssistantIds, RunSettings};
use shared::{ConversationKey, MessageRole, RunError, RunHandle, RunStatus, RunTimeoutDetails};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::thread_registry::ThreadRegistry;

/// Default poll interval (1.2 seconds)
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1200);

/// Default run wait ceiling (60 seconds)
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

pub struct RunExecutor {
    backend: Arc<dyn AssistantBackend>,
    registry: Arc<ThreadRegistry>,
    assistants: AssistantIds,
    poll_interval: Duration,
    max_wait: Duration,
    /// Serializes the check-then-submit step per thread id
    submit_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Result of the check-then-submit step
enum Submitted {
    Run(RunHandle),
    /// Reply of a completed run that no caller has received yet
    Pending(String),
}

impl RunExecutor {
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        registry: Arc<ThreadRegistry>,
        assistants: AssistantIds,
    ) -> Self {
        Self {
            backend,
            registry,
            assistants,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
            submit_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_settings(self, runs: &RunSettings) -> Self {
        self.with_poll_interval(runs.poll_interval())
            .with_max_wait(runs.run_wait())
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Send `message` on the conversation's thread and wait for the assistant's reply.
    ///
    /// Calling this again while a run is active attaches to that run instead of
    /// starting a second one; the new message is not submitted in that case.
    pub async fn send_and_await(
        &self,
        key: &ConversationKey,
        message: &str,
        max_wait: Option<Duration>,
    ) -> Result<String, RunError> {
        let max_wait = max_wait.unwrap_or(self.max_wait);
        let start = Instant::now();
        let thread_id = self.registry.get_or_create_thread(key).await?;

        let gate = self.submit_lock(&thread_id);
        let submitted = {
            let _submitting = gate.lock().await;
            self.submit(key, &thread_id, message, start).await
        };
        self.release_submit_lock(&thread_id, &gate);

        let run = match submitted? {
            Submitted::Run(run) => run,
            Submitted::Pending(reply) => return Ok(reply),
        };

        let finished = self.wait_for_terminal(&run, start, max_wait).await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match finished.status {
            RunStatus::Completed => {
                tracing::info!(
                    thread_id = %thread_id,
                    run_id = %finished.run_id,
                    elapsed_ms,
                    "run completed"
                );
                self.collect_reply(key, &thread_id, &finished.run_id).await
            }
            RunStatus::Failed => Err(RunError::Failed {
                run_id: finished.run_id,
                detail: finished
                    .last_error
                    .unwrap_or_else(|| "unknown error".to_string()),
            }),
            status => Err(RunError::Aborted {
                run_id: finished.run_id,
                status,
            }),
        }
    }

    /// Attach to the thread's active run, hand out an undelivered reply, or
    /// append `message` and start a new run. Runs under the thread's submit lock.
    async fn submit(
        &self,
        key: &ConversationKey,
        thread_id: &str,
        message: &str,
        start: Instant,
    ) -> Result<Submitted, RunError> {
        match self.backend.latest_run(thread_id).await? {
            Some(run) if run.status.is_active() => {
                tracing::info!(
                    thread_id = %thread_id,
                    run_id = %run.run_id,
                    status = %run.status,
                    "waiting on existing run"
                );
                return Ok(Submitted::Run(run));
            }
            Some(run) if run.status == RunStatus::Completed => {
                if let Some(reply) = self.pending_reply(key, thread_id, &run.run_id).await? {
                    tracing::info!(
                        thread_id = %thread_id,
                        run_id = %run.run_id,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "using last completed run"
                    );
                    return Ok(Submitted::Pending(reply));
                }
            }
            _ => {}
        }

        self.backend.create_message(thread_id, message).await?;
        let run = self
            .backend
            .create_run(thread_id, self.assistants.for_mode(key.mode))
            .await?;
        tracing::debug!(thread_id = %thread_id, run_id = %run.run_id, "run created");
        Ok(Submitted::Run(run))
    }

    /// Reply of completed run `run_id` unless it was already handed out.
    async fn pending_reply(
        &self,
        key: &ConversationKey,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Option<String>, RunError> {
        if self.registry.delivered_run(key).await?.as_deref() == Some(run_id) {
            return Ok(None);
        }
        match self.backend.latest_message(thread_id).await? {
            Some(message)
                if message.role == MessageRole::Assistant && !message.text.trim().is_empty() =>
            {
                self.record_delivery(key, run_id).await;
                Ok(Some(message.text))
            }
            // A user message after the run means its reply was consumed
            _ => {
                tracing::info!(
                    thread_id = %thread_id,
                    run_id = %run_id,
                    "completed run has no pending reply, submitting"
                );
                Ok(None)
            }
        }
    }

    /// Poll until the run leaves the active states or `max_wait` (measured from
    /// `start`) has passed.
    async fn wait_for_terminal(
        &self,
        run: &RunHandle,
        start: Instant,
        max_wait: Duration,
    ) -> Result<RunHandle, RunError> {
        loop {
            let current = self
                .backend
                .retrieve_run(&run.thread_id, &run.run_id)
                .await?;
            if current.status.is_terminal() {
                return Ok(current);
            }

            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                tracing::debug!(
                    thread_id = %run.thread_id,
                    run_id = %run.run_id,
                    status = %current.status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "run wait ceiling reached"
                );
                return Err(RunError::RunTimeout(RunTimeoutDetails {
                    run_id: run.run_id.clone(),
                    thread_id: run.thread_id.clone(),
                    elapsed,
                }));
            }
            tokio::time::sleep(self.poll_interval.min(max_wait - elapsed)).await;
        }
    }

    /// Latest message of the thread, which must be the assistant's reply.
    async fn collect_reply(
        &self,
        key: &ConversationKey,
        thread_id: &str,
        run_id: &str,
    ) -> Result<String, RunError> {
        let message = self
            .backend
            .latest_message(thread_id)
            .await?
            .ok_or_else(|| {
                RunError::Protocol(format!("run {} completed without any message", run_id))
            })?;

        if message.role != MessageRole::Assistant {
            return Err(RunError::Protocol(format!(
                "run {} completed but the latest message is not from the assistant",
                run_id
            )));
        }
        if message.text.trim().is_empty() {
            return Err(RunError::Protocol(format!(
                "run {} completed with an assistant message without text",
                run_id
            )));
        }

        self.record_delivery(key, run_id).await;
        Ok(message.text)
    }

    /// The reply is returned even when the record cannot be written; the
    /// user message of the next request still marks it consumed.
    async fn record_delivery(&self, key: &ConversationKey, run_id: &str) {
        if let Err(e) = self.registry.mark_delivered(key, run_id).await {
            tracing::warn!(conversation = %key, run_id = %run_id, error = %e, "could not record delivered run");
        }
    }

    fn submit_lock(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.submit_locks
            .lock()
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_submit_lock(&self, thread_id: &str, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.submit_locks.lock();
        // Only the map and `gate` hold it: nobody is waiting to submit
        if Arc::strong_count(gate) == 2 {
            locks.remove(thread_id);
        }
    }

    #[cfg(test)]
    fn submit_locks_held(&self) -> usize {
        self.submit_locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubBackend;
    use services::MemoryThreadStore;
    use shared::{ConversationContext, Mode};

    fn key() -> ConversationKey {
        ConversationKey::new(11, Mode::Free, ConversationContext::Forecast)
    }

    fn executor(backend: Arc<StubBackend>) -> RunExecutor {
        executor_over(backend, Arc::new(MemoryThreadStore::new()))
    }

    /// Executor over an existing store, as after a process restart
    fn executor_over(backend: Arc<StubBackend>, store: Arc<MemoryThreadStore>) -> RunExecutor {
        let registry = Arc::new(ThreadRegistry::new(backend.clone(), store));
        RunExecutor::new(
            backend,
            registry,
            AssistantIds {
                free: "asst_free".into(),
                pro: "asst_pro".into(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_completed() {
        let backend = Arc::new(
            StubBackend::new("Благоприятный день").with_script(&[
                RunStatus::Queued,
                RunStatus::Queued,
                RunStatus::Completed,
            ]),
        );
        let executor = executor(backend.clone());

        let reply = executor
            .send_and_await(&key(), "Прогноз на сегодня", None)
            .await
            .unwrap();

        assert_eq!(reply, "Благоприятный день");
        assert_eq!(backend.retrievals(), 3);
        assert_eq!(backend.runs_created(), 1);
        assert_eq!(backend.user_messages("thread_1"), vec!["Прогноз на сегодня"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_carries_ids_and_elapsed() {
        let backend = Arc::new(StubBackend::new("late").with_script(&[RunStatus::InProgress]));
        let executor = executor(backend.clone()).with_max_wait(Duration::from_secs(10));

        let err = executor
            .send_and_await(&key(), "Прогноз", None)
            .await
            .unwrap_err();

        match err {
            RunError::RunTimeout(details) => {
                assert_eq!(details.run_id, "run_1");
                assert_eq!(details.thread_id, "thread_1");
                assert!(details.elapsed >= Duration::from_secs(10));
            }
            other => panic!("expected run timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_max_wait_overrides_default() {
        let backend = Arc::new(StubBackend::new("late").with_script(&[RunStatus::Queued]));
        let executor = executor(backend.clone());

        let started = Instant::now();
        let err = executor
            .send_and_await(&key(), "Прогноз", Some(Duration::from_secs(3)))
            .await
            .unwrap_err();

        assert!(err.is_run_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sends_share_one_run() {
        let backend = Arc::new(StubBackend::new("Один ответ").with_script(&[
            RunStatus::Queued,
            RunStatus::InProgress,
            RunStatus::InProgress,
            RunStatus::InProgress,
            RunStatus::Completed,
        ]));
        let executor = Arc::new(executor(backend.clone()));

        let calls = (0..4).map(|i| {
            let executor = executor.clone();
            async move {
                executor
                    .send_and_await(&key(), &format!("сообщение {}", i), None)
                    .await
            }
        });
        let replies = futures::future::join_all(calls).await;

        assert_eq!(backend.runs_created(), 1);
        assert_eq!(backend.messages_created(), 1);
        for reply in replies {
            assert_eq!(reply.unwrap(), "Один ответ");
        }
        assert_eq!(executor.submit_locks_held(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attaches_to_run_left_active_by_earlier_request() {
        let backend = Arc::new(StubBackend::new("готово").with_script(&[RunStatus::InProgress]));
        let executor = executor(backend.clone()).with_max_wait(Duration::from_secs(5));

        let first = executor.send_and_await(&key(), "первый", None).await;
        assert!(matches!(first, Err(RunError::RunTimeout(_))));

        // Second attempt while the backend is still working
        let second = executor.send_and_await(&key(), "второй", None).await;
        assert!(matches!(second, Err(RunError::RunTimeout(_))));

        assert_eq!(backend.runs_created(), 1);
        assert_eq!(backend.user_messages("thread_1"), vec!["первый"]);
    }

    #[tokio::test]
    async fn test_completed_run_reply_is_returned_without_new_run() {
        let backend = Arc::new(StubBackend::new("ответ из прошлого"));
        let executor = executor(backend.clone());

        // Bind the thread first, then leave a finished run on it
        let registry_thread = executor.registry.get_or_create_thread(&key()).await.unwrap();
        backend.seed_run(&registry_thread, "run_prev", RunStatus::Completed);

        let reply = executor.send_and_await(&key(), "повтор", None).await.unwrap();

        assert_eq!(reply, "ответ из прошлого");
        assert_eq!(backend.runs_created(), 0);
        assert_eq!(backend.messages_created(), 0);
    }

    #[tokio::test]
    async fn test_delivered_run_does_not_shadow_next_message() {
        let backend = Arc::new(StubBackend::new("ответ"));
        let executor = executor(backend.clone());

        executor.send_and_await(&key(), "первый", None).await.unwrap();
        executor.send_and_await(&key(), "второй", None).await.unwrap();

        assert_eq!(backend.runs_created(), 2);
        assert_eq!(backend.user_messages("thread_1"), vec!["первый", "второй"]);
    }

    #[tokio::test]
    async fn test_delivered_reply_is_not_repeated_after_restart() {
        let backend = Arc::new(StubBackend::new("вчерашний ответ"));
        let store = Arc::new(MemoryThreadStore::new());

        let before = executor_over(backend.clone(), store.clone());
        before.send_and_await(&key(), "вчера", None).await.unwrap();
        drop(before);

        let after = executor_over(backend.clone(), store);
        after.send_and_await(&key(), "новый вопрос", None).await.unwrap();

        assert_eq!(backend.runs_created(), 2);
        assert_eq!(
            backend.user_messages("thread_1"),
            vec!["вчера", "новый вопрос"]
        );
    }

    #[tokio::test]
    async fn test_user_message_after_completed_run_starts_new_run() {
        let backend = Arc::new(StubBackend::new("ответ"));
        let executor = executor(backend.clone());

        // A message was appended but its run never got created
        let thread_id = executor.registry.get_or_create_thread(&key()).await.unwrap();
        backend.seed_run(&thread_id, "run_prev", RunStatus::Completed);
        backend.create_message(&thread_id, "осиротевший").await.unwrap();

        for question in ["первый", "второй", "третий"] {
            let reply = executor.send_and_await(&key(), question, None).await.unwrap();
            assert_eq!(reply, "ответ");
        }

        assert_eq!(backend.runs_created(), 3);
        assert_eq!(
            backend.user_messages(&thread_id),
            vec!["осиротевший", "первый", "второй", "третий"]
        );
    }

    #[tokio::test]
    async fn test_failed_run_surfaces_backend_detail() {
        let backend = Arc::new(
            StubBackend::new("never")
                .with_script(&[RunStatus::Failed])
                .with_last_error("server_error: boom"),
        );
        let executor = executor(backend);

        let err = executor.send_and_await(&key(), "x", None).await.unwrap_err();
        match err {
            RunError::Failed { run_id, detail } => {
                assert_eq!(run_id, "run_1");
                assert_eq!(detail, "server_error: boom");
            }
            other => panic!("expected failed run, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_run_is_aborted_not_failed() {
        let backend = Arc::new(StubBackend::new("never").with_script(&[RunStatus::Expired]));
        let executor = executor(backend);

        let err = executor.send_and_await(&key(), "x", None).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Aborted {
                status: RunStatus::Expired,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_non_assistant_latest_message_is_protocol_violation() {
        let backend = Arc::new(StubBackend::new("эхо").with_reply_role(MessageRole::User));
        let executor = executor(backend);

        let err = executor.send_and_await(&key(), "x", None).await.unwrap_err();
        assert!(matches!(err, RunError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_backend_outage_is_backend_error() {
        let backend = Arc::new(StubBackend::new("x").failing());
        let executor = executor(backend);

        let err = executor.send_and_await(&key(), "x", None).await.unwrap_err();
        assert!(matches!(err, RunError::Backend(_)));
    }

    #[tokio::test]
    async fn test_pro_mode_uses_its_own_thread() {
        let backend = Arc::new(StubBackend::new("ok"));
        let executor = executor(backend.clone());
        let pro = ConversationKey::new(11, Mode::Pro, ConversationContext::Forecast);

        executor.send_and_await(&key(), "free", None).await.unwrap();
        executor.send_and_await(&pro, "pro", None).await.unwrap();

        assert_eq!(backend.threads_created(), 2);
        assert_eq!(backend.user_messages("thread_2"), vec!["pro"]);
        assert_eq!(backend.assistants_used(), vec!["asst_free", "asst_pro"]);
    }
}
