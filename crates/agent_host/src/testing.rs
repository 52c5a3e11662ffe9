//! Scripted backends shared by the unit tests.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use providers::{AssistantBackend, ClassifierBackend, CompletionParams};
use shared::agent_api::ChatMessage;
use shared::{MessageRole, RunHandle, RunStatus, ThreadMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct ThreadState {
    runs: Vec<RunHandle>,
    messages: Vec<ThreadMessage>,
}

/// In-memory thread/run backend.
///
/// Every `retrieve_run` pops the next status from the script; the last
/// status repeats forever. When a run turns `completed` the canned reply is
/// appended as an assistant message, so reading it earlier is detectable.
pub struct StubBackend {
    reply: String,
    script: Mutex<VecDeque<RunStatus>>,
    threads: Mutex<HashMap<String, ThreadState>>,
    last_error: Mutex<Option<String>>,
    reply_role: Mutex<MessageRole>,
    assistants_used: Mutex<Vec<String>>,
    threads_created: AtomicUsize,
    runs_created: AtomicUsize,
    messages_created: AtomicUsize,
    retrievals: AtomicUsize,
    fail_all: Mutex<bool>,
}

impl StubBackend {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            script: Mutex::new(VecDeque::from([RunStatus::Completed])),
            threads: Mutex::new(HashMap::new()),
            last_error: Mutex::new(None),
            reply_role: Mutex::new(MessageRole::Assistant),
            assistants_used: Mutex::new(Vec::new()),
            threads_created: AtomicUsize::new(0),
            runs_created: AtomicUsize::new(0),
            messages_created: AtomicUsize::new(0),
            retrievals: AtomicUsize::new(0),
            fail_all: Mutex::new(false),
        }
    }

    pub fn with_script(self, statuses: &[RunStatus]) -> Self {
        *self.script.lock() = statuses.iter().copied().collect();
        self
    }

    pub fn with_last_error(self, detail: &str) -> Self {
        *self.last_error.lock() = Some(detail.to_string());
        self
    }

    /// Completed runs leave a message authored by `role` instead of the assistant
    pub fn with_reply_role(self, role: MessageRole) -> Self {
        *self.reply_role.lock() = role;
        self
    }

    pub fn failing(self) -> Self {
        *self.fail_all.lock() = true;
        self
    }

    /// Seed a thread whose latest run is in `status`
    pub fn seed_run(&self, thread_id: &str, run_id: &str, status: RunStatus) {
        let mut threads = self.threads.lock();
        let thread = threads.entry(thread_id.to_string()).or_default();
        thread.runs.push(RunHandle {
            thread_id: thread_id.to_string(),
            run_id: run_id.to_string(),
            status,
            last_error: None,
        });
        if status == RunStatus::Completed {
            thread.messages.push(ThreadMessage {
                role: MessageRole::Assistant,
                text: self.reply.clone(),
            });
        }
    }

    pub fn threads_created(&self) -> usize {
        self.threads_created.load(Ordering::SeqCst)
    }

    pub fn runs_created(&self) -> usize {
        self.runs_created.load(Ordering::SeqCst)
    }

    pub fn messages_created(&self) -> usize {
        self.messages_created.load(Ordering::SeqCst)
    }

    /// Assistant id of every created run, in order
    pub fn assistants_used(&self) -> Vec<String> {
        self.assistants_used.lock().clone()
    }

    pub fn retrievals(&self) -> usize {
        self.retrievals.load(Ordering::SeqCst)
    }

    pub fn user_messages(&self, thread_id: &str) -> Vec<String> {
        self.threads
            .lock()
            .get(thread_id)
            .map(|t| {
                t.messages
                    .iter()
                    .filter(|m| m.role == MessageRole::User)
                    .map(|m| m.text.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_up(&self) -> Result<()> {
        if *self.fail_all.lock() {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }

    fn next_status(&self) -> RunStatus {
        let mut script = self.script.lock();
        if script.len() > 1 {
            script.pop_front().unwrap_or(RunStatus::Completed)
        } else {
            script.front().copied().unwrap_or(RunStatus::Completed)
        }
    }
}

#[async_trait::async_trait]
impl AssistantBackend for StubBackend {
    async fn create_thread(&self) -> Result<String> {
        self.check_up()?;
        tokio::task::yield_now().await;
        let n = self.threads_created.fetch_add(1, Ordering::SeqCst) + 1;
        let thread_id = format!("thread_{}", n);
        self.threads
            .lock()
            .insert(thread_id.clone(), ThreadState::default());
        Ok(thread_id)
    }

    async fn latest_run(&self, thread_id: &str) -> Result<Option<RunHandle>> {
        self.check_up()?;
        Ok(self
            .threads
            .lock()
            .get(thread_id)
            .and_then(|t| t.runs.last().cloned()))
    }

    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<RunHandle> {
        self.check_up()?;
        self.assistants_used.lock().push(assistant_id.to_string());
        tokio::task::yield_now().await;
        let n = self.runs_created.fetch_add(1, Ordering::SeqCst) + 1;
        let run = RunHandle {
            thread_id: thread_id.to_string(),
            run_id: format!("run_{}", n),
            status: RunStatus::Queued,
            last_error: None,
        };
        self.threads
            .lock()
            .entry(thread_id.to_string())
            .or_default()
            .runs
            .push(run.clone());
        Ok(run)
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunHandle> {
        self.check_up()?;
        self.retrievals.fetch_add(1, Ordering::SeqCst);
        let status = self.next_status();
        let mut threads = self.threads.lock();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| anyhow!("no such thread {}", thread_id))?;
        let run = thread
            .runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| anyhow!("no such run {}", run_id))?;

        let newly_completed = status == RunStatus::Completed && run.status != RunStatus::Completed;
        run.status = status;
        if status == RunStatus::Failed {
            run.last_error = self.last_error.lock().clone();
        }
        let snapshot = run.clone();
        if newly_completed {
            thread.messages.push(ThreadMessage {
                role: *self.reply_role.lock(),
                text: self.reply.clone(),
            });
        }
        Ok(snapshot)
    }

    async fn latest_message(&self, thread_id: &str) -> Result<Option<ThreadMessage>> {
        self.check_up()?;
        Ok(self
            .threads
            .lock()
            .get(thread_id)
            .and_then(|t| t.messages.last().cloned()))
    }

    async fn create_message(&self, thread_id: &str, text: &str) -> Result<()> {
        self.check_up()?;
        self.messages_created.fetch_add(1, Ordering::SeqCst);
        self.threads
            .lock()
            .entry(thread_id.to_string())
            .or_default()
            .messages
            .push(ThreadMessage {
                role: MessageRole::User,
                text: text.to_string(),
            });
        Ok(())
    }
}

/// Classifier returning a fixed raw reply (or an error) and counting calls.
pub struct StubClassifier {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl StubClassifier {
    pub fn replying(raw: &str) -> Self {
        Self::scripted(vec![Ok(raw.to_string())])
    }

    pub fn erroring(message: &str) -> Self {
        Self::scripted(vec![Err(message.to_string())])
    }

    /// Replies in order; the last one repeats
    pub fn scripted(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// User prompts received, in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait::async_trait]
impl ClassifierBackend for StubClassifier {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _params: &CompletionParams,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(user) = messages.iter().rev().find(|m| m.role == "user") {
            self.prompts.lock().push(user.content.clone());
        }
        let mut replies = self.replies.lock();
        let reply = if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        };
        match reply {
            Some(Ok(raw)) => Ok(raw),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted reply")),
        }
    }
}
