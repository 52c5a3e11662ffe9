//! Deadline-bounded execution of backend calls.
//!
//! Every backend request from the chat path runs through [`CallGuard`]: the
//! call executes on its own task (or on the blocking pool), the caller only
//! waits up to an outer deadline, and the result is classified into a
//! [`CallOutcome`]. Work that misses the deadline is detached, never killed;
//! it keeps its worker slot until it finishes on its own and its result is
//! discarded.

use anyhow::anyhow;
use shared::settings::RunSettings;
use shared::{CallOutcome, RunError};
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

/// Default outer deadline (65 seconds, a little above the run wait ceiling)
const DEFAULT_DEADLINE: Duration = Duration::from_secs(65);

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

/// How a call got its worker slot
enum Slot {
    Ready(OwnedSemaphorePermit),
    Queued,
}

/// Bounded worker pool plus outer deadline around backend calls.
pub struct CallGuard {
    workers: Arc<Semaphore>,
    /// Calls admitted but still waiting for a worker
    waiting: Arc<AtomicUsize>,
    queue_depth: usize,
    deadline: Duration,
}

impl CallGuard {
    pub fn new(pool_size: usize, queue_depth: usize, deadline: Duration) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(pool_size.max(1))),
            waiting: Arc::new(AtomicUsize::new(0)),
            queue_depth,
            deadline,
        }
    }

    pub fn from_settings(runs: &RunSettings) -> Self {
        Self::new(
            runs.worker_pool_size,
            runs.worker_queue_depth,
            runs.guard_deadline(),
        )
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Calls currently waiting for a free worker
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Run an async backend call under the default deadline.
    pub async fn run<T, F>(&self, label: &str, call: F) -> CallOutcome<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, RunError>> + Send + 'static,
    {
        self.run_with_deadline(label, self.deadline, call).await
    }

    /// Run a synchronous call on the blocking pool under the default deadline.
    pub async fn run_blocking<T, F>(&self, label: &str, call: F) -> CallOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, RunError> + Send + 'static,
    {
        self.run(label, async move {
            match tokio::task::spawn_blocking(call).await {
                Ok(result) => result,
                Err(e) => Err(RunError::Backend(anyhow!("blocking call did not finish: {}", e))),
            }
        })
        .await
    }

    pub async fn run_with_deadline<T, F>(
        &self,
        label: &str,
        deadline: Duration,
        call: F,
    ) -> CallOutcome<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, RunError>> + Send + 'static,
    {
        let start = Instant::now();
        let slot = match self.admit() {
            Some(slot) => slot,
            None => {
                tracing::error!(
                    call = label,
                    queue_depth = self.queue_depth,
                    "worker queue full, rejecting backend call"
                );
                return CallOutcome::Unavailable;
            }
        };

        let state = Arc::new(AtomicU8::new(QUEUED));
        let task_state = state.clone();
        let workers = self.workers.clone();
        let waiting = self.waiting.clone();

        let handle = tokio::spawn(async move {
            let _permit = match slot {
                Slot::Ready(permit) => permit,
                Slot::Queued => {
                    let permit = workers.acquire_owned().await;
                    waiting.fetch_sub(1, Ordering::SeqCst);
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => return Err(RunError::Backend(anyhow!("worker pool closed"))),
                    }
                }
            };
            // The caller may have given up while we were queued
            if task_state
                .compare_exchange(QUEUED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(RunError::Backend(anyhow!("abandoned before start")));
            }
            call.await
        });

        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(result)) => classify(label, start, result),
            Ok(Err(join_err)) => {
                tracing::error!(call = label, error = %join_err, "backend call task crashed");
                CallOutcome::Unavailable
            }
            Err(_) => {
                let started = state
                    .compare_exchange(QUEUED, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err();
                tracing::error!(
                    call = label,
                    deadline_ms = deadline.as_millis() as u64,
                    started,
                    "backend call missed its deadline, abandoning it"
                );
                CallOutcome::Unavailable
            }
        }
    }

    /// Take a worker slot now, or a place in the queue if one is left.
    fn admit(&self) -> Option<Slot> {
        match self.workers.clone().try_acquire_owned() {
            Ok(permit) => Some(Slot::Ready(permit)),
            Err(TryAcquireError::NoPermits) => {
                if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_depth {
                    self.waiting.fetch_sub(1, Ordering::SeqCst);
                    return None;
                }
                Some(Slot::Queued)
            }
            Err(TryAcquireError::Closed) => None,
        }
    }
}

impl Default for CallGuard {
    fn default() -> Self {
        Self::new(8, 32, DEFAULT_DEADLINE)
    }
}

fn classify<T>(label: &str, start: Instant, result: Result<T, RunError>) -> CallOutcome<T> {
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(value) => {
            tracing::debug!(call = label, elapsed_ms, "backend call succeeded");
            CallOutcome::Success(value)
        }
        Err(RunError::RunTimeout(details)) => {
            tracing::warn!(
                call = label,
                run_id = %details.run_id,
                thread_id = %details.thread_id,
                elapsed_ms = details.elapsed_ms() as u64,
                "run still in progress after wait ceiling"
            );
            CallOutcome::RunTimeout(details)
        }
        Err(e) => {
            tracing::error!(call = label, elapsed_ms, error = ?e, "backend call failed");
            CallOutcome::Unavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{RunStatus, RunTimeoutDetails};
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_success_passes_value_through() {
        let guard = CallGuard::default();
        let outcome = guard.run("test", async { Ok::<_, RunError>(42) }).await;
        assert_eq!(outcome, CallOutcome::Success(42));
    }

    #[tokio::test]
    async fn test_inner_run_timeout_is_not_unavailable() {
        let guard = CallGuard::default();
        let outcome = guard
            .run("test", async {
                Err::<String, _>(RunError::RunTimeout(RunTimeoutDetails {
                    run_id: "run_9".into(),
                    thread_id: "thread_9".into(),
                    elapsed: Duration::from_secs(61),
                }))
            })
            .await;

        match outcome {
            CallOutcome::RunTimeout(details) => {
                assert_eq!(details.run_id, "run_9");
                assert_eq!(details.thread_id, "thread_9");
                assert_eq!(details.elapsed_ms(), 61_000);
            }
            other => panic!("expected run timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_other_errors_are_unavailable() {
        let guard = CallGuard::default();

        let failed = guard
            .run("test", async {
                Err::<String, _>(RunError::Failed {
                    run_id: "run_1".into(),
                    detail: "rate_limit_exceeded".into(),
                })
            })
            .await;
        let aborted = guard
            .run("test", async {
                Err::<String, _>(RunError::Aborted {
                    run_id: "run_1".into(),
                    status: RunStatus::Cancelled,
                })
            })
            .await;
        let backend = guard
            .run("test", async {
                Err::<String, _>(RunError::Backend(anyhow!("connection reset")))
            })
            .await;

        assert_eq!(failed, CallOutcome::Unavailable);
        assert_eq!(aborted, CallOutcome::Unavailable);
        assert_eq!(backend, CallOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_panicking_call_is_unavailable() {
        let guard = CallGuard::default();
        let explode = true;
        let outcome = guard
            .run("test", async move {
                if explode {
                    panic!("boom");
                }
                Ok::<u32, RunError>(1)
            })
            .await;
        assert_eq!(outcome, CallOutcome::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outer_deadline_returns_promptly_and_abandons_work() {
        let guard = CallGuard::new(2, 2, Duration::from_secs(1));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let started = Instant::now();
        let outcome = guard
            .run("hung", async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, RunError>("late")
            })
            .await;

        assert_eq!(outcome, CallOutcome::Unavailable);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!finished.load(Ordering::SeqCst));

        // Detached work still runs to completion
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_rejects_new_calls() {
        let guard = Arc::new(CallGuard::new(1, 1, Duration::from_secs(30)));

        let running = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .run("first", async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, RunError>(1)
                    })
                    .await
            })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        let waiting = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.run("second", async { Ok::<_, RunError>(2) }).await })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(guard.queued(), 1);

        let rejected = guard.run("third", async { Ok::<_, RunError>(3) }).await;
        assert_eq!(rejected, CallOutcome::Unavailable);

        assert_eq!(running.await.unwrap(), CallOutcome::Success(1));
        assert_eq!(waiting.await.unwrap(), CallOutcome::Success(2));
        assert_eq!(guard.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_abandoned_in_queue_never_starts() {
        let guard = Arc::new(CallGuard::new(1, 4, Duration::from_secs(2)));
        let started = Arc::new(AtomicBool::new(false));

        let blocker = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .run_with_deadline("blocker", Duration::from_secs(30), async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok::<_, RunError>(())
                    })
                    .await
            })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        let flag = started.clone();
        let outcome = guard
            .run("queued", async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, RunError>(())
            })
            .await;
        assert_eq!(outcome, CallOutcome::Unavailable);

        assert_eq!(blocker.await.unwrap(), CallOutcome::Success(()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!started.load(Ordering::SeqCst));
        assert_eq!(guard.queued(), 0);
    }

    #[tokio::test]
    async fn test_blocking_call_is_classified_like_async() {
        let guard = CallGuard::new(2, 2, Duration::from_secs(5));

        let ok = guard.run_blocking("blocking", || Ok(7)).await;
        let slow = guard
            .run_blocking("blocking", || {
                Err::<u32, _>(RunError::RunTimeout(RunTimeoutDetails {
                    run_id: "run_2".into(),
                    thread_id: "thread_2".into(),
                    elapsed: Duration::from_secs(60),
                }))
            })
            .await;
        let broken = guard
            .run_blocking("blocking", || {
                Err::<u32, _>(RunError::Protocol("no assistant message".into()))
            })
            .await;

        assert_eq!(ok, CallOutcome::Success(7));
        assert!(matches!(slow, CallOutcome::RunTimeout(_)));
        assert_eq!(broken, CallOutcome::Unavailable);
    }

    #[test]
    fn test_deadline_from_settings_exceeds_run_wait() {
        let runs = RunSettings::default();
        let guard = CallGuard::from_settings(&runs);
        assert!(guard.deadline() > runs.run_wait());
    }
}
