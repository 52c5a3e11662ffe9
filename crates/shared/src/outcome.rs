//! Failure taxonomy for backend calls.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::conversation::RunStatus;

/// Diagnostics carried by a client-side run wait timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTimeoutDetails {
    pub run_id: String,
    pub thread_id: String,
    pub elapsed: Duration,
}

impl RunTimeoutDetails {
    pub fn elapsed_ms(&self) -> u128 {
        self.elapsed.as_millis()
    }
}

/// Errors raised while driving a run to completion.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The run is still active on the backend, we only stopped waiting
    #[error("run {} on thread {} still active after {}ms", .0.run_id, .0.thread_id, .0.elapsed_ms())]
    RunTimeout(RunTimeoutDetails),

    #[error("assistant run {run_id} failed: {detail}")]
    Failed { run_id: String, detail: String },

    #[error("assistant run {run_id} aborted: {status}")]
    Aborted { run_id: String, status: RunStatus },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("thread binding not persisted: {0}")]
    Persistence(String),

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl RunError {
    pub fn is_run_timeout(&self) -> bool {
        matches!(self, RunError::RunTimeout(_))
    }
}

/// Three-way result of a guarded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    Success(T),
    /// Work is still progressing on the backend, the user should retry shortly
    RunTimeout(RunTimeoutDetails),
    /// Network failure, backend failure, outer deadline or anything unclassified
    Unavailable,
}

impl<T> CallOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            CallOutcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CallOutcome<U> {
        match self {
            CallOutcome::Success(value) => CallOutcome::Success(f(value)),
            CallOutcome::RunTimeout(details) => CallOutcome::RunTimeout(details),
            CallOutcome::Unavailable => CallOutcome::Unavailable,
        }
    }
}
