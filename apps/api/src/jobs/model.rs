//! Job data model.
//!
//! A job is one sales-message generation request, tracked from submission until it
//! reaches `completed` or `failed`. Terminal states are final.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::generation::Tone;

/// Opaque job identifier. Assigned at enqueue, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// What the client asked for. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub summary: String,
    pub tone: Tone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid state transition for job {id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub id: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// Snapshot of a job as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: MessagePayload,
    pub state: JobState,
    /// Generated text. Only set together with `state = completed`.
    pub result: Option<String>,
    /// Human-readable cause. Only set together with `state = failed`.
    pub error_reason: Option<String>,
    /// Error of the most recent failed attempt while the job is still being retried.
    pub last_error: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(payload: MessagePayload, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            state: JobState::Pending,
            result: None,
            error_reason: None,
            last_error: None,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Starts a new execution attempt. Only pending jobs with attempts left may start.
    pub fn begin_attempt(&mut self) -> Result<u32, InvalidTransition> {
        if self.state.is_terminal() || self.attempts_exhausted() {
            return Err(self.invalid(JobState::Pending));
        }
        self.attempts += 1;
        self.updated_at = Utc::now();
        Ok(self.attempts)
    }

    /// `pending -> completed`, setting the result in the same step.
    pub fn complete(&mut self, result: String) -> Result<(), InvalidTransition> {
        self.terminate(JobState::Completed)?;
        self.result = Some(result);
        self.last_error = None;
        Ok(())
    }

    /// `pending -> failed`, setting the reason in the same step.
    pub fn fail(&mut self, reason: String) -> Result<(), InvalidTransition> {
        self.terminate(JobState::Failed)?;
        self.error_reason = Some(reason);
        Ok(())
    }

    /// Records a failed attempt that will be retried. State stays `pending`.
    pub fn record_retryable_failure(&mut self, error: String) -> Result<(), InvalidTransition> {
        if self.state.is_terminal() {
            return Err(self.invalid(JobState::Pending));
        }
        self.last_error = Some(error);
        self.updated_at = Utc::now();
        Ok(())
    }

    fn terminate(&mut self, to: JobState) -> Result<(), InvalidTransition> {
        if self.state != JobState::Pending {
            return Err(self.invalid(to));
        }
        let now = Utc::now();
        self.state = to;
        self.updated_at = now;
        self.finished_at = Some(now);
        Ok(())
    }

    fn invalid(&self, to: JobState) -> InvalidTransition {
        InvalidTransition {
            id: self.id,
            from: self.state,
            to,
        }
    }
}
