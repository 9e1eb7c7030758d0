//! Bounded polling until a job reaches a terminal state, the loop a status-endpoint
//! client runs. Drives the end-to-end job tests.
//!
//! Reads status straight from the store on every tick, so it works whether or not
//! lifecycle notifications were ever delivered.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::jobs::model::JobId;
use crate::jobs::store::StoreError;
use crate::jobs::{JobStatus, JobSystem};

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_duration: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_duration: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Terminal(JobStatus),
    NotFound,
    TimedOut,
}

pub async fn wait_for_terminal(
    system: &JobSystem,
    id: JobId,
    policy: PollPolicy,
) -> Result<PollOutcome, StoreError> {
    let deadline = Instant::now() + policy.max_duration;

    loop {
        match system.status(id).await? {
            None => return Ok(PollOutcome::NotFound),
            Some(JobStatus::Pending) => {}
            Some(terminal) => return Ok(PollOutcome::Terminal(terminal)),
        }

        if Instant::now() >= deadline {
            return Ok(PollOutcome::TimedOut);
        }
        sleep(policy.interval.min(deadline.saturating_duration_since(Instant::now())))
            .await;
    }
}
