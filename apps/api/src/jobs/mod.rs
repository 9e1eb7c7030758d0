//! Asynchronous job lifecycle: submission, rate-limited execution, persisted results
//! and status reads.
//!
//! `JobSystem` is built once at startup, started explicitly, and handed to the HTTP
//! layer through `AppState`. There is no global queue.

pub mod memory_store;
pub mod model;
#[cfg(test)]
pub mod poll;
pub mod queue;
pub mod rate_limiter;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::generation::GenerationProvider;
use model::{JobId, JobState, MessagePayload};
use queue::{Backoff, JobEvent, JobQueue, QueueStats};
use rate_limiter::RateLimiter;
use store::{JobStore, StoreError};
use worker::Worker;

/// Slack added to a claim's lease on top of the provider timeout and rate-limit window.
const LEASE_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct JobSystemConfig {
    pub workers: usize,
    pub rate_limit_per_minute: NonZeroU32,
    pub max_attempts: u32,
    pub provider_timeout: Duration,
    pub retry_backoff: Duration,
}

/// What a client may learn about a job at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    /// `message` is `None` when the result has outlived its retention.
    Completed { message: Option<String> },
    Failed { reason: String },
}

pub struct JobSystem {
    queue: Arc<JobQueue>,
    limiter: Arc<RateLimiter>,
    provider: Arc<dyn GenerationProvider>,
    config: JobSystemConfig,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobSystem {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn GenerationProvider>,
        config: JobSystemConfig,
    ) -> Self {
        let lease_ttl = config.provider_timeout + rate_limiter::WINDOW + LEASE_MARGIN;
        let queue = Arc::new(
            JobQueue::new(
                store,
                config.max_attempts,
                Backoff::exponential(config.retry_backoff),
            )
            .with_lease_ttl(lease_ttl),
        );
        let limiter = Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute));
        let (shutdown, _) = watch::channel(false);

        Self {
            queue,
            limiter,
            provider,
            config,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Re-dispatches jobs left pending by a previous process and spawns the workers.
    /// Calling it again while running does nothing; calling it after `shutdown` restarts.
    pub async fn start(&self) -> Result<(), StoreError> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Ok(());
        }
        self.shutdown.send_replace(false);

        self.queue.recover().await?;

        for id in 0..self.config.workers.max(1) {
            let worker = Worker::new(
                id,
                Arc::clone(&self.queue),
                Arc::clone(&self.limiter),
                Arc::clone(&self.provider),
                self.config.provider_timeout,
            );
            workers.push(tokio::spawn(worker.run(self.shutdown.subscribe())));
        }

        info!(
            workers = workers.len(),
            rate_limit_per_minute = self.limiter.limit(),
            max_attempts = self.queue.max_attempts(),
            provider = self.provider.name(),
            "job system started"
        );
        Ok(())
    }

    /// Signals the workers to stop and waits for them.
    pub async fn shutdown(&self) {
        // Held until every worker is gone so a concurrent `start` cannot clear the signal early.
        let mut workers = self.workers.lock().await;
        self.shutdown.send_replace(true);
        for handle in workers.drain(..) {
            if let Err(e) = handle.await {
                error!("worker task ended abnormally: {e}");
            }
        }
        info!("job system stopped");
    }

    pub async fn submit(&self, payload: MessagePayload) -> Result<JobId, StoreError> {
        self.queue.enqueue(payload).await
    }

    /// Point-in-time status read from the store. `None` for unknown or expired ids.
    pub async fn status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        let Some(job) = self.queue.get_job(id).await? else {
            return Ok(None);
        };

        let status = match job.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Completed => JobStatus::Completed {
                message: self.queue.store().get(id).await?,
            },
            JobState::Failed => JobStatus::Failed {
                reason: job
                    .error_reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| "unknown failure".to_string()),
            },
        };
        Ok(Some(status))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.queue.subscribe()
    }

    pub async fn stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.queue.store().ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Tone;
    use crate::jobs::memory_store::MemoryJobStore;
    use crate::jobs::poll::{wait_for_terminal, PollOutcome, PollPolicy};
    use crate::jobs::testing::{ScriptedProvider, Step};

    fn config(workers: usize, max_attempts: u32) -> JobSystemConfig {
        JobSystemConfig {
            workers,
            rate_limit_per_minute: NonZeroU32::new(60).unwrap(),
            max_attempts,
            provider_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
        }
    }

    fn payload(summary: &str) -> MessagePayload {
        MessagePayload {
            summary: summary.to_string(),
            tone: Tone::Friendly,
        }
    }

    fn policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(100),
            max_duration: Duration::from_secs(600),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_completes_and_result_is_readable() {
        let store = Arc::new(MemoryJobStore::new());
        let provider = Arc::new(ScriptedProvider::always_ok().with_delay(Duration::from_secs(2)));
        let system = JobSystem::new(store.clone(), provider, config(1, 3));
        system.start().await.unwrap();

        let id = system
            .submit(payload("Acme Corp, 50 employees, evaluating CRM"))
            .await
            .unwrap();
        assert_eq!(system.status(id).await.unwrap(), Some(JobStatus::Pending));

        let outcome = wait_for_terminal(&system, id, policy()).await.unwrap();
        let message = match outcome {
            PollOutcome::Terminal(JobStatus::Completed { message: Some(m) }) => m,
            other => panic!("expected completed job, got {other:?}"),
        };
        assert!(!message.is_empty());
        assert_eq!(store.get(id).await.unwrap(), Some(message));

        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_succeeding_on_retry_completes() {
        let provider = Arc::new(ScriptedProvider::script(
            vec![Step::Fail, Step::Fail],
            Step::Reply,
        ));
        let system = JobSystem::new(Arc::new(MemoryJobStore::new()), provider.clone(), config(1, 3));
        system.start().await.unwrap();

        let id = system.submit(payload("Acme")).await.unwrap();
        let outcome = wait_for_terminal(&system, id, policy()).await.unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Terminal(JobStatus::Completed { message: Some(_) })
        ));
        assert_eq!(provider.calls(), 3);

        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_provider_ends_failed_after_max_attempts() {
        let provider = Arc::new(ScriptedProvider::always_failing());
        let system = JobSystem::new(Arc::new(MemoryJobStore::new()), provider.clone(), config(2, 3));
        system.start().await.unwrap();

        let id = system.submit(payload("Acme")).await.unwrap();
        let outcome = wait_for_terminal(&system, id, policy()).await.unwrap();
        let reason = match outcome {
            PollOutcome::Terminal(JobStatus::Failed { reason }) => reason,
            other => panic!("expected failed job, got {other:?}"),
        };
        assert!(reason.starts_with("exhausted 3/3 attempts"));

        // Never retried past the ceiling.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(provider.calls(), 3);

        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_job_runs_twice_at_once_across_workers() {
        let provider = Arc::new(
            ScriptedProvider::script(vec![Step::Fail; 6], Step::Reply)
                .with_delay(Duration::from_millis(1500)),
        );
        let system = JobSystem::new(Arc::new(MemoryJobStore::new()), provider.clone(), config(4, 3));
        system.start().await.unwrap();

        let mut ids = Vec::new();
        for n in 0..6 {
            ids.push(system.submit(payload(&format!("prospect {n}"))).await.unwrap());
        }
        for id in ids {
            let outcome = wait_for_terminal(&system, id, policy()).await.unwrap();
            assert!(matches!(outcome, PollOutcome::Terminal(_)));
        }
        assert!(!provider.saw_overlap());

        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_submissions_are_tracked_independently() {
        let system = JobSystem::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(ScriptedProvider::always_ok()),
            config(2, 3),
        );
        system.start().await.unwrap();

        let (a, b) = tokio::join!(system.submit(payload("Acme")), system.submit(payload("Acme")));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);

        for id in [a, b] {
            let outcome = wait_for_terminal(&system, id, policy()).await.unwrap();
            assert!(matches!(outcome, PollOutcome::Terminal(JobStatus::Completed { .. })));
        }
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spaces_out_provider_calls() {
        let provider = Arc::new(ScriptedProvider::always_ok());
        let mut cfg = config(3, 3);
        cfg.rate_limit_per_minute = NonZeroU32::new(2).unwrap();
        let system = JobSystem::new(Arc::new(MemoryJobStore::new()), provider.clone(), cfg);
        system.start().await.unwrap();

        let start = tokio::time::Instant::now();
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(system.submit(payload(&format!("p{n}"))).await.unwrap());
        }
        for id in &ids {
            wait_for_terminal(&system, *id, policy()).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(provider.calls(), 3);

        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_recovers_jobs_left_pending() {
        let store = Arc::new(MemoryJobStore::new());
        let leftover = model::Job::new(payload("left over"), 3);
        store.save(&leftover).await.unwrap();

        let system = JobSystem::new(store, Arc::new(ScriptedProvider::always_ok()), config(1, 3));
        system.start().await.unwrap();

        let outcome = wait_for_terminal(&system, leftover.id, policy()).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Terminal(JobStatus::Completed { .. })));
        system.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_runs_jobs_again_after_restart() {
        let store = Arc::new(MemoryJobStore::new());
        let system = JobSystem::new(store, Arc::new(ScriptedProvider::always_ok()), config(2, 3));
        system.start().await.unwrap();
        system.shutdown().await;

        system.start().await.unwrap();
        let id = system.submit(payload("Acme")).await.unwrap();

        match wait_for_terminal(&system, id, policy()).await.unwrap() {
            PollOutcome::Terminal(JobStatus::Completed { message }) => assert!(message.is_some()),
            other => panic!("expected completed job after restart, got {other:?}"),
        }
        system.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_id_has_no_status() {
        let system = JobSystem::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(ScriptedProvider::always_ok()),
            config(1, 3),
        );
        assert_eq!(system.status(JobId::new()).await.unwrap(), None);
        let outcome = wait_for_terminal(&system, JobId::new(), policy()).await.unwrap();
        assert_eq!(outcome, PollOutcome::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_gives_up_after_max_duration() {
        let system = JobSystem::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(ScriptedProvider::always_ok()),
            config(1, 3),
        );
        // Not started: the job stays pending.
        let id = system.submit(payload("Acme")).await.unwrap();
        let outcome = wait_for_terminal(
            &system,
            id,
            PollPolicy {
                interval: Duration::from_secs(1),
                max_duration: Duration::from_secs(5),
            },
        )
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_completed_job_with_expired_result_reports_no_message() {
        let store = Arc::new(MemoryJobStore::new());
        let mut job = model::Job::new(payload("Acme"), 3);
        job.complete("Hello".to_string()).unwrap();
        store.save(&job).await.unwrap();
        store.expire_result(job.id).await;

        let system = JobSystem::new(store, Arc::new(ScriptedProvider::always_ok()), config(1, 3));
        assert_eq!(
            system.status(job.id).await.unwrap(),
            Some(JobStatus::Completed { message: None })
        );
    }
}
