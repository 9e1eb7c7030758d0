//! Worker loop: claim a job, wait for a rate-limit slot, call the provider under a
//! timeout, and report the outcome back to the queue.
//!
//! Nothing a single job does can end the loop. Provider errors, timeouts, empty
//! replies and panics inside the provider all become a failed attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, info_span, Instrument};

use crate::generation::GenerationProvider;
use crate::jobs::model::Job;
use crate::jobs::queue::JobQueue;
use crate::jobs::rate_limiter::RateLimiter;
use crate::llm_client::ProviderError;

/// Pause after the store fails a claim, before trying again.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct Worker {
    id: usize,
    queue: Arc<JobQueue>,
    limiter: Arc<RateLimiter>,
    provider: Arc<dyn GenerationProvider>,
    timeout: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<JobQueue>,
        limiter: Arc<RateLimiter>,
        provider: Arc<dyn GenerationProvider>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            limiter,
            provider,
            timeout,
        }
    }

    /// Runs until shutdown is signalled. An attempt already in flight finishes first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = self.id, provider = self.provider.name(), "worker started");

        while let Some(next) = self.queue.next(&mut shutdown).await {
            match next {
                Ok(job) => self.process(job).await,
                Err(e) => {
                    error!(worker = self.id, "failed to claim job: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(STORE_RETRY_DELAY) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!(worker = self.id, "worker stopped");
    }

    /// Executes one claimed attempt and records its outcome.
    pub async fn process(&self, job: Job) {
        let span = info_span!("job", job_id = %job.id, attempt = job.attempts, worker = self.id);

        async {
            match self.attempt(&job).await {
                Ok(message) => {
                    if let Err(e) = self.queue.complete(&job, message).await {
                        error!("failed to record completion: {e}");
                        self.report_failure(&job, &format!("failed to store result: {e}"))
                            .await;
                    }
                }
                Err(reason) => self.report_failure(&job, &reason).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, job: &Job) -> Result<String, String> {
        self.limiter.acquire().await;

        let provider = Arc::clone(&self.provider);
        let payload = job.payload.clone();
        let timeout = self.timeout;

        // Spawned so a panicking provider only takes down this attempt.
        let call = tokio::spawn(async move {
            tokio::time::timeout(timeout, provider.generate(&payload.summary, payload.tone)).await
        });

        match call.await {
            Ok(Ok(Ok(text))) => {
                let text = text.trim();
                if text.is_empty() {
                    Err(ProviderError::EmptyContent.to_string())
                } else {
                    Ok(text.to_string())
                }
            }
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(_elapsed)) => Err(ProviderError::Timeout(timeout).to_string()),
            Err(join) => Err(format!("generation task aborted: {join}")),
        }
    }

    async fn report_failure(&self, job: &Job, reason: &str) {
        if let Err(e) = self.queue.fail(job, reason).await {
            error!("failed to record failed attempt: {e}");
        }
    }
}
