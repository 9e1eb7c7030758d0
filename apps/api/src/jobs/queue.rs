//! In-process dispatch over the durable store.
//!
//! The store holds every job record; the queue only holds ids. An id lives in exactly
//! one of three places while its job is pending: `ready` (waiting for a worker),
//! `active` (claimed by a worker) or a scheduled retry timer. Claiming moves an id
//! from `ready` to `active` under one lock, so two workers can never hold the same job.
//!
//! Across processes sharing one store, a claim also takes the job's store lease. A job
//! whose lease is held elsewhere is checked again later, and a record that is already
//! terminal is never overwritten, so a late attempt cannot change a finished job.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::jobs::model::{Job, JobId, MessagePayload};
use crate::jobs::store::{JobStore, StoreError};

const EVENT_CAPACITY: usize = 256;

/// Store lease taken by a claim unless the queue is built `with_lease_ttl`.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(180);

/// Pause before looking again at a job whose lease another owner holds.
const LEASE_RECHECK: Duration = Duration::from_secs(5);

/// Exponential retry backoff: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const DEFAULT_MAX: Duration = Duration::from_secs(30);

    pub fn exponential(base: Duration) -> Self {
        Self {
            base,
            max: Self::DEFAULT_MAX,
        }
    }

    /// Delay before re-dispatching a job whose `attempt`-th attempt just failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// Passive lifecycle notifications. The store stays the source of truth.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Completed { id: JobId, attempts: u32 },
    Retrying { id: JobId, attempt: u32, delay: Duration, error: String },
    Failed { id: JobId, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub active: usize,
    pub scheduled: usize,
}

#[derive(Default)]
struct Dispatch {
    ready: VecDeque<JobId>,
    active: HashSet<JobId>,
    scheduled: HashSet<JobId>,
}

pub struct JobQueue {
    store: Arc<dyn JobStore>,
    dispatch: Arc<Mutex<Dispatch>>,
    notify: Arc<Notify>,
    max_attempts: u32,
    backoff: Backoff,
    events: broadcast::Sender<JobEvent>,
    owner: String,
    lease_ttl: Duration,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, max_attempts: u32, backoff: Backoff) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            dispatch: Arc::new(Mutex::new(Dispatch::default())),
            notify: Arc::new(Notify::new()),
            max_attempts: max_attempts.max(1),
            backoff,
            events,
            owner: Uuid::new_v4().to_string(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Lease length for claims. Must outlast one attempt, including the rate-limit wait.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Persists a new pending job and schedules it. Returns as soon as the record is stored.
    pub async fn enqueue(&self, payload: MessagePayload) -> Result<JobId, StoreError> {
        let job = Job::new(payload, self.max_attempts);
        self.store.save(&job).await?;
        self.dispatch(job.id).await;
        info!(job_id = %job.id, tone = %job.payload.tone, "job enqueued");
        Ok(job.id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.store.load(id).await
    }

    /// Re-dispatches every pending job found in the store, oldest first.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let pending = self.store.pending().await?;
        let count = pending.len();
        for job in pending {
            self.dispatch(job.id).await;
        }
        if count > 0 {
            info!(count, "recovered pending jobs");
        }
        Ok(count)
    }

    pub async fn stats(&self) -> QueueStats {
        let d = self.dispatch.lock().await;
        QueueStats {
            ready: d.ready.len(),
            active: d.active.len(),
            scheduled: d.scheduled.len(),
        }
    }

    async fn dispatch(&self, id: JobId) {
        push_ready(&self.dispatch, &self.notify, id).await;
    }

    /// Claims the next ready job and starts an attempt on it.
    pub async fn claim(&self) -> Result<Option<Job>, StoreError> {
        loop {
            let id = {
                let mut d = self.dispatch.lock().await;
                let Some(id) = d.ready.pop_front() else {
                    return Ok(None);
                };
                if !d.active.insert(id) {
                    continue;
                }
                // Notify keeps a single permit, so pass the wakeup on to the next idle worker.
                if !d.ready.is_empty() {
                    self.notify.notify_one();
                }
                id
            };

            match self.store.acquire_lease(id, &self.owner, self.lease_ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    self.release(id).await;
                    self.defer_leased(id).await?;
                    continue;
                }
                Err(e) => {
                    self.release_to_front(id).await;
                    return Err(e);
                }
            }

            let mut job = match self.store.load(id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(job_id = %id, "dispatched job no longer in store, skipping");
                    self.settle(id).await;
                    continue;
                }
                Err(e) => {
                    self.drop_lease(id).await;
                    self.release_to_front(id).await;
                    return Err(e);
                }
            };

            if job.state.is_terminal() {
                self.settle(id).await;
                continue;
            }

            // An earlier process ran the last attempt but never recorded its outcome.
            if job.attempts_exhausted() {
                let last = job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "interrupted".to_string());
                self.fail(&job, &last).await?;
                continue;
            }

            let attempt = job.begin_attempt()?;
            match self.store.save(&job).await {
                Ok(()) => {}
                Err(StoreError::AlreadyTerminal(_)) => {
                    self.settle(id).await;
                    continue;
                }
                Err(e) => {
                    self.drop_lease(id).await;
                    self.release_to_front(id).await;
                    return Err(e);
                }
            }
            debug!(job_id = %id, attempt, "job claimed");
            return Ok(Some(job));
        }
    }

    /// Waits for the next job. Returns `None` once shutdown is signalled.
    pub async fn next(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Result<Job, StoreError>> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match self.claim().await {
                Ok(Some(job)) => return Some(Ok(job)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Stores the result, then marks the job completed. On a store error the claim is
    /// kept so the caller can report the attempt as failed.
    pub async fn complete(&self, job: &Job, result: String) -> Result<(), StoreError> {
        let mut done = job.clone();
        done.complete(result.clone())?;

        // A lease that ran out mid-attempt may have let another owner finish the job.
        if self
            .store
            .get_state(job.id)
            .await?
            .is_some_and(|state| state.is_terminal())
        {
            self.finished_elsewhere(job.id).await;
            return Ok(());
        }

        self.store.put(job.id, &result).await?;
        match self.store.save(&done).await {
            Err(StoreError::AlreadyTerminal(_)) => {
                self.finished_elsewhere(job.id).await;
                return Ok(());
            }
            saved => saved?,
        }
        self.settle(job.id).await;

        info!(job_id = %job.id, attempts = done.attempts, "job completed");
        let _ = self.events.send(JobEvent::Completed {
            id: job.id,
            attempts: done.attempts,
        });
        Ok(())
    }

    /// Records a failed attempt: schedules a retry, or marks the job failed once
    /// attempts are exhausted.
    pub async fn fail(&self, job: &Job, error: &str) -> Result<(), StoreError> {
        let mut next = job.clone();

        if next.attempts_exhausted() {
            let reason = format!(
                "exhausted {}/{} attempts: {error}",
                next.attempts, next.max_attempts
            );
            next.fail(reason.clone())?;
            match self.store.save(&next).await {
                Ok(()) => self.settle(job.id).await,
                Err(StoreError::AlreadyTerminal(_)) => {
                    self.finished_elsewhere(job.id).await;
                    return Ok(());
                }
                Err(e) => {
                    // Still pending in the store; the next claim fails it again.
                    self.settle(job.id).await;
                    self.schedule(job.id, self.backoff.delay(next.attempts)).await;
                    return Err(e);
                }
            }

            error!(job_id = %job.id, attempts = next.attempts, "job failed: {reason}");
            let _ = self.events.send(JobEvent::Failed { id: job.id, reason });
            return Ok(());
        }

        next.record_retryable_failure(error.to_string())?;
        let delay = self.backoff.delay(next.attempts);
        let saved = self.store.save(&next).await;
        if let Err(StoreError::AlreadyTerminal(_)) = saved {
            self.finished_elsewhere(job.id).await;
            return Ok(());
        }
        self.settle(job.id).await;
        self.schedule(job.id, delay).await;
        saved?;

        warn!(
            job_id = %job.id,
            attempt = next.attempts,
            max_attempts = next.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "job attempt failed, retrying: {error}"
        );
        let _ = self.events.send(JobEvent::Retrying {
            id: job.id,
            attempt: next.attempts,
            delay,
            error: error.to_string(),
        });
        Ok(())
    }

    async fn release(&self, id: JobId) {
        self.dispatch.lock().await.active.remove(&id);
    }

    /// Ends a claim: gives up the store lease and the local slot.
    async fn settle(&self, id: JobId) {
        self.drop_lease(id).await;
        self.release(id).await;
    }

    async fn drop_lease(&self, id: JobId) {
        if let Err(e) = self.store.release_lease(id, &self.owner).await {
            // The lease still expires on its own.
            warn!(job_id = %id, "failed to release job lease: {e}");
        }
    }

    async fn finished_elsewhere(&self, id: JobId) {
        warn!(job_id = %id, "job already finished by another owner, discarding attempt");
        self.settle(id).await;
    }

    /// Another owner is running `id`. Look again later unless it has already finished.
    async fn defer_leased(&self, id: JobId) -> Result<(), StoreError> {
        match self.store.get_state(id).await {
            Ok(Some(state)) if state.is_terminal() => Ok(()),
            Ok(None) => Ok(()),
            Ok(Some(_)) => {
                debug!(job_id = %id, "job leased by another owner, deferring");
                self.schedule(id, LEASE_RECHECK).await;
                Ok(())
            }
            Err(e) => {
                self.schedule(id, LEASE_RECHECK).await;
                Err(e)
            }
        }
    }

    async fn release_to_front(&self, id: JobId) {
        let mut d = self.dispatch.lock().await;
        d.active.remove(&id);
        d.ready.push_front(id);
    }

    async fn schedule(&self, id: JobId, delay: Duration) {
        self.dispatch.lock().await.scheduled.insert(id);

        let dispatch = Arc::clone(&self.dispatch);
        let notify = Arc::clone(&self.notify);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            dispatch.lock().await.scheduled.remove(&id);
            push_ready(&dispatch, &notify, id).await;
        });
    }
}

async fn push_ready(dispatch: &Mutex<Dispatch>, notify: &Notify, id: JobId) {
    {
        let mut d = dispatch.lock().await;
        if d.active.contains(&id) || d.ready.contains(&id) {
            return;
        }
        d.ready.push_back(id);
    }
    notify.notify_one();
}
