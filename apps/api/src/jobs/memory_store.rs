//! In-process `JobStore`. Not durable; used for local runs without Redis and in tests.
//!
//! Retention is bounded by count: once more than `capacity` jobs are held, the oldest
//! terminal jobs are evicted first. Pending jobs are never evicted.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::jobs::model::{Job, JobId};
use crate::jobs::store::{JobStore, StoreError};

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    results: HashMap<JobId, String>,
    leases: HashMap<JobId, (String, Instant)>,
}

pub struct MemoryJobStore {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    /// Drops a result as if its retention had run out.
    #[cfg(test)]
    pub async fn expire_result(&self, id: JobId) {
        self.inner.write().await.results.remove(&id);
    }
}

impl Inner {
    fn evict(&mut self, capacity: usize) {
        let overflow = self.jobs.len().saturating_sub(capacity);
        if overflow == 0 {
            return;
        }
        let mut terminal: Vec<_> = self
            .jobs
            .values()
            .filter(|j| j.state.is_terminal())
            .map(|j| (j.finished_at.unwrap_or(j.updated_at), j.id))
            .collect();
        terminal.sort_by_key(|(finished, _)| *finished);
        for (_, id) in terminal.into_iter().take(overflow) {
            self.jobs.remove(&id);
            self.results.remove(&id);
            self.leases.remove(&id);
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.jobs.get(&job.id).is_some_and(|j| j.state.is_terminal()) {
            return Err(StoreError::AlreadyTerminal(job.id));
        }
        inner.jobs.insert(job.id, job.clone());
        inner.evict(self.capacity);
        Ok(())
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn put(&self, id: JobId, result: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .results
            .insert(id, result.to_string());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.results.get(&id).cloned())
    }

    async fn pending(&self) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn acquire_lease(
        &self,
        id: JobId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let held_elsewhere = inner
            .leases
            .get(&id)
            .is_some_and(|(holder, until)| holder != owner && *until > now);
        if held_elsewhere {
            return Ok(false);
        }
        inner.leases.insert(id, (owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lease(&self, id: JobId, owner: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.leases.get(&id).is_some_and(|(holder, _)| holder == owner) {
            inner.leases.remove(&id);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
