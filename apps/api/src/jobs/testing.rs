//! Test doubles shared by the job, worker and API tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::generation::{GenerationProvider, Tone};
use crate::jobs::model::{Job, JobId};
use crate::jobs::store::{JobStore, StoreError};
use crate::llm_client::ProviderError;

#[derive(Debug, Clone)]
pub enum Step {
    Reply,
    Fail,
    Empty,
    Hang,
    Panic,
}

/// Provider that follows a script of outcomes, then repeats `fallback`.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: Mutex<HashMap<String, usize>>,
    overlap: AtomicBool,
}

impl ScriptedProvider {
    pub fn script(steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: Mutex::new(HashMap::new()),
            overlap: AtomicBool::new(false),
        }
    }

    pub fn always_ok() -> Self {
        Self::script(Vec::new(), Step::Reply)
    }

    pub fn always_failing() -> Self {
        Self::script(Vec::new(), Step::Fail)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// True if two calls for the same summary were ever in flight together.
    pub fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    fn enter(&self, summary: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(summary.to_string()).or_default();
        *count += 1;
        if *count > 1 {
            self.overlap.store(true, Ordering::SeqCst);
        }
    }

    fn leave(&self, summary: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(summary) {
            *count -= 1;
        }
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, summary: &str, tone: Tone) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        self.enter(summary);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.leave(summary);

        match step {
            Step::Reply => Ok(format!("Hi {summary}, a {tone} hello from our team.")),
            Step::Fail => Err(ProviderError::Api {
                status: 503,
                message: "overloaded".to_string(),
            }),
            Step::Empty => Ok("   ".to_string()),
            Step::Hang => std::future::pending().await,
            Step::Panic => panic!("provider blew up"),
        }
    }
}

/// Store whose every operation fails as if Redis were unreachable.
pub struct FailingStore;

fn unreachable_backend() -> StoreError {
    StoreError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

#[async_trait]
impl JobStore for FailingStore {
    async fn save(&self, _job: &Job) -> Result<(), StoreError> {
        Err(unreachable_backend())
    }

    async fn load(&self, _id: JobId) -> Result<Option<Job>, StoreError> {
        Err(unreachable_backend())
    }

    async fn put(&self, _id: JobId, _result: &str) -> Result<(), StoreError> {
        Err(unreachable_backend())
    }

    async fn get(&self, _id: JobId) -> Result<Option<String>, StoreError> {
        Err(unreachable_backend())
    }

    async fn pending(&self) -> Result<Vec<Job>, StoreError> {
        Err(unreachable_backend())
    }

    async fn acquire_lease(
        &self,
        _id: JobId,
        _owner: &str,
        _ttl: Duration,
    ) -> Result<bool, StoreError> {
        Err(unreachable_backend())
    }

    async fn release_lease(&self, _id: JobId, _owner: &str) -> Result<(), StoreError> {
        Err(unreachable_backend())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(unreachable_backend())
    }
}
