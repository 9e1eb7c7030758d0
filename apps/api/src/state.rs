use std::sync::Arc;

use crate::jobs::JobSystem;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Job lifecycle: submission, workers, status reads. Started before the router is served.
    pub jobs: Arc<JobSystem>,
}
