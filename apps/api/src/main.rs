mod config;
mod errors;
mod generation;
mod jobs;
mod llm_client;
mod messages;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, ProviderKind};
use crate::generation::GenerationProvider;
use crate::jobs::memory_store::MemoryJobStore;
use crate::jobs::queue::JobEvent;
use crate::jobs::store::{JobStore, RedisJobStore};
use crate::jobs::JobSystem;
use crate::llm_client::{LlmClient, OpenAiClient};
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Salesgen API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize job store
    let store: Arc<dyn JobStore> = if config.uses_memory_store() {
        warn!("Using in-memory job store; jobs will not survive a restart");
        Arc::new(MemoryJobStore::new())
    } else {
        Arc::new(
            RedisJobStore::connect(&config.redis_url, config.job_retention)
                .await
                .context("Failed to connect to Redis")?,
        )
    };

    // Initialize generation provider
    let provider = build_provider(&config)?;

    // Start workers
    let jobs = Arc::new(JobSystem::new(store, provider, config.job_system()));
    jobs.start()
        .await
        .context("Failed to recover pending jobs")?;
    tokio::spawn(log_job_events(jobs.subscribe()));

    let state = AppState {
        jobs: Arc::clone(&jobs),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    jobs.shutdown().await;
    Ok(())
}

fn build_provider(config: &Config) -> Result<Arc<dyn GenerationProvider>> {
    let provider: Arc<dyn GenerationProvider> = match config.provider {
        ProviderKind::Anthropic => {
            let client = LlmClient::new(
                config.provider_api_key.clone(),
                config.model.clone(),
                config.provider_timeout,
            )
            .context("Failed to build Anthropic client")?;
            info!("LLM client initialized (provider: anthropic, model: {})", client.model());
            Arc::new(client)
        }
        ProviderKind::OpenAi => {
            let client = OpenAiClient::new(
                config.provider_api_key.clone(),
                config.model.clone(),
                config.provider_timeout,
            )
            .context("Failed to build OpenAI client")?;
            info!("LLM client initialized (provider: openai, model: {})", client.model());
            Arc::new(client)
        }
    };
    Ok(provider)
}

/// Mirrors job lifecycle notifications into the log.
async fn log_job_events(mut events: broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(JobEvent::Completed { id, attempts }) => {
                info!(job_id = %id, attempts, "Job {id} completed");
            }
            Ok(JobEvent::Retrying { id, attempt, delay, error }) => {
                warn!(job_id = %id, attempt, "Job {id} will retry in {delay:?}: {error}");
            }
            Ok(JobEvent::Failed { id, reason }) => {
                error!(job_id = %id, "Job {id} failed: {reason}");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("job event log fell behind, skipped {skipped} events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
