//! Sales message generation: tone handling, prompt construction, and the
//! provider seam the job workers call through.
//!
//! Concrete HTTP providers live in `llm_client`; nothing here talks to the network.

pub mod prompts;
pub mod tone;

use async_trait::async_trait;

use crate::llm_client::ProviderError;
pub use tone::Tone;

/// External text-generation capability.
///
/// Carried by the job system as `Arc<dyn GenerationProvider>` so the backend can be
/// swapped (Anthropic, OpenAI, scripted fakes in tests) without touching the workers.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Short name used in logs ("anthropic", "openai").
    fn name(&self) -> &str;

    async fn generate(&self, summary: &str, tone: Tone) -> Result<String, ProviderError>;
}
