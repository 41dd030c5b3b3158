//! The provider-adapter contract implemented by every LLM backend.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::prompt::Prompt;

/// Token counts reported by a provider for one prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCount {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// Point-in-time adapter status for display surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderStatus {
    /// Formatted as `"<model>, Temperature: <t>, Max Tokens: <n>"`.
    pub model: String,
    pub backend: String,
    pub connected: bool,
    pub message: String,
}

/// One contract, multiple wire encodings. Adapters are cheap to construct;
/// expensive initialization (API key lookup, HTTP client) happens lazily on
/// first use and is cached for the process lifetime.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Run the prompt to completion, resolving any tool calls the model
    /// makes along the way, and return the final text.
    async fn generate_content(&self, prompt: &Prompt, debug: bool) -> Result<String>;

    /// Like [`generate_content`](Self::generate_content), but first renders
    /// the instruction and text through the prompt renderer with `attrs`.
    async fn generate_content_attr(
        &self,
        prompt: &Prompt,
        debug: bool,
        attrs: &[(String, String)],
    ) -> Result<String>;

    /// Count the tokens the rendered prompt would consume.
    async fn count_tokens(&self, prompt: &Prompt, debug: bool) -> Result<TokenCount>;

    async fn count_tokens_attr(
        &self,
        prompt: &Prompt,
        debug: bool,
        attrs: &[(String, String)],
    ) -> Result<TokenCount>;

    fn get_status(&self) -> ProviderStatus;
}

impl std::fmt::Debug for dyn ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ProviderAdapter")
    }
}

/// Deferred adapter constructor registered with the multiplexer.
pub type Factory = Box<dyn Fn() -> Result<Arc<dyn ProviderAdapter>> + Send + Sync>;
