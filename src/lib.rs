//! LLM orchestration core: one prompt contract multiplexed across
//! heterogeneous providers, a bounded tool-use loop dispatching model
//! function calls to registered handlers, and an MCP client that pulls
//! externally hosted tools into the same loop.
//!
//! The crate is a library with three collaborator seams the host supplies:
//! an [`events::EventBus`] for side-channel usage/notification events, a
//! [`config::ConfigManager`] for credentials and generation defaults, and a
//! [`prompt::PromptRenderer`] for attribute substitution. Stock
//! implementations of each are included.
//!
//! ```no_run
//! use std::sync::Arc;
//! use genie_core::config::EnvConfig;
//! use genie_core::events::NullEventBus;
//! use genie_core::prompt::{Prompt, TemplateRenderer};
//!
//! # async fn demo() -> genie_core::error::Result<()> {
//! let mux = genie_core::default_multiplexer(
//!     Arc::new(EnvConfig),
//!     Arc::new(NullEventBus),
//!     Arc::new(TemplateRenderer),
//! )?;
//! let prompt = Prompt {
//!     instruction: "You are a helpful assistant.".to_string(),
//!     text: "Say hello.".to_string(),
//!     ..Default::default()
//! };
//! let reply = mux.generate_content(&prompt, false).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod anthropic;
pub mod config;
pub mod error;
pub mod events;
pub mod mcp;
pub mod middleware;
pub mod multiplexer;
pub mod openai;
pub mod prompt;
pub mod provider;
pub mod toolloop;

use std::collections::HashMap;
use std::sync::Arc;

use crate::anthropic::AnthropicAdapter;
use crate::config::ConfigManager;
use crate::error::Result;
use crate::events::EventBus;
use crate::middleware::{CaptureAdapter, RetryAdapter};
use crate::multiplexer::Multiplexer;
use crate::openai::{Backend, OpenAiAdapter};
use crate::prompt::PromptRenderer;
use crate::provider::{Factory, ProviderAdapter};

/// Selects the default provider when the prompt names none.
pub const PROVIDER_ENV: &str = "GENIE_LLM_PROVIDER";
const DEFAULT_PROVIDER: &str = "anthropic";

fn wrap_middleware(
    adapter: Arc<dyn ProviderAdapter>,
    provider: &str,
    config: &dyn ConfigManager,
) -> Arc<dyn ProviderAdapter> {
    let captured = CaptureAdapter::wrap(adapter, provider, config);
    RetryAdapter::wrap(captured, config)
}

/// A multiplexer with the stock provider set registered: `anthropic` (with
/// `claude` as an alias), plus the OpenAI-compatible `openai`, `ollama`,
/// and `lmstudio` backends. The default provider comes from
/// `GENIE_LLM_PROVIDER`, falling back to `anthropic`. Every adapter is
/// wrapped in the capture and retry middleware.
pub fn default_multiplexer(
    config: Arc<dyn ConfigManager>,
    bus: Arc<dyn EventBus>,
    renderer: Arc<dyn PromptRenderer>,
) -> Result<Multiplexer> {
    let mut factories: HashMap<String, Factory> = HashMap::new();

    {
        let config = Arc::clone(&config);
        let bus = Arc::clone(&bus);
        let renderer = Arc::clone(&renderer);
        factories.insert(
            "anthropic".to_string(),
            Box::new(move || {
                let adapter = Arc::new(AnthropicAdapter::new(
                    Arc::clone(&config),
                    Arc::clone(&bus),
                    Arc::clone(&renderer),
                )) as Arc<dyn ProviderAdapter>;
                Ok(wrap_middleware(adapter, "anthropic", config.as_ref()))
            }),
        );
    }

    for backend in [Backend::OpenAi, Backend::Ollama, Backend::LmStudio] {
        let config = Arc::clone(&config);
        let bus = Arc::clone(&bus);
        let renderer = Arc::clone(&renderer);
        factories.insert(
            backend.name().to_string(),
            Box::new(move || {
                let adapter = Arc::new(OpenAiAdapter::new(
                    backend,
                    Arc::clone(&config),
                    Arc::clone(&bus),
                    Arc::clone(&renderer),
                )) as Arc<dyn ProviderAdapter>;
                Ok(wrap_middleware(adapter, backend.name(), config.as_ref()))
            }),
        );
    }

    let aliases: HashMap<String, String> = [
        ("claude", "anthropic"),
        ("gpt", "openai"),
        ("lm-studio", "lmstudio"),
        ("local", "ollama"),
    ]
    .into_iter()
    .map(|(a, t)| (a.to_string(), t.to_string()))
    .collect();

    let default = config.get_string(PROVIDER_ENV, DEFAULT_PROVIDER);
    Multiplexer::new(&default, factories, aliases)
}
