//! Routes prompts to provider adapters by name.
//!
//! Adapters are built lazily through registered factories and cached for
//! the process lifetime; names are canonicalized (trimmed, lowercased) and
//! resolved through an alias table before lookup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{GenieError, Result};
use crate::prompt::Prompt;
use crate::provider::{Factory, ProviderAdapter, ProviderStatus, TokenCount};

pub struct Multiplexer {
    factories: HashMap<String, Factory>,
    aliases: HashMap<String, String>,
    clients: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
    default_provider: String,
    last_provider: RwLock<String>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("factory_names", &self.factories.keys().collect::<Vec<_>>())
            .field("aliases", &self.aliases)
            .field("default_provider", &self.default_provider)
            .finish()
    }
}

impl Multiplexer {
    /// `factories` must be non-empty, and `default_provider` must resolve
    /// (possibly through `aliases`) to one of them. Aliases with empty
    /// endpoints are discarded; all names are lowercased.
    pub fn new(
        default_provider: &str,
        factories: HashMap<String, Factory>,
        aliases: HashMap<String, String>,
    ) -> Result<Self> {
        if factories.is_empty() {
            return Err(GenieError::ProviderUnsupported(
                "no provider factories registered".to_string(),
            ));
        }
        let factories: HashMap<String, Factory> = factories
            .into_iter()
            .map(|(name, factory)| (name.trim().to_lowercase(), factory))
            .collect();
        let aliases: HashMap<String, String> = aliases
            .into_iter()
            .filter(|(alias, target)| !alias.trim().is_empty() && !target.trim().is_empty())
            .map(|(alias, target)| (alias.trim().to_lowercase(), target.trim().to_lowercase()))
            .collect();

        let mut default_provider = default_provider.trim().to_lowercase();
        if let Some(target) = aliases.get(&default_provider) {
            default_provider = target.clone();
        }
        if !factories.contains_key(&default_provider) {
            return Err(GenieError::ProviderUnsupported(format!(
                "default provider '{default_provider}' has no registered factory"
            )));
        }

        Ok(Self {
            factories,
            aliases,
            clients: RwLock::new(HashMap::new()),
            last_provider: RwLock::new(default_provider.clone()),
            default_provider,
        })
    }

    /// Trim, lowercase, fall back to the default on empty, and resolve one
    /// level of aliasing.
    pub fn canonical(&self, name: &str) -> String {
        let name = name.trim().to_lowercase();
        let name = if name.is_empty() {
            self.default_provider.clone()
        } else {
            name
        };
        match self.aliases.get(&name) {
            Some(target) => target.clone(),
            None => name,
        }
    }

    /// Cached adapter for `name`, constructing it on first use. The factory
    /// runs outside the lock; a concurrent construction race keeps the
    /// first-inserted instance.
    pub fn client_for(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>> {
        let canonical = self.canonical(name);

        if let Some(client) = self.clients.read().unwrap().get(&canonical) {
            return Ok(Arc::clone(client));
        }

        let factory = self.factories.get(&canonical).ok_or_else(|| {
            GenieError::ProviderUnsupported(format!("no provider named '{canonical}'"))
        })?;
        let fresh = factory()?;

        let mut clients = self.clients.write().unwrap();
        let client = clients.entry(canonical).or_insert(fresh);
        Ok(Arc::clone(client))
    }

    /// Eagerly construct and cache the adapter for `name`.
    pub fn warm_up(&self, name: &str) -> Result<()> {
        self.client_for(name).map(|_| ())
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    fn set_last_provider(&self, canonical: &str) {
        *self.last_provider.write().unwrap() = canonical.to_string();
    }

    pub async fn generate_content(&self, prompt: &Prompt, debug: bool) -> Result<String> {
        let canonical = self.canonical(&prompt.llm_provider);
        let client = self.client_for(&canonical)?;
        self.set_last_provider(&canonical);
        client.generate_content(prompt, debug).await
    }

    pub async fn generate_content_attr(
        &self,
        prompt: &Prompt,
        debug: bool,
        attrs: &[(String, String)],
    ) -> Result<String> {
        let canonical = self.canonical(&prompt.llm_provider);
        let client = self.client_for(&canonical)?;
        self.set_last_provider(&canonical);
        client.generate_content_attr(prompt, debug, attrs).await
    }

    pub async fn count_tokens(&self, prompt: &Prompt, debug: bool) -> Result<TokenCount> {
        let canonical = self.canonical(&prompt.llm_provider);
        let client = self.client_for(&canonical)?;
        self.set_last_provider(&canonical);
        client.count_tokens(prompt, debug).await
    }

    /// Status of the last-used provider, falling back to the default.
    /// Never fails: an unbuildable adapter reports as disconnected.
    pub fn get_status(&self) -> ProviderStatus {
        let provider = self.last_provider.read().unwrap().clone();
        match self.client_for(&provider) {
            Ok(client) => client.get_status(),
            Err(e) => ProviderStatus {
                model: String::new(),
                backend: provider,
                connected: false,
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAdapter {
        backend: String,
    }

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        async fn generate_content(&self, _prompt: &Prompt, _debug: bool) -> Result<String> {
            Ok(format!("from {}", self.backend))
        }

        async fn generate_content_attr(
            &self,
            prompt: &Prompt,
            debug: bool,
            _attrs: &[(String, String)],
        ) -> Result<String> {
            self.generate_content(prompt, debug).await
        }

        async fn count_tokens(&self, _prompt: &Prompt, _debug: bool) -> Result<TokenCount> {
            Ok(TokenCount::default())
        }

        async fn count_tokens_attr(
            &self,
            prompt: &Prompt,
            debug: bool,
            _attrs: &[(String, String)],
        ) -> Result<TokenCount> {
            self.count_tokens(prompt, debug).await
        }

        fn get_status(&self) -> ProviderStatus {
            ProviderStatus {
                model: "stub".to_string(),
                backend: self.backend.clone(),
                connected: true,
                message: String::new(),
            }
        }
    }

    fn stub_factories(names: &[&str]) -> (HashMap<String, Factory>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let mut factories = HashMap::new();
        for name in names {
            let name = name.to_string();
            let built = built.clone();
            factories.insert(
                name.clone(),
                Box::new(move || {
                    built.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(StubAdapter {
                        backend: name.clone(),
                    }) as Arc<dyn ProviderAdapter>)
                }) as Factory,
            );
        }
        (factories, built)
    }

    fn aliases(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(a, t)| (a.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_factories_rejected() {
        let err = Multiplexer::new("anthropic", HashMap::new(), HashMap::new()).unwrap_err();
        assert!(matches!(err, GenieError::ProviderUnsupported(_)));
    }

    #[test]
    fn test_unresolvable_default_rejected() {
        let (factories, _) = stub_factories(&["anthropic"]);
        let err = Multiplexer::new("nonesuch", factories, HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("nonesuch"));
    }

    #[test]
    fn test_default_resolves_through_alias() {
        let (factories, _) = stub_factories(&["anthropic"]);
        let mux =
            Multiplexer::new("claude", factories, aliases(&[("claude", "anthropic")])).unwrap();
        assert_eq!(mux.default_provider(), "anthropic");
    }

    #[test]
    fn test_canonicalization_variants() {
        let (factories, _) = stub_factories(&["anthropic"]);
        let mux =
            Multiplexer::new("anthropic", factories, aliases(&[("claude", "anthropic")])).unwrap();
        for key in ["anthropic", "ANTHROPIC", "claude", "CLAUDE", " anthropic "] {
            assert_eq!(mux.canonical(key), "anthropic", "key: {key:?}");
        }
        // Empty resolves to the default.
        assert_eq!(mux.canonical(""), "anthropic");
        assert_eq!(mux.canonical("   "), "anthropic");
    }

    #[test]
    fn test_empty_alias_endpoints_discarded() {
        let (factories, _) = stub_factories(&["anthropic"]);
        let mux = Multiplexer::new(
            "anthropic",
            factories,
            aliases(&[("", "anthropic"), ("ghost", "  ")]),
        )
        .unwrap();
        assert_eq!(mux.canonical("ghost"), "ghost");
        assert!(mux.client_for("ghost").is_err());
    }

    #[test]
    fn test_lazy_construction_and_caching() {
        let (factories, built) = stub_factories(&["anthropic", "openai"]);
        let mux = Multiplexer::new("anthropic", factories, HashMap::new()).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 0);

        let first = mux.client_for("anthropic").unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        let second = mux.client_for("ANTHROPIC").unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_warm_up_shares_instance_with_generate() {
        let (factories, built) = stub_factories(&["anthropic"]);
        let mux = Multiplexer::new("anthropic", factories, HashMap::new()).unwrap();
        mux.warm_up("anthropic").unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);

        let prompt = Prompt {
            llm_provider: "anthropic".to_string(),
            text: "hi".to_string(),
            ..Default::default()
        };
        let out = mux.generate_content(&prompt, false).await.unwrap();
        assert_eq!(out, "from anthropic");
        // The warm-up instance was reused, not rebuilt.
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_provider_uses_default() {
        let (factories, _) = stub_factories(&["anthropic", "openai"]);
        let mux = Multiplexer::new("openai", factories, HashMap::new()).unwrap();
        let prompt = Prompt {
            text: "hi".to_string(),
            ..Default::default()
        };
        let out = mux.generate_content(&prompt, false).await.unwrap();
        assert_eq!(out, "from openai");
    }

    #[tokio::test]
    async fn test_unknown_provider_errors() {
        let (factories, _) = stub_factories(&["anthropic"]);
        let mux = Multiplexer::new("anthropic", factories, HashMap::new()).unwrap();
        let prompt = Prompt {
            llm_provider: "bard".to_string(),
            ..Default::default()
        };
        let err = mux.generate_content(&prompt, false).await.unwrap_err();
        assert!(matches!(err, GenieError::ProviderUnsupported(_)));
        assert!(err.to_string().contains("bard"));
    }

    #[tokio::test]
    async fn test_status_prefers_last_used_provider() {
        let (factories, _) = stub_factories(&["anthropic", "openai"]);
        let mux = Multiplexer::new("anthropic", factories, HashMap::new()).unwrap();
        assert_eq!(mux.get_status().backend, "anthropic");

        let prompt = Prompt {
            llm_provider: "openai".to_string(),
            text: "hi".to_string(),
            ..Default::default()
        };
        mux.generate_content(&prompt, false).await.unwrap();
        assert_eq!(mux.get_status().backend, "openai");
    }

    #[test]
    fn test_factory_error_bubbles_up() {
        let mut factories: HashMap<String, Factory> = HashMap::new();
        factories.insert(
            "anthropic".to_string(),
            Box::new(|| {
                Err(GenieError::ConfigurationMissing(
                    "ANTHROPIC_API_KEY is not set".to_string(),
                ))
            }),
        );
        let mux = Multiplexer::new("anthropic", factories, HashMap::new()).unwrap();
        let err = mux.client_for("anthropic").unwrap_err();
        assert!(matches!(err, GenieError::ConfigurationMissing(_)));
        // Status never fails, it reports the problem instead.
        let status = mux.get_status();
        assert!(!status.connected);
        assert!(status.message.contains("ANTHROPIC_API_KEY"));
    }
}
