//! Optional adapter wrappers: I/O capture for offline debugging and retry
//! with exponential backoff. Both implement the provider contract and
//! delegate, so they compose with any adapter and with each other.

use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigManager;
use crate::error::Result;
use crate::prompt::Prompt;
use crate::provider::{ProviderAdapter, ProviderStatus, TokenCount};

// ── Capture ───────────────────────────────────────────────────────────────────

/// Records each generate call's prompt and outcome to a directory. Enabled
/// by setting `GENIE_CAPTURE_<PROVIDER>` to the target directory; purely
/// observational, never changes semantics.
pub struct CaptureAdapter {
    inner: Arc<dyn ProviderAdapter>,
    dir: PathBuf,
    sequence: AtomicU64,
}

impl CaptureAdapter {
    /// Wrap `inner` when capture is configured for `provider`, otherwise
    /// return it untouched.
    pub fn wrap(
        inner: Arc<dyn ProviderAdapter>,
        provider: &str,
        config: &dyn ConfigManager,
    ) -> Arc<dyn ProviderAdapter> {
        let key = format!("GENIE_CAPTURE_{}", provider.to_uppercase());
        let dir = config.get_string(&key, "");
        if dir.is_empty() {
            return inner;
        }
        Arc::new(Self {
            inner,
            dir: PathBuf::from(dir),
            sequence: AtomicU64::new(0),
        })
    }

    fn record(&self, prompt: &Prompt, outcome: &Result<String>) {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let stem = if prompt.name.trim().is_empty() {
            "prompt".to_string()
        } else {
            prompt.name.replace(['/', ' '], "-")
        };
        let request = json!({
            "name": prompt.name,
            "instruction": prompt.instruction,
            "text": prompt.text,
            "model_name": prompt.model_name,
            "max_tokens": prompt.max_tokens,
            "temperature": prompt.temperature,
            "top_p": prompt.top_p,
            "images": prompt.images.len(),
            "functions": prompt.functions.iter().map(|f| f.name.clone()).collect::<Vec<_>>(),
        });
        let response = match outcome {
            Ok(text) => text.clone(),
            Err(e) => format!("error: {e}"),
        };
        // Capture failures must never fail the call they observe.
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::debug!("capture dir unavailable: {e}");
            return;
        }
        let request_path = self.dir.join(format!("{stem}-{seq:04}-request.json"));
        let response_path = self.dir.join(format!("{stem}-{seq:04}-response.txt"));
        if let Err(e) = std::fs::write(&request_path, request.to_string()) {
            tracing::debug!("capture write failed: {e}");
        }
        if let Err(e) = std::fs::write(&response_path, response) {
            tracing::debug!("capture write failed: {e}");
        }
    }
}

#[async_trait]
impl ProviderAdapter for CaptureAdapter {
    async fn generate_content(&self, prompt: &Prompt, debug: bool) -> Result<String> {
        let outcome = self.inner.generate_content(prompt, debug).await;
        self.record(prompt, &outcome);
        outcome
    }

    async fn generate_content_attr(
        &self,
        prompt: &Prompt,
        debug: bool,
        attrs: &[(String, String)],
    ) -> Result<String> {
        let outcome = self.inner.generate_content_attr(prompt, debug, attrs).await;
        self.record(prompt, &outcome);
        outcome
    }

    async fn count_tokens(&self, prompt: &Prompt, debug: bool) -> Result<TokenCount> {
        self.inner.count_tokens(prompt, debug).await
    }

    async fn count_tokens_attr(
        &self,
        prompt: &Prompt,
        debug: bool,
        attrs: &[(String, String)],
    ) -> Result<TokenCount> {
        self.inner.count_tokens_attr(prompt, debug, attrs).await
    }

    fn get_status(&self) -> ProviderStatus {
        self.inner.get_status()
    }
}

// ── Retry ─────────────────────────────────────────────────────────────────────

/// Retries transient failures with exponential backoff. Non-transient
/// errors return immediately; see [`crate::error::GenieError::is_transient`]
/// for the classification.
pub struct RetryAdapter {
    inner: Arc<dyn ProviderAdapter>,
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryAdapter {
    pub fn wrap(inner: Arc<dyn ProviderAdapter>, config: &dyn ConfigManager) -> Arc<dyn ProviderAdapter> {
        let max_attempts = config
            .get_string("GENIE_RETRY_MAX_ATTEMPTS", "3")
            .parse()
            .unwrap_or(3);
        let base_delay_ms = config
            .get_string("GENIE_RETRY_BASE_DELAY_MS", "500")
            .parse()
            .unwrap_or(500);
        Arc::new(Self {
            inner,
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
        })
    }

    #[cfg(test)]
    fn with_policy(
        inner: Arc<dyn ProviderAdapter>,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            inner,
            max_attempts,
            base_delay,
        }
    }

    async fn run<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient provider error, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for RetryAdapter {
    async fn generate_content(&self, prompt: &Prompt, debug: bool) -> Result<String> {
        self.run(|| self.inner.generate_content(prompt, debug)).await
    }

    async fn generate_content_attr(
        &self,
        prompt: &Prompt,
        debug: bool,
        attrs: &[(String, String)],
    ) -> Result<String> {
        self.run(|| self.inner.generate_content_attr(prompt, debug, attrs))
            .await
    }

    async fn count_tokens(&self, prompt: &Prompt, debug: bool) -> Result<TokenCount> {
        self.run(|| self.inner.count_tokens(prompt, debug)).await
    }

    async fn count_tokens_attr(
        &self,
        prompt: &Prompt,
        debug: bool,
        attrs: &[(String, String)],
    ) -> Result<TokenCount> {
        self.run(|| self.inner.count_tokens_attr(prompt, debug, attrs))
            .await
    }

    fn get_status(&self) -> ProviderStatus {
        self.inner.get_status()
    }
}
