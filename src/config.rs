//! Configuration lookup collaborator.
//!
//! Adapters read their credentials and generation defaults through
//! `ConfigManager` rather than touching the process environment directly,
//! so hosts can substitute file- or vault-backed sources. `EnvConfig` is
//! the stock environment-variable implementation.

use std::collections::HashMap;

/// Composite generation defaults, consulted when a `Prompt` leaves a
/// parameter unset. Resolution order is prompt value, then this, then the
/// adapter's built-in default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelConfig {
    pub model_name: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

pub trait ConfigManager: Send + Sync {
    /// String value for `key`, or `default` when absent or empty.
    fn get_string(&self, key: &str, default: &str) -> String;

    /// Boolean value for `key`. Accepts `true`/`false`, `1`/`0`, `yes`/`no`
    /// case-insensitively; anything else falls back to `default`.
    fn get_bool(&self, key: &str, default: bool) -> bool;

    fn model_config(&self) -> ModelConfig;
}

fn parse_bool(raw: &str, default: bool) -> bool {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        _ => default,
    }
}

// ── Environment-backed implementation ─────────────────────────────────────────

/// Reads every key straight from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvConfig;

impl ConfigManager for EnvConfig {
    fn get_string(&self, key: &str, default: &str) -> String {
        match std::env::var(key) {
            Ok(v) if !v.trim().is_empty() => v,
            _ => default.to_string(),
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match std::env::var(key) {
            Ok(v) => parse_bool(&v, default),
            Err(_) => default,
        }
    }

    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model_name: std::env::var("GENIE_MODEL_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            max_tokens: std::env::var("GENIE_MAX_TOKENS")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            temperature: std::env::var("GENIE_TEMPERATURE")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            top_p: std::env::var("GENIE_TOP_P")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
        }
    }
}

// ── Map-backed implementation ─────────────────────────────────────────────────

/// Fixed key/value configuration. Useful for tests and for hosts that
/// resolve settings themselves.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    values: HashMap<String, String>,
    model: ModelConfig,
}

impl MapConfig {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self {
            values,
            model: ModelConfig::default(),
        }
    }

    pub fn with_model_config(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

impl ConfigManager for MapConfig {
    fn get_string(&self, key: &str, default: &str) -> String {
        match self.values.get(key) {
            Some(v) if !v.trim().is_empty() => v.clone(),
            _ => default.to_string(),
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(v) => parse_bool(v, default),
            None => default,
        }
    }

    fn model_config(&self) -> ModelConfig {
        self.model.clone()
    }
}
