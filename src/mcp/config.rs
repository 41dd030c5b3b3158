//! MCP server configuration: `.mcp.json` discovery, environment-variable
//! expansion, and per-server validation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{GenieError, Result};

/// The `.mcp.json` document: a map of server name to server config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: HashMap<String, ServerConfig>,
}

impl McpConfig {
    /// Overlay `other` on top of this config; entries in `other` win.
    pub fn merge(&mut self, other: McpConfig) {
        self.mcp_servers.extend(other.mcp_servers);
    }
}

/// Transport selection, computed from the config's lowercased `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Sse => write!(f, "sse"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl ServerConfig {
    /// Transport type: lowercased `type`, defaulting to stdio.
    pub fn transport_kind(&self) -> Result<TransportKind> {
        let raw = self.kind.as_deref().unwrap_or("").trim().to_lowercase();
        match raw.as_str() {
            "" | "stdio" => Ok(TransportKind::Stdio),
            "sse" => Ok(TransportKind::Sse),
            "http" => Ok(TransportKind::Http),
            other => Err(GenieError::ConfigurationMissing(format!(
                "unsupported transport type '{other}'"
            ))),
        }
    }

    /// Stdio requires a command; sse/http require a URL.
    pub fn validate(&self) -> Result<TransportKind> {
        let kind = self.transport_kind()?;
        match kind {
            TransportKind::Stdio => {
                if self.command.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(GenieError::ConfigurationMissing(
                        "stdio transport requires a command".to_string(),
                    ));
                }
            }
            TransportKind::Sse | TransportKind::Http => {
                if self.url.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(GenieError::ConfigurationMissing(format!(
                        "{kind} transport requires a url"
                    )));
                }
            }
        }
        Ok(kind)
    }
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Search order: `{working_dir}/.mcp.json`, then
/// `$HOME/.config/claude/mcp.json`, then `$HOME/.mcp.json`.
pub fn find_config_file(working_dir: &Path) -> Option<PathBuf> {
    let mut candidates = vec![working_dir.join(".mcp.json")];
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        candidates.push(home.join(".config").join("claude").join("mcp.json"));
        candidates.push(home.join(".mcp.json"));
    }
    candidates.into_iter().find(|p| p.is_file())
}

/// Read, expand environment references, and parse a config file.
pub fn load_config(path: &Path) -> Result<McpConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| GenieError::Wire(format!("failed to read {}: {e}", path.display())))?;
    let expanded = expand_env(&raw);
    serde_json::from_str(&expanded)
        .map_err(|e| GenieError::Protocol(format!("failed to parse {}: {e}", path.display())))
}

// ── Environment expansion ─────────────────────────────────────────────────────

/// Resolve `${VAR}` and `${VAR:-default}` references against the process
/// environment. This runs on the raw file text before JSON parsing, so
/// secrets can live in the environment rather than on disk.
///
/// An unset `${VAR}` expands to the empty string; `${VAR:-default}` falls
/// back to `default` (which may itself be empty). Unterminated `${` is
/// left as-is.
pub fn expand_env(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let inner = &after[..end];
                let value = match inner.split_once(":-") {
                    Some((name, default)) => lookup(name).unwrap_or_else(|| default.to_string()),
                    None => lookup(inner).unwrap_or_default(),
                };
                out.push_str(&value);
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
