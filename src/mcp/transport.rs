//! Transport layer for MCP connections.
//!
//! All transports speak line-framed JSON: one message per call to
//! [`Transport::send`]/[`Transport::receive`]. The stdio transport is the
//! workhorse; HTTP and SSE conform to the same interface but their wire
//! behaviour is a future extension.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::config::{ServerConfig, TransportKind};
use crate::error::{GenieError, Result};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection, for transports that need it. Default no-op.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Frame and write one message.
    async fn send(&self, message: &Value) -> Result<()>;

    /// Block until one complete message arrives; returns its raw bytes.
    /// Cancellation-safe: dropping the future abandons the read cleanly.
    async fn receive(&self) -> Result<Vec<u8>>;

    /// Tear down the connection. Idempotent.
    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Transport")
    }
}

/// Select and construct a transport from a server config, validating the
/// fields its computed type requires.
pub struct TransportFactory;

impl TransportFactory {
    pub fn create(server_name: &str, config: &ServerConfig) -> Result<Arc<dyn Transport>> {
        let kind = match config.validate() {
            Ok(kind) => kind,
            Err(GenieError::ConfigurationMissing(msg)) => {
                return Err(GenieError::ConfigurationMissing(format!(
                    "mcp server '{server_name}': {msg}"
                )));
            }
            Err(e) => return Err(e),
        };
        match kind {
            TransportKind::Stdio => Ok(Arc::new(StdioTransport::spawn(server_name, config)?)),
            TransportKind::Http => Ok(Arc::new(HttpTransport::new(
                config.url.clone().unwrap_or_default(),
            ))),
            TransportKind::Sse => Ok(Arc::new(SseTransport::new(
                config.url.clone().unwrap_or_default(),
            ))),
        }
    }
}

// ── Stdio ─────────────────────────────────────────────────────────────────────

/// A child process speaking newline-delimited JSON over its stdio pipes.
#[derive(Debug)]
pub struct StdioTransport {
    name: String,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawn the configured command with piped stdio and the config's env
    /// merged over the inherited environment. The child's stderr is drained
    /// to the log so a chatty server can't fill its pipe and stall.
    pub fn spawn(name: &str, config: &ServerConfig) -> Result<Self> {
        let command = config
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                GenieError::ConfigurationMissing(format!(
                    "mcp server '{name}': stdio transport requires a command"
                ))
            })?;

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            GenieError::ServerUnreachable(format!(
                "failed to spawn mcp server '{name}' ({command}): {e}"
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            GenieError::ServerUnreachable(format!("mcp server '{name}': no stdin pipe"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            GenieError::ServerUnreachable(format!("mcp server '{name}': no stdout pipe"))
        })?;
        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "stderr: {line}");
                }
            });
        }

        Ok(Self {
            name: name.to_string(),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(Some(child)),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: &Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GenieError::Wire(format!(
                "mcp server '{}': transport is closed",
                self.name
            )));
        }
        let mut line = serde_json::to_string(message)
            .map_err(|e| GenieError::Protocol(format!("unencodable message: {e}")))?;
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            GenieError::Wire(format!("mcp server '{}': stdin already closed", self.name))
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GenieError::Wire(format!(
                "mcp server '{}': transport is closed",
                self.name
            )));
        }
        let mut stdout = self.stdout.lock().await;
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = stdout.read_line(&mut buf).await?;
            if n == 0 {
                return Err(GenieError::Wire(format!(
                    "mcp server '{}' closed stdout",
                    self.name
                )));
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(trimmed.as_bytes().to_vec());
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping stdin sends the child EOF.
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

// ── HTTP / SSE placeholders ───────────────────────────────────────────────────

macro_rules! placeholder_transport {
    ($name:ident, $label:literal) => {
        /// Placeholder conforming to the transport interface; the wire
        /// behaviour is a future extension.
        pub struct $name {
            endpoint: String,
        }

        impl $name {
            pub fn new(endpoint: String) -> Self {
                Self { endpoint }
            }
        }

        #[async_trait]
        impl Transport for $name {
            async fn connect(&self) -> Result<()> {
                Err(GenieError::Wire(format!(
                    concat!($label, " transport to {} is not implemented yet"),
                    self.endpoint
                )))
            }

            async fn send(&self, _message: &Value) -> Result<()> {
                Err(GenieError::Wire(
                    concat!($label, " transport is not implemented yet").to_string(),
                ))
            }

            async fn receive(&self) -> Result<Vec<u8>> {
                Err(GenieError::Wire(
                    concat!($label, " transport is not implemented yet").to_string(),
                ))
            }

            async fn close(&self) -> Result<()> {
                Ok(())
            }

            fn is_connected(&self) -> bool {
                false
            }
        }
    };
}

placeholder_transport!(HttpTransport, "http");
placeholder_transport!(SseTransport, "sse");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn stdio_config(command: &str, args: &[&str]) -> ServerConfig {
        ServerConfig {
            command: Some(command.to_string()),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            kind: None,
            url: None,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_factory_rejects_missing_command() {
        let err = TransportFactory::create("broken", &ServerConfig::default()).unwrap_err();
        assert!(err.to_string().contains("requires a command"), "{err}");
    }

    #[test]
    fn test_factory_rejects_missing_url() {
        let config = ServerConfig {
            kind: Some("http".to_string()),
            ..Default::default()
        };
        let err = TransportFactory::create("broken", &config).unwrap_err();
        assert!(err.to_string().contains("requires a url"), "{err}");
    }

    #[tokio::test]
    async fn test_stdio_echo_via_cat() {
        // `cat` echoes each line straight back, which is exactly the framing
        // contract: one JSON object per newline-terminated line.
        let transport = StdioTransport::spawn("cat", &stdio_config("cat", &[])).unwrap();
        let message = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        transport.send(&message).await.unwrap();
        let raw = transport.receive().await.unwrap();
        let back: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back, message);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stdio_close_is_idempotent() {
        let transport = StdioTransport::spawn("cat", &stdio_config("cat", &[])).unwrap();
        assert!(transport.is_connected());
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        transport.close().await.unwrap();
        // Sends after close are refused.
        let err = transport.send(&json!({})).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_stdio_spawn_failure() {
        let config = stdio_config("definitely-not-a-real-binary-4721", &[]);
        let err = StdioTransport::spawn("ghost", &config).unwrap_err();
        assert!(matches!(err, GenieError::ServerUnreachable(_)));
    }

    #[tokio::test]
    async fn test_stdio_receive_reports_eof() {
        // `true` exits immediately without writing anything.
        let transport = StdioTransport::spawn("true", &stdio_config("true", &[])).unwrap();
        let err = transport.receive().await.unwrap_err();
        assert!(err.to_string().contains("closed stdout"), "{err}");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_placeholders_refuse_traffic() {
        let http = HttpTransport::new("https://example.com/mcp".to_string());
        assert!(!http.is_connected());
        assert!(http.send(&json!({})).await.is_err());
        assert!(http.receive().await.is_err());
        assert!(http.close().await.is_ok());

        let sse = SseTransport::new("https://example.com/sse".to_string());
        assert!(sse.connect().await.is_err());
    }
}
