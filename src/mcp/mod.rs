//! MCP (Model Context Protocol) client.
//!
//! Connects to configured MCP servers, performs the JSON-RPC 2.0 handshake,
//! discovers tools, and dispatches calls. Each connection owns its transport
//! and a background reader task that correlates responses to in-flight
//! requests by id, so notifications and out-of-order traffic never stall a
//! caller. A broken server is logged and skipped; it never takes the rest
//! of the client down.

pub mod config;
pub mod protocol;
pub mod schema;
pub mod transport;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as TokioMutex};
use tokio::task::JoinHandle;

pub use config::{McpConfig, ServerConfig, TransportKind};
pub use schema::McpToolInfo;
pub use transport::{Transport, TransportFactory};

use crate::error::{GenieError, Result};
use crate::prompt::{FunctionDeclaration, Handler, HandlerArgs};
use protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "genie";

/// Bound on each server's connect + handshake during initialization.
const INIT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

// ── Wire results ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<McpToolInfo>,
}

// ── Server connection ─────────────────────────────────────────────────────────

type PendingMap = Arc<TokioMutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

struct ConnState {
    connected: bool,
    tools: Vec<McpToolInfo>,
}

/// One live MCP server. Owns its transport; a background reader task owns
/// the receive side exclusively and routes responses to waiting callers.
pub struct ServerConnection {
    name: String,
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    next_id: AtomicI64,
    request_timeout: Duration,
    reader: StdMutex<Option<JoinHandle<()>>>,
    state: RwLock<ConnState>,
}

impl ServerConnection {
    /// Run the MCP handshake over an already-created transport: `initialize`,
    /// `notifications/initialized`, then `tools/list`. On any failure the
    /// transport is closed before the error propagates.
    pub async fn establish(
        name: &str,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let conn = Arc::new(Self {
            name: name.to_string(),
            transport,
            pending: Arc::new(TokioMutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            request_timeout,
            reader: StdMutex::new(None),
            state: RwLock::new(ConnState {
                connected: false,
                tools: Vec::new(),
            }),
        });
        conn.spawn_reader();

        match conn.handshake().await {
            Ok(tools) => {
                let mut state = conn.state.write().unwrap();
                state.tools = tools;
                state.connected = true;
                drop(state);
                Ok(conn)
            }
            Err(e) => {
                let _ = conn.shutdown().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<Vec<McpToolInfo>> {
        let _init = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": CLIENT_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
            )
            .await?;

        self.notify("notifications/initialized", None).await?;

        let result = self.request("tools/list", None).await?;
        let list: ListToolsResult = serde_json::from_value(result).map_err(|e| {
            GenieError::Protocol(format!(
                "mcp server '{}': invalid tools/list result: {e}",
                self.name
            ))
        })?;
        Ok(list.tools)
    }

    /// Send a request and await the matching response. Ids are a
    /// per-connection monotonic counter; correlation happens in the reader
    /// task through the pending map.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let req = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_value(&req)
            .map_err(|e| GenieError::Protocol(format!("unencodable request: {e}")))?;
        if let Err(e) = self.transport.send(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(GenieError::Wire(format!(
                    "mcp server '{}': connection lost while awaiting '{method}'",
                    self.name
                )));
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(GenieError::Wire(format!(
                    "mcp server '{}': timed out awaiting '{method}'",
                    self.name
                )));
            }
        };

        if let Some(err) = response.error {
            return Err(GenieError::Protocol(format!(
                "mcp server '{}' returned error {} for '{method}': {}",
                self.name, err.code, err.message
            )));
        }
        response.result.ok_or_else(|| {
            GenieError::Protocol(format!(
                "mcp server '{}': response for '{method}' had no result",
                self.name
            ))
        })
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        let payload = serde_json::to_value(&notif)
            .map_err(|e| GenieError::Protocol(format!("unencodable notification: {e}")))?;
        self.transport.send(&payload).await
    }

    fn spawn_reader(self: &Arc<Self>) {
        let transport = Arc::clone(&self.transport);
        let pending = Arc::clone(&self.pending);
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            loop {
                let raw = match transport.receive().await {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::debug!(server = %name, "reader stopped: {e}");
                        break;
                    }
                };
                match protocol::parse_message(&raw) {
                    Ok(Message::Response(resp)) => match resp.id.as_i64() {
                        Some(id) => match pending.lock().await.remove(&id) {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            None => {
                                tracing::debug!(server = %name, id, "discarding unmatched response")
                            }
                        },
                        None => {
                            tracing::debug!(server = %name, "discarding response with non-numeric id")
                        }
                    },
                    Ok(Message::Notification(n)) => {
                        tracing::debug!(server = %name, method = %n.method, "server notification")
                    }
                    Ok(Message::Request(r)) => {
                        tracing::debug!(server = %name, method = %r.method, "ignoring server-initiated request")
                    }
                    Err(e) => {
                        tracing::debug!(server = %name, "skipping malformed message: {e}")
                    }
                }
            }
            // Wake anyone still waiting; their oneshot senders drop here.
            pending.lock().await.clear();
        });
        *self.reader.lock().unwrap() = Some(handle);
    }

    /// Mark disconnected, stop the reader, and close the transport.
    /// Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.state.write().unwrap().connected = false;
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        self.transport.close().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().unwrap().connected
    }

    pub fn tools(&self) -> Vec<McpToolInfo> {
        self.state.read().unwrap().tools.clone()
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Pluggable transport construction, so hosts and tests can wire their own.
pub type TransportFactoryFn =
    Arc<dyn Fn(&str, &ServerConfig) -> Result<Arc<dyn Transport>> + Send + Sync>;

#[derive(Clone)]
struct RegisteredTool {
    server: String,
    info: McpToolInfo,
}

#[derive(Default)]
struct Registry {
    servers: HashMap<String, Arc<ServerConnection>>,
    tools: HashMap<String, RegisteredTool>,
    initialized: bool,
}

/// Client-wide registry of MCP servers and the tools they expose.
pub struct McpClient {
    config: StdMutex<McpConfig>,
    registry: RwLock<Registry>,
    transport_factory: TransportFactoryFn,
    call_timeout: Duration,
    init_lock: TokioMutex<()>,
    /// Handed to tool handles so they can route back here without keeping
    /// the client alive.
    weak_self: Weak<McpClient>,
}

impl McpClient {
    pub fn new(config: McpConfig) -> Arc<Self> {
        Self::with_transport_factory(
            config,
            Arc::new(|name: &str, server_config: &ServerConfig| {
                TransportFactory::create(name, server_config)
            }),
        )
    }

    pub fn with_transport_factory(config: McpConfig, factory: TransportFactoryFn) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config: StdMutex::new(config),
            registry: RwLock::new(Registry::default()),
            transport_factory: factory,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            init_lock: TokioMutex::new(()),
            weak_self: weak.clone(),
        })
    }

    /// Discover configuration and connect every configured server.
    ///
    /// Single-shot and idempotent: later calls are no-ops. Missing config,
    /// unparsable config, and individual connect failures are all non-fatal;
    /// the client simply ends up with fewer (possibly zero) tools.
    pub async fn init(&self, working_dir: &Path) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.registry.read().unwrap().initialized {
            return Ok(());
        }

        if let Some(path) = config::find_config_file(working_dir) {
            match config::load_config(&path) {
                Ok(file_config) => self.config.lock().unwrap().merge(file_config),
                Err(e) => tracing::warn!("ignoring mcp config {}: {e}", path.display()),
            }
        }

        let servers: Vec<(String, ServerConfig)> = {
            let config = self.config.lock().unwrap();
            config
                .mcp_servers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let connects = servers.into_iter().map(|(name, server_config)| {
            let factory = Arc::clone(&self.transport_factory);
            let request_timeout = self.call_timeout;
            async move {
                let attempt = async {
                    let transport = factory(&name, &server_config)?;
                    transport.connect().await?;
                    ServerConnection::establish(&name, transport, request_timeout).await
                };
                let outcome = match tokio::time::timeout(INIT_TIMEOUT, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(GenieError::ServerUnreachable(format!(
                        "mcp server '{name}' timed out during initialization"
                    ))),
                };
                (name, outcome)
            }
        });
        let results = futures_util::future::join_all(connects).await;

        let mut registry = self.registry.write().unwrap();
        for (name, outcome) in results {
            match outcome {
                Ok(conn) => {
                    let tools = conn.tools();
                    tracing::info!(server = %name, tools = tools.len(), "mcp server connected");
                    for info in tools {
                        if let Some(previous) = registry.tools.get(&info.name) {
                            tracing::warn!(
                                tool = %info.name,
                                old = %previous.server,
                                new = %name,
                                "duplicate mcp tool name, latest registration wins"
                            );
                        }
                        registry.tools.insert(
                            info.name.clone(),
                            RegisteredTool {
                                server: name.clone(),
                                info,
                            },
                        );
                    }
                    registry.servers.insert(name, conn);
                }
                Err(e) => tracing::warn!(server = %name, "skipping mcp server: {e}"),
            }
        }
        registry.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.read().unwrap().initialized
    }

    /// All discovered tools, sorted by name.
    pub fn get_tools(&self) -> Vec<McpToolInfo> {
        let registry = self.registry.read().unwrap();
        let mut tools: Vec<McpToolInfo> =
            registry.tools.values().map(|t| t.info.clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Internal declarations for every discovered tool, for splicing into a
    /// prompt's function list.
    pub fn tool_declarations(&self) -> Vec<FunctionDeclaration> {
        self.get_tools()
            .iter()
            .map(schema::declaration_for)
            .collect()
    }

    /// Handlers that route each discovered tool back through this client.
    pub fn handlers(&self) -> HashMap<String, Handler> {
        self.get_tools()
            .into_iter()
            .map(|info| {
                let handle = McpToolHandle {
                    tool_name: info.name.clone(),
                    client: self.weak_self.clone(),
                };
                (info.name, handle.into_handler())
            })
            .collect()
    }

    /// Invoke a discovered tool on its owning server.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<CallToolResult> {
        let (conn, wire_name) = {
            let registry = self.registry.read().unwrap();
            let tool = registry.tools.get(name).ok_or_else(|| {
                GenieError::HandlerMissing(format!("tool not found: '{name}'"))
            })?;
            let conn = registry
                .servers
                .get(&tool.server)
                .ok_or_else(|| {
                    GenieError::ServerUnreachable(format!("server not found: '{}'", tool.server))
                })?
                .clone();
            (conn, tool.info.name.clone())
        };
        if !conn.is_connected() {
            return Err(GenieError::ServerUnreachable(format!(
                "server '{}' is not connected",
                conn.name()
            )));
        }

        // Some servers reject null arguments, so always send an object.
        let args = match args {
            Value::Null => Value::Object(serde_json::Map::new()),
            value @ Value::Object(_) => value,
            other => {
                return Err(GenieError::ToolArgsInvalid(format!(
                    "mcp tool arguments must be a JSON object, got: {other}"
                )));
            }
        };

        let result = conn
            .request("tools/call", Some(json!({"name": wire_name, "arguments": args})))
            .await?;
        serde_json::from_value(result).map_err(|e| {
            GenieError::Protocol(format!("invalid tools/call result from '{}': {e}", conn.name()))
        })
    }

    /// Close every connection. Idempotent; a second call is a no-op.
    pub async fn close(&self) -> Result<()> {
        let conns: Vec<Arc<ServerConnection>> = {
            let registry = self.registry.read().unwrap();
            registry.servers.values().cloned().collect()
        };
        for conn in conns {
            if let Err(e) = conn.shutdown().await {
                tracing::warn!(server = %conn.name(), "error closing mcp server: {e}");
            }
        }
        Ok(())
    }
}

// ── Tool handle ───────────────────────────────────────────────────────────────

/// Adapter exposing one MCP tool as an internal handler. Holds a non-owning
/// reference to the client, which exclusively owns connections and tools.
pub struct McpToolHandle {
    tool_name: String,
    client: Weak<McpClient>,
}

impl McpToolHandle {
    pub fn into_handler(self) -> Handler {
        let McpToolHandle { tool_name, client } = self;
        crate::prompt::handler(move |args: HandlerArgs| {
            let tool_name = tool_name.clone();
            let client = client.clone();
            async move {
                let client = client
                    .upgrade()
                    .ok_or_else(|| anyhow::anyhow!("mcp client was shut down"))?;
                let result = client.call_tool(&tool_name, Value::Object(args)).await?;
                match serde_json::to_value(&result)? {
                    Value::Object(map) => Ok(map),
                    other => Err(anyhow::anyhow!("unexpected tool result shape: {other}")),
                }
            }
        })
    }
}
