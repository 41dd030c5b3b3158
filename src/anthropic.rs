//! Anthropic Messages API adapter — the canonical provider shape.
//!
//! Other adapters differ only in wire encoding; the tool-iteration loop
//! itself lives in [`crate::toolloop`] and is shared.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{ConfigManager, ModelConfig};
use crate::error::{GenieError, Result};
use crate::events::{Event, EventBus, NotificationEvent, TokenCountEvent, TOPIC_NOTIFICATION, TOPIC_TOKEN_COUNT};
use crate::prompt::{Prompt, PromptRenderer};
use crate::provider::{ProviderAdapter, ProviderStatus, TokenCount};
use crate::toolloop::{self, ToolCall, ToolResultBlock, Turn, TurnExecutor};

const BACKEND: &str = "anthropic";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const SCHEMA_PREAMBLE: &str = "You must respond with JSON matching this schema:";

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<SystemBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

impl SystemBlock {
    fn text(text: String) -> Self {
        Self { kind: "text", text }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct WireTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CountTokensResponse {
    input_tokens: u32,
}

// ── Request composition ───────────────────────────────────────────────────────

/// Everything derived from the prompt before the loop starts. The settings
/// are fixed across iterations; only `messages` grows.
#[derive(Debug, Clone)]
struct RequestParts {
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    top_p: Option<f32>,
    system: Vec<SystemBlock>,
    user: WireMessage,
    tools: Vec<WireTool>,
}

fn compose(prompt: &Prompt, model_config: &ModelConfig) -> Result<RequestParts> {
    let mut system = Vec::new();
    if !prompt.instruction.is_empty() {
        system.push(SystemBlock::text(prompt.instruction.clone()));
    }
    if let Some(schema) = &prompt.response_schema {
        let schema_json = serde_json::to_string_pretty(schema)
            .map_err(|e| GenieError::Protocol(format!("unencodable response schema: {e}")))?;
        system.push(SystemBlock::text(format!("{SCHEMA_PREAMBLE}\n{schema_json}")));
    }

    let text = prompt.text.trim();
    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::Text {
            text: text.to_string(),
        });
    }
    for image in &prompt.images {
        content.push(ContentBlock::Image {
            source: ImageSource {
                kind: "base64",
                media_type: image.media_type_or_default().to_string(),
                data: BASE64.encode(&image.bytes),
            },
        });
    }
    if content.is_empty() {
        // Some SDKs reject messages with no content at all.
        content.push(ContentBlock::Text {
            text: String::new(),
        });
    }

    let model = if !prompt.model_name.trim().is_empty() {
        prompt.model_name.clone()
    } else {
        model_config
            .model_name
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    };

    let tools = prompt
        .deduped_functions()
        .into_iter()
        .map(|decl| {
            Ok(WireTool {
                name: decl.name.clone(),
                description: decl.description.clone(),
                input_schema: serde_json::to_value(&decl.parameters).map_err(|e| {
                    GenieError::Protocol(format!("unencodable schema for '{}': {e}", decl.name))
                })?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RequestParts {
        model,
        max_tokens: prompt
            .max_tokens
            .or(model_config.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: prompt.temperature.or(model_config.temperature),
        top_p: prompt.top_p.or(model_config.top_p),
        system,
        user: WireMessage {
            role: "user",
            content,
        },
        tools,
    })
}

// ── Adapter ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ApiHandle {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    auth_token: Option<String>,
}

pub struct AnthropicAdapter {
    config: Arc<dyn ConfigManager>,
    bus: Arc<dyn EventBus>,
    renderer: Arc<dyn PromptRenderer>,
    state: Mutex<Option<ApiHandle>>,
}

impl AnthropicAdapter {
    pub fn new(
        config: Arc<dyn ConfigManager>,
        bus: Arc<dyn EventBus>,
        renderer: Arc<dyn PromptRenderer>,
    ) -> Self {
        Self {
            config,
            bus,
            renderer,
            state: Mutex::new(None),
        }
    }

    /// Lazy one-time API setup, cached for the process lifetime.
    fn handle(&self) -> Result<ApiHandle> {
        let mut guard = self.state.lock().unwrap();
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }
        let api_key = self.config.get_string("ANTHROPIC_API_KEY", "");
        if api_key.is_empty() {
            return Err(GenieError::ConfigurationMissing(
                "ANTHROPIC_API_KEY is not set; the anthropic provider is not configured"
                    .to_string(),
            ));
        }
        let base_url = self.config.get_string("ANTHROPIC_BASE_URL", DEFAULT_BASE_URL);
        let auth_token = self.config.get_string("ANTHROPIC_AUTH_TOKEN", "");
        let handle = ApiHandle {
            http: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: (!auth_token.is_empty()).then_some(auth_token),
        };
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Clone of the prompt with instruction and text run through the
    /// renderer.
    fn rendered(&self, prompt: &Prompt, attrs: &[(String, String)]) -> Result<Prompt> {
        let map: HashMap<String, String> = attrs.iter().cloned().collect();
        let mut rendered = prompt.clone();
        rendered.instruction = self.renderer.render(&prompt.instruction, &map)?;
        rendered.text = self.renderer.render(&prompt.text, &map)?;
        Ok(rendered)
    }

    fn turn_executor(&self, handle: ApiHandle, parts: &RequestParts, debug: bool, prompt_name: &str) -> AnthropicTurn {
        AnthropicTurn {
            handle,
            model: parts.model.clone(),
            max_tokens: parts.max_tokens,
            temperature: parts.temperature,
            top_p: parts.top_p,
            system: parts.system.clone(),
            tools: parts.tools.clone(),
            bus: Arc::clone(&self.bus),
            show_thinking: self.config.get_bool("ANTHROPIC_SHOW_THINKING", false),
            token_debug: self.config.get_bool("GENIE_TOKEN_DEBUG", false),
            debug,
            prompt_name: prompt_name.to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn generate_content(&self, prompt: &Prompt, debug: bool) -> Result<String> {
        let handle = self.handle()?;
        let parts = compose(prompt, &self.config.model_config())?;
        let executor = self.turn_executor(handle, &parts, debug, &prompt.name);
        toolloop::run(&executor, parts.user, &prompt.handlers, self.bus.as_ref()).await
    }

    async fn generate_content_attr(
        &self,
        prompt: &Prompt,
        debug: bool,
        attrs: &[(String, String)],
    ) -> Result<String> {
        let rendered = self.rendered(prompt, attrs)?;
        self.generate_content(&rendered, debug).await
    }

    async fn count_tokens(&self, prompt: &Prompt, debug: bool) -> Result<TokenCount> {
        let handle = self.handle()?;
        let parts = compose(prompt, &self.config.model_config())?;
        let request = json!({
            "model": parts.model,
            "messages": [parts.user],
            "system": parts.system,
            "tools": parts.tools,
        });
        if debug {
            tracing::debug!(prompt = %prompt.name, model = %parts.model, "anthropic count_tokens request");
        }
        let mut req = handle
            .http
            .post(format!("{}/v1/messages/count_tokens", handle.base_url))
            .header("x-api-key", &handle.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(token) = &handle.auth_token {
            req = req.bearer_auth(token);
        }
        let response = req.json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GenieError::Wire(format!(
                "anthropic API error {status}: {body}"
            )));
        }
        let counted: CountTokensResponse = serde_json::from_str(&body)
            .map_err(|e| GenieError::Protocol(format!("invalid count_tokens response: {e}")))?;
        Ok(TokenCount {
            input_tokens: counted.input_tokens,
            output_tokens: 0,
            total_tokens: counted.input_tokens,
        })
    }

    async fn count_tokens_attr(
        &self,
        prompt: &Prompt,
        debug: bool,
        attrs: &[(String, String)],
    ) -> Result<TokenCount> {
        let rendered = self.rendered(prompt, attrs)?;
        self.count_tokens(&rendered, debug).await
    }

    fn get_status(&self) -> ProviderStatus {
        let model_config = self.config.model_config();
        let model = model_config
            .model_name
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let temperature = model_config.temperature.unwrap_or(0.0);
        let max_tokens = model_config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let configured = !self.config.get_string("ANTHROPIC_API_KEY", "").is_empty();
        ProviderStatus {
            model: format!("{model}, Temperature: {temperature}, Max Tokens: {max_tokens}"),
            backend: BACKEND.to_string(),
            connected: configured,
            message: if configured {
                String::new()
            } else {
                "ANTHROPIC_API_KEY is not set".to_string()
            },
        }
    }
}

// ── Turn execution ────────────────────────────────────────────────────────────

struct AnthropicTurn {
    handle: ApiHandle,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    top_p: Option<f32>,
    system: Vec<SystemBlock>,
    tools: Vec<WireTool>,
    bus: Arc<dyn EventBus>,
    show_thinking: bool,
    token_debug: bool,
    debug: bool,
    prompt_name: String,
}

impl AnthropicTurn {
    /// Publish usage events and split the response into text, tool calls,
    /// and the assistant message replayed on the next iteration.
    fn digest(&self, response: MessagesResponse) -> Turn<WireMessage> {
        let usage = response.usage;
        self.bus.publish(
            TOPIC_TOKEN_COUNT,
            Event::TokenCount(TokenCountEvent {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_tokens: usage.input_tokens + usage.output_tokens,
            }),
        );
        if self.token_debug {
            self.bus.publish(
                TOPIC_NOTIFICATION,
                Event::Notification(NotificationEvent::text(format!(
                    "usage: input_tokens={} output_tokens={}",
                    usage.input_tokens, usage.output_tokens
                ))),
            );
        }

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut blocks = Vec::new();
        for block in response.content {
            match block {
                ResponseBlock::Text { text } => {
                    if !text.is_empty() {
                        text_parts.push(text.clone());
                    }
                    blocks.push(ContentBlock::Text { text });
                }
                ResponseBlock::Thinking { thinking } => {
                    if self.show_thinking && !thinking.is_empty() {
                        self.bus.publish(
                            TOPIC_NOTIFICATION,
                            Event::Notification(NotificationEvent::thought(thinking)),
                        );
                    }
                }
                ResponseBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: input.to_string(),
                    });
                    blocks.push(ContentBlock::ToolUse { id, name, input });
                }
                ResponseBlock::Unknown => {}
            }
        }
        if blocks.is_empty() {
            blocks.push(ContentBlock::Text {
                text: String::new(),
            });
        }

        Turn {
            message: WireMessage {
                role: "assistant",
                content: blocks,
            },
            text: text_parts.join("\n"),
            tool_calls,
        }
    }
}

#[async_trait]
impl TurnExecutor for AnthropicTurn {
    type Message = WireMessage;

    fn backend(&self) -> &str {
        BACKEND
    }

    async fn execute(&self, messages: &[WireMessage]) -> Result<Turn<WireMessage>> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: messages.to_vec(),
            system: self.system.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            tools: self.tools.clone(),
            tool_choice: (!self.tools.is_empty()).then(|| json!({"type": "auto"})),
        };
        if self.debug {
            tracing::debug!(
                prompt = %self.prompt_name,
                model = %request.model,
                "anthropic request: {}",
                serde_json::to_string(&request).unwrap_or_default()
            );
        }

        let mut req = self
            .handle
            .http
            .post(format!("{}/v1/messages", self.handle.base_url))
            .header("x-api-key", &self.handle.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(token) = &self.handle.auth_token {
            req = req.bearer_auth(token);
        }
        let response = req.json(&request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GenieError::Wire(format!(
                "anthropic API error {status}: {body}"
            )));
        }
        if self.debug {
            tracing::debug!(prompt = %self.prompt_name, "anthropic response: {body}");
        }
        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| GenieError::Protocol(format!("invalid anthropic response: {e}")))?;
        Ok(self.digest(parsed))
    }

    fn tool_results_message(&self, results: Vec<ToolResultBlock>) -> WireMessage {
        WireMessage {
            role: "user",
            content: results
                .into_iter()
                .map(|r| ContentBlock::ToolResult {
                    tool_use_id: r.tool_use_id,
                    content: r.content,
                })
                .collect(),
        }
    }
}
