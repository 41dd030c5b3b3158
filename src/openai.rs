//! OpenAI-compatible chat-completions adapter.
//!
//! One adapter covers the `openai`, `ollama`, and `lmstudio` backends; they
//! share the wire dialect and differ only in endpoint and credential
//! defaults. Responses are consumed as complete turns.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{ConfigManager, ModelConfig};
use crate::error::{GenieError, Result};
use crate::events::{Event, EventBus, TokenCountEvent, TOPIC_TOKEN_COUNT};
use crate::prompt::{Prompt, PromptRenderer};
use crate::provider::{ProviderAdapter, ProviderStatus, TokenCount};
use crate::toolloop::{self, ToolCall, ToolResultBlock, Turn, TurnExecutor};

const SCHEMA_PREAMBLE: &str = "You must respond with JSON matching this schema:";

/// Which OpenAI-compatible service this adapter instance talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    OpenAi,
    Ollama,
    LmStudio,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::OpenAi => "openai",
            Backend::Ollama => "ollama",
            Backend::LmStudio => "lmstudio",
        }
    }

    fn key_var(self) -> &'static str {
        match self {
            Backend::OpenAi => "OPENAI_API_KEY",
            Backend::Ollama => "OLLAMA_API_KEY",
            Backend::LmStudio => "LMSTUDIO_API_KEY",
        }
    }

    fn url_var(self) -> &'static str {
        match self {
            Backend::OpenAi => "OPENAI_BASE_URL",
            Backend::Ollama => "OLLAMA_BASE_URL",
            Backend::LmStudio => "LMSTUDIO_BASE_URL",
        }
    }

    fn default_url(self) -> &'static str {
        match self {
            Backend::OpenAi => "https://api.openai.com/v1",
            Backend::Ollama => "http://localhost:11434/v1",
            Backend::LmStudio => "http://localhost:1234/v1",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Backend::OpenAi => "gpt-4o",
            Backend::Ollama | Backend::LmStudio => "qwen3:14b",
        }
    }

    /// Only the hosted service insists on credentials; local servers accept
    /// anonymous requests.
    fn requires_key(self) -> bool {
        matches!(self, Backend::OpenAi)
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Build the messages array for the API. Tool results are flattened into
/// individual `role: "tool"` messages, which is how this dialect expects
/// them; assistant messages that triggered tool calls carry the
/// `tool_calls` array.
fn build_messages(system: &str, messages: &[ChatMessage]) -> Vec<Value> {
    let mut out = Vec::new();

    if !system.is_empty() {
        out.push(json!({
            "role": "system",
            "content": system
        }));
    }

    for msg in messages {
        match &msg.content {
            MessageContent::Text(text) => {
                if !msg.tool_calls.is_empty() {
                    let tc_json: Vec<Value> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": {
                                    "name": tc.name,
                                    "arguments": tc.arguments
                                }
                            })
                        })
                        .collect();
                    out.push(json!({
                        "role": msg.role,
                        "content": text,
                        "tool_calls": tc_json
                    }));
                } else {
                    out.push(json!({
                        "role": msg.role,
                        "content": text
                    }));
                }
            }
            MessageContent::Parts(parts) => {
                // Tool results become individual messages; image parts ride
                // along inside a single multi-part message.
                let mut inline: Vec<Value> = Vec::new();
                for part in parts {
                    match part {
                        ContentPart::ToolResult {
                            tool_use_id,
                            content,
                        } => {
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content
                            }));
                        }
                        ContentPart::Text { text } => {
                            inline.push(json!({"type": "text", "text": text}));
                        }
                        ContentPart::ImageUrl { image_url } => {
                            inline.push(json!({
                                "type": "image_url",
                                "image_url": {"url": image_url.url}
                            }));
                        }
                    }
                }
                if !inline.is_empty() {
                    out.push(json!({
                        "role": msg.role,
                        "content": inline
                    }));
                }
            }
        }
    }

    out
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: UsageStats,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: String,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct UsageStats {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

// ── Request composition ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RequestParts {
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    system: String,
    user: ChatMessage,
    tools: Vec<Value>,
}

fn compose(prompt: &Prompt, model_config: &ModelConfig, backend: Backend) -> Result<RequestParts> {
    let mut system = prompt.instruction.clone();
    if let Some(schema) = &prompt.response_schema {
        let schema_json = serde_json::to_string_pretty(schema)
            .map_err(|e| GenieError::Protocol(format!("unencodable response schema: {e}")))?;
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&format!("{SCHEMA_PREAMBLE}\n{schema_json}"));
    }

    let text = prompt.text.trim();
    let user = if prompt.images.is_empty() {
        ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Text(text.to_string()),
            tool_calls: vec![],
        }
    } else {
        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text {
                text: text.to_string(),
            });
        }
        for image in &prompt.images {
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!(
                        "data:{};base64,{}",
                        image.media_type_or_default(),
                        BASE64.encode(&image.bytes)
                    ),
                },
            });
        }
        ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Parts(parts),
            tool_calls: vec![],
        }
    };

    let model = if !prompt.model_name.trim().is_empty() {
        prompt.model_name.clone()
    } else {
        model_config
            .model_name
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| backend.default_model().to_string())
    };

    let tools = prompt
        .deduped_functions()
        .into_iter()
        .map(|decl| {
            Ok(json!({
                "type": "function",
                "function": {
                    "name": decl.name,
                    "description": decl.description.clone().unwrap_or_default(),
                    "parameters": serde_json::to_value(&decl.parameters).map_err(|e| {
                        GenieError::Protocol(format!(
                            "unencodable schema for '{}': {e}",
                            decl.name
                        ))
                    })?,
                }
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RequestParts {
        model,
        max_tokens: prompt.max_tokens.or(model_config.max_tokens),
        temperature: prompt.temperature.or(model_config.temperature),
        top_p: prompt.top_p.or(model_config.top_p),
        system,
        user,
        tools,
    })
}

/// Rough token estimate for endpoints without a counting API: one token per
/// four characters of the serialized request.
fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

// ── Adapter ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct ApiHandle {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

pub struct OpenAiAdapter {
    backend: Backend,
    config: Arc<dyn ConfigManager>,
    bus: Arc<dyn EventBus>,
    renderer: Arc<dyn PromptRenderer>,
    state: Mutex<Option<ApiHandle>>,
}

impl OpenAiAdapter {
    pub fn new(
        backend: Backend,
        config: Arc<dyn ConfigManager>,
        bus: Arc<dyn EventBus>,
        renderer: Arc<dyn PromptRenderer>,
    ) -> Self {
        Self {
            backend,
            config,
            bus,
            renderer,
            state: Mutex::new(None),
        }
    }

    fn handle(&self) -> Result<ApiHandle> {
        let mut guard = self.state.lock().unwrap();
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }
        let api_key = self.config.get_string(self.backend.key_var(), "");
        if api_key.is_empty() && self.backend.requires_key() {
            return Err(GenieError::ConfigurationMissing(format!(
                "{} is not set; the {} provider is not configured",
                self.backend.key_var(),
                self.backend.name()
            )));
        }
        let base_url = self
            .config
            .get_string(self.backend.url_var(), self.backend.default_url());
        let handle = ApiHandle {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: (!api_key.is_empty()).then_some(api_key),
        };
        *guard = Some(handle.clone());
        Ok(handle)
    }

    fn rendered(&self, prompt: &Prompt, attrs: &[(String, String)]) -> Result<Prompt> {
        let map: HashMap<String, String> = attrs.iter().cloned().collect();
        let mut rendered = prompt.clone();
        rendered.instruction = self.renderer.render(&prompt.instruction, &map)?;
        rendered.text = self.renderer.render(&prompt.text, &map)?;
        Ok(rendered)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn generate_content(&self, prompt: &Prompt, debug: bool) -> Result<String> {
        let handle = self.handle()?;
        let parts = compose(prompt, &self.config.model_config(), self.backend)?;
        let executor = OpenAiTurn {
            handle,
            backend: self.backend,
            model: parts.model.clone(),
            max_tokens: parts.max_tokens,
            temperature: parts.temperature,
            top_p: parts.top_p,
            system: parts.system.clone(),
            tools: parts.tools.clone(),
            bus: Arc::clone(&self.bus),
            debug,
            prompt_name: prompt.name.clone(),
        };
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

    async fn count_tokens(&self, prompt: &Prompt, _debug: bool) -> Result<TokenCount> {
        // No counting endpoint in this dialect; estimate from the request
        // the generate path would send.
        let parts = compose(prompt, &self.config.model_config(), self.backend)?;
        let rendered = json!({
            "model": parts.model,
            "messages": build_messages(&parts.system, std::slice::from_ref(&parts.user)),
            "tools": parts.tools,
        })
        .to_string();
        let estimate = estimate_tokens(&rendered);
        Ok(TokenCount {
            input_tokens: estimate,
            output_tokens: 0,
            total_tokens: estimate,
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
            .unwrap_or_else(|| self.backend.default_model().to_string());
        let temperature = model_config.temperature.unwrap_or(0.0);
        let max_tokens = model_config.max_tokens.unwrap_or(0);
        let configured = !self.backend.requires_key()
            || !self.config.get_string(self.backend.key_var(), "").is_empty();
        ProviderStatus {
            model: format!("{model}, Temperature: {temperature}, Max Tokens: {max_tokens}"),
            backend: self.backend.name().to_string(),
            connected: configured,
            message: if configured {
                String::new()
            } else {
                format!("{} is not set", self.backend.key_var())
            },
        }
    }
}

// ── Turn execution ────────────────────────────────────────────────────────────

struct OpenAiTurn {
    handle: ApiHandle,
    backend: Backend,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    system: String,
    tools: Vec<Value>,
    bus: Arc<dyn EventBus>,
    debug: bool,
    prompt_name: String,
}

#[async_trait]
impl TurnExecutor for OpenAiTurn {
    type Message = ChatMessage;

    fn backend(&self) -> &str {
        self.backend.name()
    }

    async fn execute(&self, messages: &[ChatMessage]) -> Result<Turn<ChatMessage>> {
        let mut body = json!({
            "model": self.model,
            "messages": build_messages(&self.system, messages),
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = self.top_p {
            body["top_p"] = json!(top_p);
        }
        if !self.tools.is_empty() {
            body["tools"] = json!(self.tools);
            body["tool_choice"] = json!("auto");
        }
        if self.debug {
            tracing::debug!(prompt = %self.prompt_name, model = %self.model, "request: {body}");
        }

        let mut req = self
            .handle
            .http
            .post(format!("{}/chat/completions", self.handle.base_url))
            .header("Content-Type", "application/json");
        if let Some(key) = &self.handle.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.json(&body).send().await?;
        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            return Err(GenieError::Wire(format!(
                "{} API error {status}: {raw}",
                self.backend.name()
            )));
        }
        let parsed: ChatResponse = serde_json::from_str(&raw).map_err(|e| {
            GenieError::Protocol(format!("invalid {} response: {e}", self.backend.name()))
        })?;

        self.bus.publish(
            TOPIC_TOKEN_COUNT,
            Event::TokenCount(TokenCountEvent {
                input_tokens: parsed.usage.prompt_tokens,
                output_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.prompt_tokens + parsed.usage.completion_tokens,
            }),
        );

        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| {
                GenieError::Protocol(format!("{} response had no choices", self.backend.name()))
            })?;

        let text = message.content.unwrap_or_default();
        let tool_calls: Vec<ToolCall> = message
            .tool_calls
            .iter()
            .map(|tc| ToolCall {
                id: tc.id.clone(),
                name: tc.function.name.clone(),
                arguments: tc.function.arguments.clone(),
            })
            .collect();

        Ok(Turn {
            message: ChatMessage {
                role: "assistant".to_string(),
                content: MessageContent::Text(text.clone()),
                tool_calls: message
                    .tool_calls
                    .into_iter()
                    .map(|tc| WireToolCall {
                        id: tc.id,
                        name: tc.function.name,
                        arguments: tc.function.arguments,
                    })
                    .collect(),
            },
            text,
            tool_calls,
        })
    }

    fn tool_results_message(&self, results: Vec<ToolResultBlock>) -> ChatMessage {
        ChatMessage {
            role: "tool".to_string(),
            content: MessageContent::Parts(
                results
                    .into_iter()
                    .map(|r| ContentPart::ToolResult {
                        tool_use_id: r.tool_use_id,
                        content: r.content,
                    })
                    .collect(),
            ),
            tool_calls: vec![],
        }
    }
}
