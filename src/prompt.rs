//! The prompt value object consumed by every provider adapter, the
//! function-declaration schema model, and the handler callback type.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::{GenieError, Result};

// ── Handlers ──────────────────────────────────────────────────────────────────

/// Arguments passed to a handler: the decoded JSON object the model emitted.
pub type HandlerArgs = serde_json::Map<String, Value>;

/// Handlers return a JSON object that is serialized into the next turn's
/// tool-result block. Errors abort the whole generation call.
pub type HandlerResult = anyhow::Result<HandlerArgs>;

/// A locally-registered callable implementing a tool the model may invoke.
pub type Handler = Arc<dyn Fn(HandlerArgs) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(HandlerArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |args| {
        let fut: BoxFuture<'static, HandlerResult> = Box::pin(f(args));
        fut
    })
}

// ── Schema model ──────────────────────────────────────────────────────────────

/// Closed JSON-schema subset shared by all providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    #[default]
    String,
    Number,
    Integer,
    Boolean,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

impl Schema {
    pub fn object(properties: BTreeMap<String, Schema>, required: Vec<String>) -> Self {
        Self {
            schema_type: SchemaType::Object,
            properties,
            required,
            ..Default::default()
        }
    }

    pub fn string(description: Option<&str>) -> Self {
        Self {
            schema_type: SchemaType::String,
            description: description.map(str::to_string),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Schema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Schema>,
}

// ── Images ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptImage {
    /// MIME type; blank means `image/png`.
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl PromptImage {
    pub fn media_type_or_default(&self) -> &str {
        if self.media_type.trim().is_empty() {
            "image/png"
        } else {
            &self.media_type
        }
    }
}

// ── Prompt ────────────────────────────────────────────────────────────────────

/// A fully rendered prompt handed to the multiplexer. The core consumes it
/// but does not own its construction.
#[derive(Clone, Default)]
pub struct Prompt {
    /// Used for debug artifacts and schema naming.
    pub name: String,
    /// System prompt text; may be empty.
    pub instruction: String,
    /// User turn text; may be empty if images are present.
    pub text: String,
    pub images: Vec<PromptImage>,
    /// Model override; empty means config, then adapter default.
    pub model_name: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// When set, the adapter instructs the model to emit matching JSON.
    pub response_schema: Option<Schema>,
    pub functions: Vec<FunctionDeclaration>,
    pub handlers: HashMap<String, Handler>,
    /// Case-insensitive provider name; empty means the default provider.
    pub llm_provider: String,
}

impl Prompt {
    /// Declarations with duplicate names removed, first occurrence wins.
    pub fn deduped_functions(&self) -> Vec<&FunctionDeclaration> {
        let mut seen = std::collections::HashSet::new();
        self.functions
            .iter()
            .filter(|f| seen.insert(f.name.as_str()))
            .collect()
    }

    pub fn add_handler(&mut self, name: &str, h: Handler) {
        self.handlers.insert(name.to_string(), h);
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prompt")
            .field("name", &self.name)
            .field("instruction", &self.instruction)
            .field("text", &self.text)
            .field("images", &self.images.len())
            .field("model_name", &self.model_name)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("functions", &self.functions.iter().map(|d| &d.name).collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("llm_provider", &self.llm_provider)
            .finish()
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

/// Prompt templating collaborator: resolves attribute placeholders in the
/// instruction and user text before generation.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, template: &str, attrs: &HashMap<String, String>) -> Result<String>;
}

/// Minimal `{{key}}` substitution renderer. Unknown placeholders are left
/// untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl PromptRenderer for TemplateRenderer {
    fn render(&self, template: &str, attrs: &HashMap<String, String>) -> Result<String> {
        let mut out = template.to_string();
        for (key, value) in attrs {
            if key.trim().is_empty() {
                return Err(GenieError::RenderFailure(
                    "attribute names must be non-empty".to_string(),
                ));
            }
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(name: &str) -> FunctionDeclaration {
        FunctionDeclaration {
            name: name.to_string(),
            description: None,
            parameters: Schema::object(BTreeMap::new(), vec![]),
            response: None,
        }
    }

    #[test]
    fn test_deduped_functions_first_wins() {
        let mut first = decl("get_weather");
        first.description = Some("the original".to_string());
        let mut dup = decl("get_weather");
        dup.description = Some("the impostor".to_string());
        let prompt = Prompt {
            functions: vec![first, decl("search"), dup],
            ..Default::default()
        };
        let deduped = prompt.deduped_functions();
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].name, "get_weather");
        assert_eq!(deduped[0].description.as_deref(), Some("the original"));
        assert_eq!(deduped[1].name, "search");
    }

    #[test]
    fn test_schema_serializes_as_json_schema() {
        let mut props = BTreeMap::new();
        props.insert("location".to_string(), Schema::string(Some("A city name")));
        let schema = Schema::object(props, vec!["location".to_string()]);
        let v = serde_json::to_value(&schema).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "object",
                "properties": {
                    "location": {"type": "string", "description": "A city name"}
                },
                "required": ["location"]
            })
        );
    }

    #[test]
    fn test_schema_roundtrip_with_items_and_enum() {
        let schema = Schema {
            schema_type: SchemaType::Array,
            items: Some(Box::new(Schema {
                schema_type: SchemaType::Integer,
                minimum: Some(0.0),
                maximum: Some(59.0),
                ..Default::default()
            })),
            ..Default::default()
        };
        let text = serde_json::to_string(&schema).unwrap();
        let back: Schema = serde_json::from_str(&text).unwrap();
        assert_eq!(back, schema);

        let with_enum = Schema {
            schema_type: SchemaType::String,
            enum_values: vec!["celsius".to_string(), "fahrenheit".to_string()],
            ..Default::default()
        };
        let v = serde_json::to_value(&with_enum).unwrap();
        assert_eq!(v["enum"], json!(["celsius", "fahrenheit"]));
    }

    #[test]
    fn test_image_media_type_default() {
        let img = PromptImage {
            media_type: String::new(),
            bytes: vec![1, 2, 3],
        };
        assert_eq!(img.media_type_or_default(), "image/png");
        let jpeg = PromptImage {
            media_type: "image/jpeg".to_string(),
            bytes: vec![],
        };
        assert_eq!(jpeg.media_type_or_default(), "image/jpeg");
    }

    #[test]
    fn test_template_renderer() {
        let renderer = TemplateRenderer;
        let attrs: HashMap<String, String> = [
            ("city".to_string(), "Lisbon".to_string()),
            ("unit".to_string(), "celsius".to_string()),
        ]
        .into();
        let out = renderer
            .render("Weather in {{city}} using {{unit}}, {{unknown}} left alone", &attrs)
            .unwrap();
        assert_eq!(out, "Weather in Lisbon using celsius, {{unknown}} left alone");
    }

    #[tokio::test]
    async fn test_handler_wrapper() {
        let h = handler(|args: HandlerArgs| async move {
            let mut out = HandlerArgs::new();
            out.insert("echo".to_string(), args["input"].clone());
            Ok(out)
        });
        let mut args = HandlerArgs::new();
        args.insert("input".to_string(), json!("ping"));
        let result = h(args).await.unwrap();
        assert_eq!(result["echo"], json!("ping"));
    }
}
