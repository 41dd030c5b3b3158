//! Translation from MCP tool descriptors (a loose JSON-schema dialect) to
//! the internal function-declaration model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::prompt::{FunctionDeclaration, Schema, SchemaType};

/// A tool as returned by `tools/list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: ToolSchema,
}

/// Top-level input schema of an MCP tool. Always an object in practice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type", default)]
    pub schema_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, ToolSchemaProperty>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaProperty {
    #[serde(rename = "type", default)]
    pub schema_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, ToolSchemaProperty>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ToolSchemaProperty>>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

/// Build an internal declaration for an MCP tool.
pub fn declaration_for(tool: &McpToolInfo) -> FunctionDeclaration {
    FunctionDeclaration {
        name: tool.name.clone(),
        description: if tool.description.is_empty() {
            None
        } else {
            Some(tool.description.clone())
        },
        parameters: translate_schema(&tool.input_schema),
        response: None,
    }
}

pub fn translate_schema(schema: &ToolSchema) -> Schema {
    Schema {
        schema_type: SchemaType::Object,
        properties: schema
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), translate_property(v)))
            .collect(),
        required: schema.required.clone(),
        ..Default::default()
    }
}

fn map_type(raw: &str) -> SchemaType {
    match raw {
        "object" => SchemaType::Object,
        "array" => SchemaType::Array,
        "number" => SchemaType::Number,
        "integer" => SchemaType::Integer,
        "boolean" => SchemaType::Boolean,
        // "string" and anything unrecognized.
        _ => SchemaType::String,
    }
}

fn translate_property(prop: &ToolSchemaProperty) -> Schema {
    let schema_type = map_type(&prop.schema_type);
    let mut out = Schema {
        schema_type,
        description: prop.description.clone(),
        enum_values: prop.enum_values.clone(),
        minimum: prop.minimum,
        maximum: prop.maximum,
        ..Default::default()
    };
    match schema_type {
        SchemaType::Array => {
            // Strict providers reject arrays without an item schema.
            out.items = Some(Box::new(match &prop.items {
                Some(items) => translate_property(items),
                None => Schema {
                    schema_type: SchemaType::String,
                    ..Default::default()
                },
            }));
        }
        SchemaType::Object => {
            out.properties = prop
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), translate_property(v)))
                .collect();
            out.required = prop.required.clone();
        }
        _ => {}
    }
    out
}
