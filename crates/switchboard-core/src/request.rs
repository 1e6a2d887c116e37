//! Request model consumed by the routing engine
//!
//! The routing engine never owns the wire format of an inbound completion
//! request. It keeps the raw JSON body (rules may address any field of it by
//! path) and offers lenient typed views of the parts it reasons about:
//! messages, system blocks, tools, the requested model and the thinking flag.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A completion request as seen by the router
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Raw request body (model, messages, system, tools, thinking, ...)
    #[serde(default)]
    pub body: Value,
    /// Session identifier assigned by the entry point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Event payload forwarded by the entry point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
    /// Request headers, available to external predicates
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl RouteRequest {
    /// Create a request from its JSON body
    pub fn new(body: Value) -> Self {
        Self {
            body,
            ..Default::default()
        }
    }

    /// Set the session ID
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the event payload
    pub fn with_event(mut self, event: Value) -> Self {
        self.event = Some(event);
        self
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Model string exactly as the caller supplied it
    pub fn model(&self) -> Option<&str> {
        self.body.get("model").and_then(Value::as_str)
    }

    /// Conversation messages; entries that do not look like messages are skipped
    pub fn messages(&self) -> Vec<Message> {
        self.body
            .get("messages")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// System prompt blocks
    ///
    /// Accepts both a plain string and an array of blocks; plain strings
    /// inside the array become text blocks.
    pub fn system_blocks(&self) -> Vec<SystemBlock> {
        match self.body.get("system") {
            Some(Value::String(text)) => vec![SystemBlock::text(text.clone())],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(text) => Some(SystemBlock::text(text.clone())),
                    Value::Object(_) => serde_json::from_value(item.clone()).ok(),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Tool declarations
    pub fn tools(&self) -> Vec<Tool> {
        self.body
            .get("tools")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the request declares at least one tool
    pub fn has_tools(&self) -> bool {
        self.body
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(|tools| !tools.is_empty())
    }

    /// Whether the request carries a (truthy) system prompt
    pub fn has_system(&self) -> bool {
        self.body.get("system").is_some_and(is_truthy)
    }

    /// The `thinking` flag or object, if present and not null
    pub fn thinking(&self) -> Option<&Value> {
        self.body.get("thinking").filter(|value| !value.is_null())
    }
}

/// A conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

impl Message {
    /// Concatenated text of the message
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|block| block.kind == "text")
                .filter_map(|block| block.text.as_deref())
                .collect(),
        }
    }
}

/// Message content: either plain text or a list of typed blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

/// One block of structured message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One system prompt block
///
/// Producers disagree on whether the text lives in `text` or `content`,
/// so both are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl SystemBlock {
    /// Create a plain text block
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: Some("text".to_string()),
            text: Some(text.into()),
            content: None,
        }
    }

    /// Text of the block, preferring `content` over `text`
    pub fn body(&self) -> &str {
        self.content
            .as_ref()
            .and_then(Value::as_str)
            .filter(|content| !content.is_empty())
            .or(self.text.as_deref())
            .unwrap_or_default()
    }
}

/// A declared tool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<ToolFunction>,
}

impl Tool {
    /// Name of the tool's function, if any
    pub fn function_name(&self) -> Option<&str> {
        self.function.as_ref().and_then(|f| f.name.as_deref())
    }
}

/// Function part of a tool declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Loose truthiness of a JSON value
///
/// `null`, `false`, `0`, `NaN` and `""` are false; everything else
/// (including empty arrays and objects) is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
