//! Per-request routing context and result types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{Message, RouteRequest, SystemBlock, Tool};

/// Label reported when no rule decided the route
pub const DEFAULT_RULE_LABEL: &str = "default";

/// Everything conditions may look at for one routing call
///
/// Built once per call and never shared between calls.
#[derive(Debug, Clone)]
pub struct RouteContext<'a> {
    /// Pre-computed token count supplied by the caller
    pub token_count: u64,
    pub messages: Vec<Message>,
    pub system: Vec<SystemBlock>,
    pub tools: Vec<Tool>,
    pub session_id: Option<&'a str>,
    /// Usage reported for the previous turn, if the caller tracks it
    pub last_usage: Option<&'a Value>,
    pub event: Option<&'a Value>,
    /// The request the context was built from
    pub request: &'a RouteRequest,
}

impl<'a> RouteContext<'a> {
    /// Build a context from a request
    pub fn new(request: &'a RouteRequest, token_count: u64, last_usage: Option<&'a Value>) -> Self {
        Self {
            token_count,
            messages: request.messages(),
            system: request.system_blocks(),
            tools: request.tools(),
            session_id: request.session_id.as_deref(),
            last_usage,
            event: request.event.as_ref(),
            request,
        }
    }

    /// Requested model, if any
    pub fn model(&self) -> Option<&str> {
        self.request.model()
    }

    /// Text of the last user message
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(Message::text)
            .filter(|text| !text.is_empty())
    }
}

/// Outcome of evaluating one rule's condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionEvaluationResult {
    /// Rule the condition belongs to
    pub rule: String,
    pub matches: bool,
    /// Value the condition looked at
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub value: Value,
    pub evaluation_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request attributes echoed back in the result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub token_count: u64,
    pub has_tools: bool,
    /// The request's `thinking` value, `false` when absent
    pub thinking: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Diagnostics attached to a routing result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSummary>,
    /// One entry per rule evaluated, in evaluation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluations: Vec<ConditionEvaluationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when evaluation failed and the default route was returned
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

/// A routing decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    /// Final `provider,model` target
    pub route: String,
    /// Rule that decided the route, `"default"` when none did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    #[serde(default)]
    pub transformers: Vec<String>,
    pub decision_time_ms: f64,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub metadata: RouteMetadata,
}

impl RouteResult {
    /// Result returned when evaluation itself failed
    pub fn fallback(route: impl Into<String>, error: impl Into<String>, decision_time_ms: f64) -> Self {
        Self {
            route: route.into(),
            matched_rule: None,
            transformers: Vec::new(),
            decision_time_ms,
            from_cache: false,
            metadata: RouteMetadata {
                error: Some(error.into()),
                fallback: true,
                ..Default::default()
            },
        }
    }

    /// Whether this result is the top-level fallback
    pub fn is_fallback(&self) -> bool {
        self.metadata.fallback
    }
}
