//! Routing rules
//!
//! A rule pairs a [`RouteCondition`] with a [`RouteAction`]. Rules are
//! evaluated in descending priority order and the first match wins.
//!
//! Rules deserialize from both snake_case and the camelCase spelling used by
//! older configuration files:
//!
//! ```rust
//! use switchboard_routing::{RouteCondition, RouteRule};
//!
//! let rule: RouteRule = serde_json::from_str(r#"{
//!     "name": "longContext",
//!     "priority": 100,
//!     "condition": { "type": "tokenThreshold", "value": 60000, "operator": "gt" },
//!     "action": { "route": "gemini,gemini-2.5-pro" }
//! }"#).unwrap();
//!
//! assert!(rule.enabled);
//! assert!(matches!(rule.condition, RouteCondition::TokenThreshold { .. }));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Comparison operator used by conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Lt,
    Eq,
    Contains,
    #[serde(alias = "startsWith")]
    StartsWith,
    Exists,
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Eq => "eq",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::Exists => "exists",
        };
        f.write_str(name)
    }
}

/// Reference to a predicate exported by an external module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalFunctionRef {
    /// Module path as registered with the module loader
    pub path: String,
    /// Preferred export name
    #[serde(default, alias = "functionName", skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
}

/// Condition that decides whether a rule matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteCondition {
    /// Compare the request's token count with a threshold (default `gt`)
    #[serde(alias = "tokenThreshold")]
    TokenThreshold {
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator: Option<Operator>,
    },

    /// Compare the requested model string (default `contains`)
    #[serde(alias = "modelContains")]
    ModelContains {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator: Option<Operator>,
    },

    /// Check for a tool whose type or function name includes `value` (default `exists`)
    #[serde(alias = "toolExists")]
    ToolExists {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator: Option<Operator>,
    },

    /// Inspect a dot-separated path into the request body (default `eq`)
    #[serde(alias = "fieldExists")]
    FieldExists {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator: Option<Operator>,
    },

    /// Named built-in predicate
    Custom {
        #[serde(alias = "customFunction")]
        custom_function: String,
    },

    /// Predicate exported by an external module
    #[serde(alias = "externalFunction")]
    ExternalFunction {
        #[serde(alias = "externalFunction")]
        external_function: ExternalFunctionRef,
    },

    /// Any condition type this router does not know
    #[serde(other)]
    Unsupported,
}

impl RouteCondition {
    /// Token count greater than `threshold`
    pub fn tokens_above(threshold: f64) -> Self {
        RouteCondition::TokenThreshold {
            value: threshold,
            operator: Some(Operator::Gt),
        }
    }

    /// Requested model contains `needle`
    pub fn model_contains(needle: impl Into<String>) -> Self {
        RouteCondition::ModelContains {
            value: needle.into(),
            operator: Some(Operator::Contains),
        }
    }

    /// Named built-in predicate
    pub fn custom(name: impl Into<String>) -> Self {
        RouteCondition::Custom {
            custom_function: name.into(),
        }
    }

    /// Short human readable description used in debug traces
    pub fn describe(&self) -> String {
        match self {
            RouteCondition::TokenThreshold { value, operator } => {
                format!("tokens {} {}", operator.unwrap_or(Operator::Gt), value)
            }
            RouteCondition::ModelContains { value, operator } => {
                format!("model {} {:?}", operator.unwrap_or(Operator::Contains), value)
            }
            RouteCondition::ToolExists { value, .. } => format!("tool {value:?} exists"),
            RouteCondition::FieldExists { field, .. } => format!("field {field:?} exists"),
            RouteCondition::Custom { custom_function } => format!("custom {custom_function}"),
            RouteCondition::ExternalFunction { external_function } => {
                format!("external {}", external_function.path)
            }
            RouteCondition::Unsupported => "unsupported condition".to_string(),
        }
    }
}

/// What to do when a rule matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteAction {
    /// Route template, may contain `${userModel}`, `${subagent}` or `${mappedModel}`
    pub route: String,
    /// Post-processing transformer names
    #[serde(default)]
    pub transformers: Vec<String>,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RouteAction {
    /// Action routing to `route` with no transformers
    pub fn to(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            transformers: Vec::new(),
            metadata: Map::new(),
            description: None,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

fn default_enabled() -> bool {
    true
}

/// A named, prioritised condition/action pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Unique name
    pub name: String,
    /// Higher priorities are evaluated first
    #[serde(default)]
    pub priority: i32,
    /// Disabled rules are skipped
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: RouteCondition,
    pub action: RouteAction,
}

impl RouteRule {
    /// Create an enabled rule with priority 0
    pub fn new(name: impl Into<String>, condition: RouteCondition, action: RouteAction) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            enabled: true,
            condition,
            action,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the enabled flag
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_camel_case_condition_aliases() {
        let condition: RouteCondition = serde_json::from_value(json!({
            "type": "fieldExists",
            "field": "system.1.text",
            "operator": "contains",
            "value": "<CCR-SUBAGENT-MODEL>"
        }))
        .unwrap();

        assert_eq!(
            condition,
            RouteCondition::FieldExists {
                field: "system.1.text".to_string(),
                value: Some(json!("<CCR-SUBAGENT-MODEL>")),
                operator: Some(Operator::Contains),
            }
        );

        let condition: RouteCondition =
            serde_json::from_value(json!({"type": "custom", "customFunction": "modelContainsComma"}))
                .unwrap();
        assert_eq!(condition, RouteCondition::custom("modelContainsComma"));
    }

    #[test]
    fn test_external_function_aliases() {
        let condition: RouteCondition = serde_json::from_value(json!({
            "type": "externalFunction",
            "externalFunction": {"path": "./user-check.js", "functionName": "checkUserType"}
        }))
        .unwrap();

        let RouteCondition::ExternalFunction { external_function } = condition else {
            panic!("expected external function condition");
        };
        assert_eq!(external_function.path, "./user-check.js");
        assert_eq!(external_function.function_name.as_deref(), Some("checkUserType"));
    }

    #[test]
    fn test_starts_with_operator_spellings() {
        let a: Operator = serde_json::from_value(json!("startsWith")).unwrap();
        let b: Operator = serde_json::from_value(json!("starts_with")).unwrap();
        assert_eq!(a, Operator::StartsWith);
        assert_eq!(b, Operator::StartsWith);
    }

    #[test]
    fn test_unknown_condition_type_is_unsupported() {
        let condition: RouteCondition =
            serde_json::from_value(json!({"type": "moonPhase", "value": "full"})).unwrap();
        assert_eq!(condition, RouteCondition::Unsupported);
    }

    #[test]
    fn test_rule_defaults() {
        let rule: RouteRule = serde_json::from_value(json!({
            "name": "r",
            "condition": {"type": "custom", "custom_function": "x"},
            "action": {"route": "a,b"}
        }))
        .unwrap();

        assert_eq!(rule.priority, 0);
        assert!(rule.enabled);
        assert!(rule.action.transformers.is_empty());
    }

    #[test]
    fn test_rule_from_yaml() {
        let yaml = r#"
name: background
priority: 80
condition:
  type: model_contains
  value: haiku
action:
  route: ollama,qwen2.5-coder
  transformers: [tooluse]
"#;
        let rule: RouteRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.priority, 80);
        assert_eq!(rule.action.transformers, vec!["tooluse".to_string()]);
        assert_eq!(rule.condition.describe(), "model contains \"haiku\"");
    }
}
