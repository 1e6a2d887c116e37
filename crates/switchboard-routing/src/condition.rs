//! Condition evaluation
//!
//! Each condition kind has fixed comparison semantics:
//!
//! | Kind | Compares | Default operator |
//! |---|---|---|
//! | `token_threshold` | token count vs `value` (`gt`, `lt`, `eq`) | `gt` |
//! | `model_contains` | requested model vs `value` (`contains`, `starts_with`, `eq`) | `contains` |
//! | `tool_exists` | tool type or function name vs `value` (`exists`, `eq`) | `exists` |
//! | `field_exists` | value at a dotted body path (`exists`, `contains`, `eq`) | `eq` |
//! | `custom` | named built-in predicate | - |
//! | `external_function` | predicate from a [`ModuleLoader`](crate::ModuleLoader) | - |
//!
//! Failures inside one condition are reported on its evaluation result and
//! the rule counts as non-matching. Only an unsupported condition kind
//! escapes as an error.

use crate::context::{ConditionEvaluationResult, RouteContext};
use crate::external::ExternalEvaluator;
use crate::rule::{Operator, RouteCondition, RouteRule};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use switchboard_core::{Error, ROUTE_SEPARATOR, Result};

/// Built-in: the model names an explicit `provider,model` pair
pub const MODEL_CONTAINS_COMMA: &str = "modelContainsComma";

/// Built-in: the model is a bare code usable for direct mapping
pub const DIRECT_MODEL_MAPPING: &str = "directModelMapping";

/// A named predicate usable from `custom` conditions
pub type CustomPredicate = Arc<dyn Fn(&RouteContext<'_>) -> bool + Send + Sync>;

/// Registry of custom predicates
#[derive(Clone, Default)]
pub struct CustomPredicates {
    functions: Arc<DashMap<String, CustomPredicate>>,
}

impl CustomPredicates {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in predicates
    pub fn with_builtins() -> Self {
        let predicates = Self::new();
        predicates.register(MODEL_CONTAINS_COMMA, |context| {
            context
                .model()
                .is_some_and(|model| model.contains(ROUTE_SEPARATOR))
        });
        // An empty model string still counts as a bare code
        predicates.register(DIRECT_MODEL_MAPPING, |context| {
            context
                .model()
                .is_some_and(|model| !model.contains(ROUTE_SEPARATOR))
        });
        predicates
    }

    /// Register (or replace) a predicate
    pub fn register<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&RouteContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(predicate));
    }

    pub fn get(&self, name: &str) -> Option<CustomPredicate> {
        self.functions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for CustomPredicates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomPredicates")
            .field("names", &self.names())
            .finish()
    }
}

/// Evaluates rule conditions against a [`RouteContext`]
#[derive(Clone)]
pub struct ConditionEvaluator {
    custom: CustomPredicates,
    external: ExternalEvaluator,
}

impl ConditionEvaluator {
    pub fn new(custom: CustomPredicates, external: ExternalEvaluator) -> Self {
        Self { custom, external }
    }

    pub fn custom(&self) -> &CustomPredicates {
        &self.custom
    }

    /// Evaluate one rule's condition
    ///
    /// Returns `Err` only for condition kinds this evaluator cannot run.
    pub async fn evaluate(
        &self,
        rule: &RouteRule,
        context: &RouteContext<'_>,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<ConditionEvaluationResult> {
        let started = Instant::now();
        let outcome = self.check(&rule.condition, context, deadline).await;
        let evaluation_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok((matches, value)) => Ok(ConditionEvaluationResult {
                rule: rule.name.clone(),
                matches,
                value,
                evaluation_time_ms,
                error: None,
            }),
            Err(Error::UnsupportedCondition(kind)) => Err(Error::UnsupportedCondition(format!(
                "{} (rule {})",
                kind, rule.name
            ))),
            Err(e) => {
                tracing::error!(rule = %rule.name, error = %e, "Condition evaluation failed");
                Ok(ConditionEvaluationResult {
                    rule: rule.name.clone(),
                    matches: false,
                    value: Value::Null,
                    evaluation_time_ms,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    async fn check(
        &self,
        condition: &RouteCondition,
        context: &RouteContext<'_>,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<(bool, Value)> {
        match condition {
            RouteCondition::TokenThreshold { value, operator } => {
                let actual = context.token_count as f64;
                let matches = compare_numbers(actual, *value, operator.unwrap_or(Operator::Gt));
                Ok((matches, Value::from(context.token_count)))
            }

            RouteCondition::ModelContains { value, operator } => {
                let actual = context.model().unwrap_or_default();
                let matches = compare_strings(actual, value, operator.unwrap_or(Operator::Contains));
                Ok((matches, Value::from(actual)))
            }

            RouteCondition::ToolExists { value, operator } => {
                let found = context.tools.iter().any(|tool| {
                    tool.kind.as_deref().is_some_and(|kind| kind.contains(value.as_str()))
                        || tool.function_name().is_some_and(|name| name.contains(value.as_str()))
                });
                let matches = match operator.unwrap_or(Operator::Exists) {
                    Operator::Exists => found,
                    Operator::Eq => context.tools.iter().any(|tool| {
                        tool.kind.as_deref() == Some(value.as_str())
                            || tool.function_name() == Some(value.as_str())
                    }),
                    _ => false,
                };
                Ok((matches, Value::Bool(found)))
            }

            RouteCondition::FieldExists {
                field,
                value,
                operator,
            } => {
                let actual = lookup_field(&context.request.body, field);
                let present = actual.is_some_and(|v| !v.is_null());
                let matches = match operator.unwrap_or(Operator::Eq) {
                    Operator::Exists => present,
                    Operator::Contains => match (actual, value) {
                        (Some(actual), Some(expected)) if present => {
                            loose_string(actual).contains(&loose_string(expected))
                        }
                        _ => false,
                    },
                    Operator::Eq => actual == value.as_ref(),
                    _ => false,
                };
                Ok((matches, actual.cloned().unwrap_or(Value::Null)))
            }

            RouteCondition::Custom { custom_function } => match self.custom.get(custom_function) {
                Some(predicate) => {
                    let matches = predicate(context);
                    Ok((matches, Value::Bool(matches)))
                }
                None => {
                    tracing::warn!(function = %custom_function, "Unknown custom condition function");
                    Ok((false, Value::Bool(false)))
                }
            },

            RouteCondition::ExternalFunction { external_function } => {
                let matches = self
                    .external
                    .evaluate(external_function, context, condition, deadline)
                    .await?;
                Ok((matches, Value::Bool(matches)))
            }

            RouteCondition::Unsupported => {
                Err(Error::UnsupportedCondition("unknown condition type".to_string()))
            }
        }
    }
}

fn compare_numbers(actual: f64, expected: f64, operator: Operator) -> bool {
    match operator {
        Operator::Gt => actual > expected,
        Operator::Lt => actual < expected,
        Operator::Eq => actual == expected,
        _ => false,
    }
}

fn compare_strings(actual: &str, expected: &str, operator: Operator) -> bool {
    match operator {
        Operator::Contains => actual.contains(expected),
        Operator::StartsWith => actual.starts_with(expected),
        Operator::Eq => actual == expected,
        _ => false,
    }
}

/// Resolve a dot-separated path into a JSON document
///
/// Numeric segments index into arrays. A final `text` segment below the root
/// reads the block's `content` when that is set and falls back to `text`;
/// system blocks carry their text under either name.
pub fn lookup_field<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;

    for (index, segment) in segments.iter().enumerate() {
        if !(current.is_object() || current.is_array()) {
            return None;
        }

        let node = current;
        let is_last = index + 1 == segments.len();
        current = if is_last && *segment == "text" && !std::ptr::eq(node, root) {
            node.get("content")
                .filter(|content| switchboard_core::is_truthy(content))
                .or_else(move || node.get("text"))?
        } else {
            match node {
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i))?,
                _ => node.get(*segment)?,
            }
        };
    }

    Some(current)
}

/// String form used for substring checks
fn loose_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(loose_string).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}
