//! Legacy router configuration
//!
//! Older configurations describe routing with a handful of fixed slots
//! (`default`, `background`, `think`, `longContext`, `webSearch`) instead of
//! rules. [`migrate_legacy_config`] turns such a section into an equivalent
//! rule table:
//!
//! | rule | priority | condition |
//! |---|---|---|
//! | `longContext` | 100 | token count above `long_context_threshold` |
//! | `subagent` | 90 | second system block carries the subagent marker |
//! | `background` | 80 | model contains `haiku` |
//! | `webSearch` | 70 | a `web_search` tool is present |
//! | `thinking` | 60 | request has `thinking` |
//! | `directMapping` | 50 | bare model or provider code |
//! | `userSpecified` | 40 | explicit `provider,model` |
//!
//! Rules whose slot is empty are left out; `subagent`, `directMapping` and
//! `userSpecified` are always present.

use crate::condition::{DIRECT_MODEL_MAPPING, MODEL_CONTAINS_COMMA};
use crate::config::{CacheConfig, RouterConfig};
use crate::rule::{Operator, RouteAction, RouteCondition, RouteRule};
use crate::variables::{DEFAULT_SUBAGENT_TAG, MAPPED_MODEL, SUBAGENT, USER_MODEL};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LONG_CONTEXT_RULE: &str = "longContext";
pub const SUBAGENT_RULE: &str = "subagent";
pub const BACKGROUND_RULE: &str = "background";
pub const WEB_SEARCH_RULE: &str = "webSearch";
pub const THINKING_RULE: &str = "thinking";
pub const DIRECT_MAPPING_RULE: &str = "directMapping";
pub const USER_SPECIFIED_RULE: &str = "userSpecified";

/// Threshold used when the legacy config does not set one
pub const DEFAULT_LONG_CONTEXT_THRESHOLD: u64 = 60_000;

/// Slot-based router configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyRouterConfig {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub think: Option<String>,
    #[serde(default, alias = "longContext")]
    pub long_context: Option<String>,
    #[serde(default, alias = "longContextThreshold")]
    pub long_context_threshold: Option<u64>,
    #[serde(default, alias = "webSearch")]
    pub web_search: Option<String>,
}

const LEGACY_KEYS: &[&str] = &[
    "default",
    "background",
    "think",
    "long_context",
    "longContext",
    "web_search",
    "webSearch",
];

/// Whether a raw router section uses the slot-based layout
///
/// A section is legacy when it has no rules and no default route but sets at
/// least one of the legacy slots.
pub fn is_legacy_router(section: &Value) -> bool {
    let Some(object) = section.as_object() else {
        return false;
    };
    if ["rules", "default_route", "defaultRoute"]
        .iter()
        .any(|key| object.contains_key(*key))
    {
        return false;
    }

    LEGACY_KEYS.iter().any(|key| {
        object
            .get(*key)
            .and_then(Value::as_str)
            .is_some_and(|slot| !slot.is_empty())
    })
}

fn slot(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|route| !route.is_empty())
}

/// Convert a slot-based configuration into a rule-based one
pub fn migrate_legacy_config(legacy: &LegacyRouterConfig) -> RouterConfig {
    let mut rules = Vec::new();

    if let Some(route) = slot(&legacy.long_context) {
        let threshold = legacy
            .long_context_threshold
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_LONG_CONTEXT_THRESHOLD);
        rules.push(
            RouteRule::new(
                LONG_CONTEXT_RULE,
                RouteCondition::tokens_above(threshold as f64),
                RouteAction::to(route).with_description("Long context: pick a model by token threshold"),
            )
            .with_priority(100),
        );
    }

    rules.push(
        RouteRule::new(
            SUBAGENT_RULE,
            RouteCondition::FieldExists {
                field: "system.1.text".to_string(),
                value: Some(Value::String(format!("<{DEFAULT_SUBAGENT_TAG}>"))),
                operator: Some(Operator::Contains),
            },
            RouteAction::to(SUBAGENT).with_description("Subagent: model chosen by an embedded marker"),
        )
        .with_priority(90),
    );

    if let Some(route) = slot(&legacy.background) {
        rules.push(
            RouteRule::new(
                BACKGROUND_RULE,
                RouteCondition::model_contains("haiku"),
                RouteAction::to(route).with_description("Background: haiku requests use a lightweight model"),
            )
            .with_priority(80),
        );
    }

    if let Some(route) = slot(&legacy.web_search) {
        rules.push(
            RouteRule::new(
                WEB_SEARCH_RULE,
                RouteCondition::ToolExists {
                    value: "web_search".to_string(),
                    operator: Some(Operator::Exists),
                },
                RouteAction::to(route).with_description("Web search: requests offering the web_search tool"),
            )
            .with_priority(70),
        );
    }

    if let Some(route) = slot(&legacy.think) {
        rules.push(
            RouteRule::new(
                THINKING_RULE,
                RouteCondition::FieldExists {
                    field: "thinking".to_string(),
                    value: None,
                    operator: Some(Operator::Exists),
                },
                RouteAction::to(route).with_description("Thinking: requests with a thinking parameter"),
            )
            .with_priority(60),
        );
    }

    rules.push(
        RouteRule::new(
            DIRECT_MAPPING_RULE,
            RouteCondition::custom(DIRECT_MODEL_MAPPING),
            RouteAction::to(MAPPED_MODEL).with_description("Direct mapping: bare provider or model code"),
        )
        .with_priority(50),
    );

    rules.push(
        RouteRule::new(
            USER_SPECIFIED_RULE,
            RouteCondition::custom(MODEL_CONTAINS_COMMA),
            RouteAction::to(USER_MODEL).with_description("User specified: explicit provider,model in the request"),
        )
        .with_priority(40),
    );

    let default_route = slot(&legacy.default).unwrap_or_default().to_string();
    if default_route.is_empty() {
        tracing::warn!("Legacy router config has no default route");
    }
    tracing::info!(rules = rules.len(), default_route = %default_route, "Migrated legacy router config");

    RouterConfig::new(default_route)
        .with_rules(rules)
        .with_cache(CacheConfig::default())
}
