//! Switchboard Routing Engine
//!
//! This crate provides the routing logic for switchboard:
//! - Rule storage and priority-ordered condition matching
//! - Route variable expansion and provider/model resolution
//! - Result caching and routing statistics
//! - Health-checked instance registries with load balancing
//! - Instance groups and request dispatch
//! - External predicates, including WebAssembly modules (`wasm` feature)

pub mod cache;
pub mod condition;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod external;
pub mod group;
pub mod instance;
pub mod legacy;
pub mod observer;
pub mod provider;
pub mod rule;
pub mod rule_store;
pub mod stats;
pub mod strategy;
pub mod variables;
#[cfg(feature = "wasm")]
pub mod wasm;

// Re-export commonly used types
pub use cache::RouteCache;
pub use condition::{
    ConditionEvaluator, CustomPredicate, CustomPredicates, DIRECT_MODEL_MAPPING, MODEL_CONTAINS_COMMA,
};
pub use config::{CacheConfig, DebugConfig, InstanceRegistryConfig, RouterConfig, RouterConfigPatch};
pub use context::{
    ConditionEvaluationResult, ContextSummary, DEFAULT_RULE_LABEL, RouteContext, RouteMetadata, RouteResult,
};
pub use dispatch::{Dispatch, RouteDispatcher};
pub use engine::RoutingEngine;
pub use external::{
    ExternalEvaluator, ExternalPredicate, ModuleLoader, PredicateModule, StaticModuleLoader, predicate_fn,
};
pub use group::{GroupInfo, GroupManager};
pub use instance::{ActivityHealthCheck, HealthCheck, InstanceRegistry, InstanceStatus, RouteInstance};
pub use legacy::{LegacyRouterConfig, is_legacy_router, migrate_legacy_config};
pub use observer::RoutingObserver;
pub use provider::resolve_provider_model;
pub use rule::{ExternalFunctionRef, Operator, RouteAction, RouteCondition, RouteRule};
pub use rule_store::{RuleSet, RuleStore};
pub use stats::RouteStats;
pub use strategy::{LoadBalancingStrategy, StrategyError};
pub use variables::{Substitution, VariableResolver};
#[cfg(feature = "wasm")]
pub use wasm::WasmModuleLoader;
