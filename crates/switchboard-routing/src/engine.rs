//! Routing engine
//!
//! Ties the pieces together for one routing call:
//!
//! 1. Build a [`RouteContext`] from the request.
//! 2. Evaluate enabled rules in descending priority; the first match wins.
//! 3. Expand route variables, falling back to the default route when they
//!    cannot be resolved.
//! 4. Fill in a provider's default model when the route names only a
//!    provider.
//! 5. Serve from or populate the result cache and update statistics.
//!
//! [`RoutingEngine::evaluate`] never fails: an error that escapes rule
//! evaluation produces a result pointing at the default route with
//! `metadata.fallback` set.
//!
//! ```rust
//! use serde_json::json;
//! use switchboard_core::{ProviderCatalog, RouteRequest};
//! use switchboard_routing::{RouteAction, RouteCondition, RouteRule, RouterConfig, RoutingEngine};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = RouterConfig::new("deepseek,deepseek-chat").with_rules(vec![
//!     RouteRule::new(
//!         "longContext",
//!         RouteCondition::tokens_above(60000.0),
//!         RouteAction::to("gemini,gemini-2.5-pro"),
//!     )
//!     .with_priority(100),
//! ]);
//! let engine = RoutingEngine::new(config).unwrap();
//! let request = RouteRequest::new(json!({"model": "claude-sonnet-4"}));
//! let catalog = ProviderCatalog::default();
//!
//! let result = engine.evaluate(&request, 80000, &catalog, None).await;
//! assert_eq!(result.route, "gemini,gemini-2.5-pro");
//! assert_eq!(result.matched_rule.as_deref(), Some("longContext"));
//!
//! let route = engine.route(&request, 1000, &catalog, None).await;
//! assert_eq!(route, "deepseek,deepseek-chat");
//! # }
//! ```

use crate::cache::{RouteCache, fingerprint};
use crate::condition::{ConditionEvaluator, CustomPredicates};
use crate::config::{RouterConfig, RouterConfigPatch};
use crate::context::{
    ConditionEvaluationResult, ContextSummary, DEFAULT_RULE_LABEL, RouteContext, RouteMetadata, RouteResult,
};
use crate::external::{ExternalEvaluator, ModuleLoader, StaticModuleLoader};
use crate::legacy::DIRECT_MAPPING_RULE;
use crate::observer::RoutingObserver;
use crate::provider::resolve_provider_model;
use crate::rule::RouteRule;
use crate::rule_store::{RuleSet, RuleStore};
use crate::stats::{RouteStats, StatsRecorder};
use crate::variables::{Substitution, VariableResolver, has_placeholder};
use arc_swap::ArcSwap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use switchboard_core::{ProviderCatalog, ROUTE_SEPARATOR, Result, RouteRequest};

/// Configuration-derived parts swapped as a unit on `update_config`
struct EngineSettings {
    /// Router configuration without rules; those live in the rule store
    config: RouterConfig,
    resolver: VariableResolver,
    evaluator: ConditionEvaluator,
}

/// Outcome of rule matching and route resolution, before caching
struct Decision {
    route: String,
    label: String,
    transformers: Vec<String>,
    evaluations: Vec<ConditionEvaluationResult>,
}

/// Rule-based router
pub struct RoutingEngine {
    settings: ArcSwap<EngineSettings>,
    rules: RuleStore,
    cache: ArcSwap<RouteCache>,
    stats: StatsRecorder,
    custom: CustomPredicates,
    loader: Arc<dyn ModuleLoader>,
    observer: Option<Arc<dyn RoutingObserver>>,
}

impl RoutingEngine {
    /// Create an engine from a validated configuration
    pub fn new(config: RouterConfig) -> Result<Self> {
        config.validate()?;

        let custom = CustomPredicates::with_builtins();
        let loader: Arc<dyn ModuleLoader> = Arc::new(StaticModuleLoader::new());
        let rules = RuleStore::new(config.rules.clone());
        let cache = RouteCache::new(config.cache.max_size, config.cache.ttl());
        let settings = build_settings(config, &custom, &loader)?;

        tracing::info!(
            default_route = %settings.config.default_route,
            rules = rules.snapshot().len(),
            cache_enabled = settings.config.cache.enabled,
            "Routing engine initialized"
        );

        Ok(Self {
            settings: ArcSwap::from_pointee(settings),
            rules,
            cache: ArcSwap::from_pointee(cache),
            stats: StatsRecorder::default(),
            custom,
            loader,
            observer: None,
        })
    }

    /// Load `external_function` modules through `loader`
    pub fn with_module_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        let current = self.settings.load_full();
        let evaluator = ConditionEvaluator::new(
            self.custom.clone(),
            ExternalEvaluator::new(loader.clone(), current.config.external_timeout()),
        );
        self.settings.store(Arc::new(EngineSettings {
            config: current.config.clone(),
            resolver: current.resolver.clone(),
            evaluator,
        }));
        self.loader = loader;
        self
    }

    /// Report every decision to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn RoutingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Route a request and return only the target
    pub async fn route(
        &self,
        request: &RouteRequest,
        token_count: u64,
        catalog: &ProviderCatalog,
        last_usage: Option<&Value>,
    ) -> String {
        self.evaluate(request, token_count, catalog, last_usage).await.route
    }

    /// Route a request
    pub async fn evaluate(
        &self,
        request: &RouteRequest,
        token_count: u64,
        catalog: &ProviderCatalog,
        last_usage: Option<&Value>,
    ) -> RouteResult {
        self.evaluate_until(request, token_count, catalog, last_usage, None)
            .await
    }

    /// Route a request, bounding external predicates by `deadline`
    pub async fn evaluate_until(
        &self,
        request: &RouteRequest,
        token_count: u64,
        catalog: &ProviderCatalog,
        last_usage: Option<&Value>,
        deadline: Option<tokio::time::Instant>,
    ) -> RouteResult {
        let started = Instant::now();
        let settings = self.settings.load_full();

        let result = match self
            .compute(&settings, request, token_count, catalog, last_usage, deadline, started)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let default_route = &settings.config.default_route;
                tracing::error!(
                    error = %e,
                    default_route = %default_route,
                    "Routing evaluation failed, using default route"
                );
                self.stats.record_fallback();
                RouteResult::fallback(default_route.clone(), e.to_string(), elapsed_ms(started))
            }
        };

        if let Some(observer) = &self.observer {
            observer.on_decision(&result);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn compute(
        &self,
        settings: &EngineSettings,
        request: &RouteRequest,
        token_count: u64,
        catalog: &ProviderCatalog,
        last_usage: Option<&Value>,
        deadline: Option<tokio::time::Instant>,
        started: Instant,
    ) -> Result<RouteResult> {
        let context = RouteContext::new(request, token_count, last_usage);
        let decision = self.decide(settings, &context, catalog, deadline).await?;

        let cache_enabled = settings.config.cache.enabled;
        let key = fingerprint(request, token_count, &decision.route);
        let cache = self.cache.load();

        if cache_enabled && let Some(mut cached) = cache.get(&key) {
            cached.from_cache = true;
            self.stats.record_hit();
            tracing::debug!(route = %cached.route, "Routing cache hit");
            return Ok(cached);
        }

        let decision_time_ms = elapsed_ms(started);
        let result = RouteResult {
            route: decision.route,
            matched_rule: Some(decision.label.clone()),
            transformers: decision.transformers,
            decision_time_ms,
            from_cache: false,
            metadata: RouteMetadata {
                context: Some(ContextSummary {
                    token_count,
                    has_tools: !context.tools.is_empty(),
                    thinking: request.thinking().cloned().unwrap_or(Value::Bool(false)),
                    session_id: context.session_id.map(str::to_string),
                }),
                evaluations: decision.evaluations,
                ..Default::default()
            },
        };

        if cache_enabled {
            cache.insert(key, result.clone());
        }
        self.stats.record_miss(&decision.label, decision_time_ms);

        tracing::info!(
            model = request.model().unwrap_or(DEFAULT_RULE_LABEL),
            route = %result.route,
            rule = %decision.label,
            tokens = token_count,
            decision_ms = decision_time_ms,
            "Routing decision"
        );
        Ok(result)
    }

    /// Match rules and resolve the final route
    async fn decide(
        &self,
        settings: &EngineSettings,
        context: &RouteContext<'_>,
        catalog: &ProviderCatalog,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Decision> {
        let config = &settings.config;
        let rules = self.rules.snapshot();
        if rules.enabled_count() == 0 {
            tracing::warn!("No enabled routing rules, using default route");
        }

        let mut evaluations = Vec::new();
        let mut matched: Option<&RouteRule> = None;
        for rule in rules.evaluation_order() {
            let evaluation = settings.evaluator.evaluate(rule, context, deadline).await?;
            if config.debug.enabled {
                tracing::debug!(
                    rule = %rule.name,
                    priority = rule.priority,
                    condition = %rule.condition.describe(),
                    matches = evaluation.matches,
                    elapsed_ms = evaluation.evaluation_time_ms,
                    "Evaluated routing rule"
                );
            }
            let matches = evaluation.matches;
            evaluations.push(evaluation);
            if matches {
                matched = Some(rule);
                break;
            }
        }

        let mut label = matched.map_or(DEFAULT_RULE_LABEL, |rule| rule.name.as_str()).to_string();
        let mut route = matched.map_or(config.default_route.as_str(), |rule| rule.action.route.as_str()).to_string();
        let transformers = matched.map(|rule| rule.action.transformers.clone()).unwrap_or_default();

        if has_placeholder(&route) {
            match settings.resolver.substitute(
                &route,
                context.request,
                &context.system,
                catalog,
                &config.default_route,
            ) {
                Substitution::Resolved(resolved) => route = resolved,
                Substitution::Fallback => {
                    route = config.default_route.clone();
                    label = DEFAULT_RULE_LABEL.to_string();
                }
                Substitution::KeepLiteral(literal) => {
                    route = literal;
                    label = DEFAULT_RULE_LABEL.to_string();
                }
            }
        } else if label == DIRECT_MAPPING_RULE
            && let Some(model) = context
                .model()
                .filter(|model| !model.is_empty() && !model.contains(ROUTE_SEPARATOR))
        {
            match resolve_provider_model(model, catalog, false) {
                Some(mapped) => {
                    if mapped == config.default_route {
                        label = DEFAULT_RULE_LABEL.to_string();
                    }
                    route = mapped;
                }
                None => {
                    tracing::warn!(model = %model, "Direct mapping failed, using default route");
                    route = config.default_route.clone();
                    label = DEFAULT_RULE_LABEL.to_string();
                }
            }
        }

        if let Some(resolved) = resolve_provider_model(&route, catalog, true) {
            route = resolved;
        }

        Ok(Decision {
            route,
            label,
            transformers,
            evaluations,
        })
    }

    /// Add a rule, replacing one with the same name
    pub fn add_rule(&self, rule: RouteRule) {
        self.rules.add_rule(rule);
        self.clear_cache();
    }

    /// Remove a rule; returns whether it existed
    pub fn remove_rule(&self, name: &str) -> bool {
        let removed = self.rules.remove_rule(name);
        if removed {
            self.clear_cache();
        }
        removed
    }

    /// Enable or disable a rule; returns whether it existed
    pub fn toggle_rule(&self, name: &str, enabled: bool) -> bool {
        let found = self.rules.toggle_rule(name, enabled);
        if found {
            self.clear_cache();
        }
        found
    }

    /// All rules in insertion order
    pub fn rules(&self) -> Vec<RouteRule> {
        self.rules.rules()
    }

    /// Current rule snapshot, for evaluation-order listings
    pub fn rule_set(&self) -> Arc<RuleSet> {
        self.rules.snapshot()
    }

    pub fn clear_cache(&self) {
        self.cache.load().clear();
        tracing::debug!("Routing cache cleared");
    }

    pub fn stats(&self) -> RouteStats {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Register a predicate usable from `custom` conditions
    pub fn register_custom<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&RouteContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.custom.register(name, predicate);
        self.clear_cache();
    }

    /// Current configuration, rules included
    pub fn config(&self) -> RouterConfig {
        let mut config = self.settings.load().config.clone();
        config.rules = self.rules.rules();
        config
    }

    /// Apply a partial configuration update
    ///
    /// The merged configuration is validated before anything changes.
    /// Supplying `rules` replaces the rule set; supplying `cache` rebuilds
    /// the cache. The cache is cleared in every case.
    pub fn update_config(&self, patch: RouterConfigPatch) -> Result<()> {
        let settings = self.prepare(&patch)?;

        if let Some(rules) = patch.rules {
            self.rules.replace(rules);
        }
        if let Some(cache) = &patch.cache {
            self.cache
                .store(Arc::new(RouteCache::new(cache.max_size, cache.ttl())));
        } else {
            self.clear_cache();
        }
        self.settings.store(Arc::new(settings));

        tracing::info!("Routing configuration updated");
        Ok(())
    }

    /// Check that [`update_config`](Self::update_config) would accept `patch`
    pub fn check_config(&self, patch: &RouterConfigPatch) -> Result<()> {
        self.prepare(patch).map(|_| ())
    }

    fn prepare(&self, patch: &RouterConfigPatch) -> Result<EngineSettings> {
        let merged = patch.apply(&self.config());
        merged.validate()?;
        build_settings(merged, &self.custom, &self.loader)
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let settings = self.settings.load();
        f.debug_struct("RoutingEngine")
            .field("default_route", &settings.config.default_route)
            .field("rules", &self.rules.snapshot().len())
            .field("cache", &**self.cache.load())
            .finish()
    }
}

fn build_settings(
    mut config: RouterConfig,
    custom: &CustomPredicates,
    loader: &Arc<dyn ModuleLoader>,
) -> Result<EngineSettings> {
    config.rules.clear();
    let resolver = VariableResolver::new(&config.subagent_tag)?;
    let evaluator = ConditionEvaluator::new(
        custom.clone(),
        ExternalEvaluator::new(loader.clone(), config.external_timeout()),
    );
    Ok(EngineSettings {
        config,
        resolver,
        evaluator,
    })
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::rule::{RouteAction, RouteCondition};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use switchboard_core::ProviderEntry;

    const DEFAULT: &str = "deepseek,deepseek-chat";

    fn rule(name: &str, priority: i32, threshold: f64, route: &str) -> RouteRule {
        RouteRule::new(name, RouteCondition::tokens_above(threshold), RouteAction::to(route))
            .with_priority(priority)
    }

    fn engine(rules: Vec<RouteRule>) -> RoutingEngine {
        RoutingEngine::new(RouterConfig::new(DEFAULT).with_rules(rules)).unwrap()
    }

    fn request() -> RouteRequest {
        RouteRequest::new(json!({"model": "claude-sonnet-4", "messages": []}))
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        assert!(RoutingEngine::new(RouterConfig::new("")).is_err());
    }

    #[tokio::test]
    async fn test_no_rules_uses_default() {
        let engine = engine(Vec::new());
        let result = engine.evaluate(&request(), 10, &ProviderCatalog::default(), None).await;

        assert_eq!(result.route, DEFAULT);
        assert_eq!(result.matched_rule.as_deref(), Some(DEFAULT_RULE_LABEL));
        assert!(result.metadata.evaluations.is_empty());
    }

    #[tokio::test]
    async fn test_first_match_stops_evaluation() {
        let engine = engine(vec![
            rule("a", 10, 100.0, "a,model"),
            rule("b", 5, 100.0, "b,model"),
        ]);
        let result = engine.evaluate(&request(), 500, &ProviderCatalog::default(), None).await;

        assert_eq!(result.matched_rule.as_deref(), Some("a"));
        assert_eq!(result.metadata.evaluations.len(), 1);
    }

    #[tokio::test]
    async fn test_trace_records_non_matching_rules() {
        let engine = engine(vec![
            rule("big", 10, 1000.0, "a,model"),
            rule("small", 5, 100.0, "b,model"),
        ]);
        let result = engine.evaluate(&request(), 500, &ProviderCatalog::default(), None).await;

        let trace: Vec<(&str, bool)> = result
            .metadata
            .evaluations
            .iter()
            .map(|e| (e.rule.as_str(), e.matches))
            .collect();
        assert_eq!(trace, vec![("big", false), ("small", true)]);

        let summary = result.metadata.context.unwrap();
        assert_eq!(summary.token_count, 500);
        assert_eq!(summary.thinking, Value::Bool(false));
    }

    #[tokio::test]
    async fn test_provider_only_route_gets_default_model() {
        let catalog = ProviderCatalog::new(vec![
            ProviderEntry::new("gemini", ["gemini-2.5-pro", "gemini-2.5-flash"]),
        ]);
        let engine = engine(vec![rule("r", 1, 0.0, "gemini")]);

        let result = engine.evaluate(&request(), 1, &catalog, None).await;
        assert_eq!(result.route, "gemini,gemini-2.5-pro");
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let engine = engine(vec![rule("r", 1, 100.0, "a,b")]);
        let catalog = ProviderCatalog::default();

        engine.evaluate(&request(), 500, &catalog, None).await;
        engine.evaluate(&request(), 500, &catalog, None).await;
        engine.evaluate(&request(), 5, &catalog, None).await;

        let stats = engine.stats();
        assert_eq!(stats.total_routes, 3);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 2);
        assert_eq!(stats.rule_matches.get("r"), Some(&1));
        assert_eq!(stats.rule_matches.get(DEFAULT_RULE_LABEL), Some(&1));

        engine.reset_stats();
        assert_eq!(engine.stats(), RouteStats::default());
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let config = RouterConfig::new(DEFAULT).with_cache(CacheConfig::disabled());
        let engine = RoutingEngine::new(config).unwrap();
        let catalog = ProviderCatalog::default();

        engine.evaluate(&request(), 1, &catalog, None).await;
        let second = engine.evaluate(&request(), 1, &catalog, None).await;

        assert!(!second.from_cache);
        assert_eq!(engine.stats().cache_hits, 0);
    }

    #[tokio::test]
    async fn test_rule_changes_clear_cache() {
        let engine = engine(vec![rule("r", 1, 100.0, "a,b")]);
        let catalog = ProviderCatalog::default();

        engine.evaluate(&request(), 500, &catalog, None).await;
        assert!(engine.toggle_rule("r", false));

        let result = engine.evaluate(&request(), 500, &catalog, None).await;
        assert!(!result.from_cache);
        assert_eq!(result.route, DEFAULT);

        assert!(!engine.toggle_rule("missing", true));
        assert!(engine.remove_rule("r"));
        assert!(!engine.remove_rule("r"));
    }

    #[tokio::test]
    async fn test_add_rule_upserts() {
        let engine = engine(vec![rule("r", 1, 100.0, "a,b")]);
        engine.add_rule(rule("r", 1, 100.0, "c,d"));

        assert_eq!(engine.rules().len(), 1);
        let result = engine.evaluate(&request(), 500, &ProviderCatalog::default(), None).await;
        assert_eq!(result.route, "c,d");
    }

    #[tokio::test]
    async fn test_register_custom_predicate() {
        let engine = engine(vec![RouteRule::new(
            "vip",
            RouteCondition::custom("isVip"),
            RouteAction::to("vip,model"),
        )]);
        let catalog = ProviderCatalog::default();

        // Unknown custom function evaluates false
        assert_eq!(engine.route(&request(), 1, &catalog, None).await, DEFAULT);

        engine.register_custom("isVip", |context| context.session_id == Some("vip"));
        let vip = request().with_session_id("vip");
        assert_eq!(engine.route(&vip, 1, &catalog, None).await, "vip,model");
    }

    #[tokio::test]
    async fn test_update_config_validates_first() {
        let engine = engine(vec![rule("r", 1, 100.0, "a,b")]);

        let patch = RouterConfigPatch {
            default_route: Some(String::new()),
            ..Default::default()
        };
        assert!(engine.check_config(&patch).is_err());
        assert!(engine.update_config(patch).is_err());
        assert_eq!(engine.config().default_route, DEFAULT);
        assert_eq!(engine.rules().len(), 1);

        let patch = RouterConfigPatch::rules(Vec::new());
        engine.check_config(&patch).unwrap();
        assert_eq!(engine.rules().len(), 1);
    }

    #[tokio::test]
    async fn test_update_config_replaces_rules_and_default() {
        let engine = engine(vec![rule("r", 1, 100.0, "a,b")]);
        engine
            .update_config(RouterConfigPatch {
                default_route: Some("x,y".to_string()),
                rules: Some(vec![rule("s", 1, 1000.0, "c,d")]),
                ..Default::default()
            })
            .unwrap();

        let catalog = ProviderCatalog::default();
        assert_eq!(engine.route(&request(), 500, &catalog, None).await, "x,y");
        assert_eq!(engine.route(&request(), 5000, &catalog, None).await, "c,d");

        let config = engine.config();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].name, "s");
    }

    #[tokio::test]
    async fn test_update_config_rebuilds_cache() {
        let engine = engine(Vec::new());
        engine
            .update_config(RouterConfigPatch {
                cache: Some(CacheConfig {
                    max_size: 7,
                    ..CacheConfig::default()
                }),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(engine.cache.load().capacity(), 7);
    }

    #[derive(Default)]
    struct DecisionCounter(AtomicUsize);

    impl RoutingObserver for DecisionCounter {
        fn on_decision(&self, _: &RouteResult) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_observer_sees_every_decision() {
        let counter = Arc::new(DecisionCounter::default());
        let engine = engine(Vec::new()).with_observer(counter.clone());
        let catalog = ProviderCatalog::default();

        engine.evaluate(&request(), 1, &catalog, None).await;
        engine.evaluate(&request(), 1, &catalog, None).await;

        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
