//! Subcommand implementations

use futures::StreamExt;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use switchboard_config_file::{FileConfigSource, GatewayConfig};
use switchboard_core::{Error, Result, RouteRequest};
use switchboard_routing::{
    Dispatch, GroupManager, ModuleLoader, RouteDispatcher, RouterConfigPatch, RoutingEngine,
    RoutingObserver, RuleSet, WasmModuleLoader,
};
use tracing::{error, info, warn};

/// WebAssembly predicate loader resolving module paths next to the config file
pub fn module_loader(config_path: &Path) -> Result<Arc<dyn ModuleLoader>> {
    let mut loader = WasmModuleLoader::new()?;
    if let Some(dir) = config_path.parent() {
        loader = loader.with_base_dir(dir);
    }
    Ok(Arc::new(loader))
}

/// Build an engine and the configured groups
pub fn build_dispatcher(
    config: &GatewayConfig,
    modules: Arc<dyn ModuleLoader>,
    observer: Option<Arc<dyn RoutingObserver>>,
) -> Result<RouteDispatcher> {
    let mut engine = RoutingEngine::new(config.router.clone())?.with_module_loader(modules);
    let mut groups = GroupManager::new();
    if let Some(observer) = observer {
        engine = engine.with_observer(observer.clone());
        groups = groups.with_observer(observer);
    }
    config.apply_groups(&groups)?;
    Ok(RouteDispatcher::new(Arc::new(engine), Arc::new(groups)))
}

pub async fn route(
    dispatcher: &RouteDispatcher,
    config: &GatewayConfig,
    request: &RouteRequest,
    tokens: u64,
) -> Dispatch {
    dispatcher
        .dispatch(request, tokens, &config.catalog(), None)
        .await
}

/// Human readable (or JSON) rendering of a dispatch
pub fn render_dispatch(dispatch: &Dispatch, json: bool) -> serde_json::Result<String> {
    let result = &dispatch.result;
    if json {
        return serde_json::to_string_pretty(result);
    }

    let mut out = String::new();
    let _ = writeln!(out, "route:    {}", result.route);
    let _ = writeln!(
        out,
        "rule:     {}",
        result.matched_rule.as_deref().unwrap_or("-")
    );
    if !result.transformers.is_empty() {
        let _ = writeln!(out, "transform: {}", result.transformers.join(", "));
    }
    let _ = writeln!(out, "cached:   {}", if result.from_cache { "yes" } else { "no" });
    let _ = writeln!(out, "time:     {:.3}ms", result.decision_time_ms);
    if let Some(error) = &result.metadata.error {
        let _ = writeln!(out, "fallback: {error}");
    }
    if let Some(group) = &dispatch.group {
        match &dispatch.instance {
            Some(instance) => {
                let _ = writeln!(out, "instance: {} ({group})", instance.id);
            }
            None => {
                let _ = writeln!(out, "instance: none available ({group})");
            }
        }
    }
    Ok(out.trim_end().to_string())
}

/// Table of rules, enabled ones in evaluation order then disabled ones
pub fn render_rules(rules: &RuleSet) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>8}  {:<16} {:<8} {:<32} ROUTE",
        "PRIORITY", "NAME", "STATUS", "CONDITION"
    );

    let disabled = rules.rules().iter().filter(|rule| !rule.enabled);
    for rule in rules.evaluation_order().chain(disabled) {
        let _ = writeln!(
            out,
            "{:>8}  {:<16} {:<8} {:<32} {}",
            rule.priority,
            rule.name,
            if rule.enabled { "enabled" } else { "disabled" },
            rule.condition.describe(),
            rule.action.route
        );
    }
    out
}

/// YAML rendering of a (possibly migrated) configuration
pub fn render_config(config: &GatewayConfig) -> serde_yaml::Result<String> {
    serde_yaml::to_string(config)
}

/// Apply the current file contents to a running dispatcher
///
/// The file is validated in full before the first change, so a rejected
/// file leaves both rules and groups as they were.
pub fn reload(source: &FileConfigSource, dispatcher: &RouteDispatcher) -> Result<()> {
    let config = source.load()?;
    let patch = RouterConfigPatch::from(config.router.clone());
    dispatcher.engine().check_config(&patch)?;

    let groups = dispatcher.groups();
    for group in &config.groups {
        let unchanged = groups.get_group(&group.name).is_some_and(|info| info.routes == group.routes)
            && groups
                .registry(&group.name)
                .is_ok_and(|registry| registry.config() == &group.registry);
        if !unchanged {
            groups.update_group(&group.name, group.routes.clone(), group.registry.clone())?;
        }
    }
    for name in groups.groups() {
        if !config.groups.iter().any(|group| group.name == name) {
            match groups.remove_group(&name) {
                Ok(()) | Err(Error::GroupNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }
    dispatcher.engine().update_config(patch)?;

    info!(
        version = source.version(),
        rules = config.router.rules.len(),
        groups = config.groups.len(),
        "Configuration reloaded"
    );
    Ok(())
}

/// Reload on every file change until Ctrl-C
pub async fn watch(source: &FileConfigSource, dispatcher: &RouteDispatcher) -> anyhow::Result<()> {
    let mut changes = source.watch_changes();
    info!(path = ?source.path(), "Watching configuration, press Ctrl-C to stop");

    loop {
        tokio::select! {
            change = changes.next() => match change {
                Some(Ok(change)) => {
                    info!(version = change.version, "Configuration file changed");
                    if let Err(e) = reload(source, dispatcher) {
                        // Keep serving the last good configuration
                        warn!(error = %e, "Reload failed");
                    }
                }
                Some(Err(e)) => error!(error = %e, "Configuration watch error"),
                None => {
                    warn!("Configuration watcher stopped");
                    break;
                }
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchboard_routing::{RouteAction, RouteCondition, RouteRule};
    use tempfile::Builder;

    fn gateway(value: serde_json::Value) -> GatewayConfig {
        GatewayConfig::from_value(value).unwrap()
    }

    fn modules() -> Arc<dyn ModuleLoader> {
        module_loader(Path::new("config.yaml")).unwrap()
    }

    #[tokio::test]
    async fn test_route_renders_decision() {
        let config = gateway(json!({
            "router": {
                "default_route": "deepseek,deepseek-chat",
                "rules": [{
                    "name": "background",
                    "priority": 80,
                    "condition": {"type": "model_contains", "value": "haiku"},
                    "action": {"route": "gemini,gemini-2.5-flash"}
                }]
            },
            "groups": [{
                "name": "fast",
                "routes": ["gemini,gemini-2.5-flash"],
                "registry": {"health_check_interval_ms": 0}
            }]
        }));
        let dispatcher = build_dispatcher(&config, modules(), None).unwrap();
        let request = RouteRequest::new(json!({"model": "claude-3-5-haiku"}));

        let dispatch = route(&dispatcher, &config, &request, 10).await;
        let text = render_dispatch(&dispatch, false).unwrap();
        assert!(text.starts_with("route:    gemini,gemini-2.5-flash"));
        assert!(text.contains("rule:     background"));
        assert!(text.contains("cached:   no"));
        assert!(text.contains("(fast)"));

        let json: serde_json::Value =
            serde_json::from_str(&render_dispatch(&dispatch, true).unwrap()).unwrap();
        assert_eq!(json["route"], "gemini,gemini-2.5-flash");

        dispatcher.release(&dispatch).unwrap();
        dispatcher.groups().shutdown();
    }

    #[test]
    fn test_render_rules_order() {
        let rules = RuleSet::new(vec![
            RouteRule::new("low", RouteCondition::tokens_above(10.0), RouteAction::to("a,b"))
                .with_priority(1),
            RouteRule::new("off", RouteCondition::custom("modelContainsComma"), RouteAction::to("c,d"))
                .with_priority(99)
                .with_enabled(false),
            RouteRule::new("high", RouteCondition::model_contains("haiku"), RouteAction::to("e,f"))
                .with_priority(50),
        ]);

        let table = render_rules(&rules);
        let names: Vec<_> = table
            .lines()
            .skip(1)
            .map(|line| line.split_whitespace().nth(1).unwrap())
            .collect();
        assert_eq!(names, vec!["high", "low", "off"]);
        assert!(table.contains("disabled"));
    }

    #[test]
    fn test_render_config_migrates_legacy() {
        let config = gateway(json!({
            "Router": {"default": "deepseek,deepseek-chat", "think": "deepseek,deepseek-reasoner"}
        }));

        let yaml = render_config(&config).unwrap();
        assert!(yaml.contains("deepseek,deepseek-chat"));
        assert!(yaml.contains("name: thinking"));

        // The rendered document loads back as a rule-based config
        let reloaded: serde_json::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(gateway(reloaded).router, config.router);
    }

    #[tokio::test]
    async fn test_reload_applies_new_rules_and_groups() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        std::fs::write(
            file.path(),
            "router:\n  default_route: \"a,b\"\ngroups:\n  - name: old\n    routes: [\"a,b\"]\n    registry:\n      healthCheckInterval: 0\n",
        )
        .unwrap();
        let source = FileConfigSource::new(file.path()).unwrap();
        let dispatcher = build_dispatcher(&source.load().unwrap(), modules(), None).unwrap();

        std::fs::write(
            file.path(),
            r#"
router:
  default_route: "c,d"
  rules:
    - name: big
      condition: {type: token_threshold, value: 100}
      action: {route: "e,f"}
groups:
  - name: new
    routes: ["e,f"]
    registry:
      healthCheckInterval: 0
"#,
        )
        .unwrap();
        reload(&source, &dispatcher).unwrap();

        assert_eq!(dispatcher.engine().config().default_route, "c,d");
        assert_eq!(dispatcher.engine().rules().len(), 1);
        assert_eq!(dispatcher.groups().groups(), vec!["new".to_string()]);

        let request = RouteRequest::new(json!({"model": "m"}));
        let catalog = switchboard_core::ProviderCatalog::default();
        let dispatch = dispatcher.dispatch(&request, 500, &catalog, None).await;
        assert_eq!(dispatch.result.route, "e,f");
        assert_eq!(dispatch.group.as_deref(), Some("new"));
        dispatcher.release(&dispatch).unwrap();
        dispatcher.groups().shutdown();
    }

    #[tokio::test]
    async fn test_reload_keeps_unchanged_group() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        let contents = "router:\n  default_route: \"a,b\"\ngroups:\n  - name: g\n    routes: [\"a,b\"]\n    registry:\n      healthCheckInterval: 0\n";
        std::fs::write(file.path(), contents).unwrap();
        let source = FileConfigSource::new(file.path()).unwrap();
        let dispatcher = build_dispatcher(&source.load().unwrap(), modules(), None).unwrap();
        let before = dispatcher.groups().get_group("g").unwrap().instances[0].id.clone();

        reload(&source, &dispatcher).unwrap();

        let after = dispatcher.groups().get_group("g").unwrap().instances[0].id.clone();
        assert_eq!(before, after);
        dispatcher.groups().shutdown();
    }

    #[test]
    fn test_reload_rejects_invalid_file() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        std::fs::write(file.path(), "router:\n  default_route: \"a,b\"\n").unwrap();
        let source = FileConfigSource::new(file.path()).unwrap();
        let dispatcher = build_dispatcher(&source.load().unwrap(), modules(), None).unwrap();

        std::fs::write(file.path(), "router:\n  default_route: \"\"\n").unwrap();
        assert!(reload(&source, &dispatcher).is_err());
        assert_eq!(dispatcher.engine().config().default_route, "a,b");
    }

    #[tokio::test]
    async fn test_rejected_reload_changes_nothing() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        std::fs::write(
            file.path(),
            "router:\n  default_route: \"a,b\"\ngroups:\n  - name: g\n    routes: [\"a,b\"]\n    registry:\n      healthCheckInterval: 0\n",
        )
        .unwrap();
        let source = FileConfigSource::new(file.path()).unwrap();
        let dispatcher = build_dispatcher(&source.load().unwrap(), modules(), None).unwrap();

        // Valid router, but the group cannot hold its routes
        std::fs::write(
            file.path(),
            r#"
router:
  default_route: "c,d"
groups:
  - name: g
    routes: ["c,d", "e,f", "g,h"]
    registry:
      healthCheckInterval: 0
      maxInstances: 2
"#,
        )
        .unwrap();
        assert!(reload(&source, &dispatcher).is_err());

        assert_eq!(dispatcher.engine().config().default_route, "a,b");
        let info = dispatcher.groups().get_group("g").unwrap();
        assert_eq!(info.routes, vec!["a,b".to_string()]);
        dispatcher.groups().shutdown();
    }

    #[tokio::test]
    async fn test_wasm_rule_resolves_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/flag.wat"),
            r#"(module (func (export "enabled") (result i32) i32.const 1))"#,
        )
        .unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            r#"
router:
  default_route: "a,b"
  rules:
    - name: flagged
      condition:
        type: external_function
        external_function: {path: rules/flag.wat, function_name: enabled}
      action: {route: "e,f"}
"#,
        )
        .unwrap();

        let source = FileConfigSource::new(&config_path).unwrap();
        let config = source.load().unwrap();
        let dispatcher = build_dispatcher(&config, module_loader(source.path()).unwrap(), None).unwrap();

        let request = RouteRequest::new(json!({"model": "m"}));
        let dispatch = route(&dispatcher, &config, &request, 0).await;
        assert_eq!(dispatch.result.route, "e,f");
        assert_eq!(dispatch.result.matched_rule.as_deref(), Some("flagged"));
    }
}
