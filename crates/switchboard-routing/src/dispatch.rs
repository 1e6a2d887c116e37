//! Routing plus instance selection
//!
//! The dispatcher asks the engine for a route and, when that route belongs
//! to an instance group, picks a concrete instance of it. The caller
//! releases the instance through [`RouteDispatcher::release`] once the
//! backend call finishes.

use crate::context::RouteResult;
use crate::engine::RoutingEngine;
use crate::group::GroupManager;
use crate::instance::RouteInstance;
use serde_json::Value;
use std::sync::Arc;
use switchboard_core::{ProviderCatalog, Result, RouteRequest};

/// A routing decision and the instance chosen for it
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub result: RouteResult,
    /// Group owning the route, if any
    pub group: Option<String>,
    /// Selected instance; `None` when the route is ungrouped or no instance is healthy
    pub instance: Option<RouteInstance>,
}

#[derive(Debug, Clone)]
pub struct RouteDispatcher {
    engine: Arc<RoutingEngine>,
    groups: Arc<GroupManager>,
}

impl RouteDispatcher {
    pub fn new(engine: Arc<RoutingEngine>, groups: Arc<GroupManager>) -> Self {
        Self { engine, groups }
    }

    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.engine
    }

    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }

    /// Route a request and select an instance for the route
    pub async fn dispatch(
        &self,
        request: &RouteRequest,
        token_count: u64,
        catalog: &ProviderCatalog,
        last_usage: Option<&Value>,
    ) -> Dispatch {
        let result = self
            .engine
            .evaluate(request, token_count, catalog, last_usage)
            .await;

        let Some(group) = self.groups.group_for_route(&result.route) else {
            return Dispatch {
                result,
                group: None,
                instance: None,
            };
        };

        let instance = match self.groups.select_instance(&group) {
            Ok(instance) => instance,
            Err(e) => {
                // Group removed between lookup and selection
                tracing::warn!(group = %group, error = %e, "Instance selection failed");
                None
            }
        };
        if instance.is_none() {
            tracing::warn!(group = %group, route = %result.route, "No instance available for route");
        }

        Dispatch {
            result,
            group: Some(group),
            instance,
        }
    }

    /// Release the instance held by a dispatch
    pub fn release(&self, dispatch: &Dispatch) -> Result<()> {
        match (&dispatch.group, &dispatch.instance) {
            (Some(group), Some(instance)) => self.groups.release(group, &instance.id),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstanceRegistryConfig, RouterConfig};
    use crate::rule::{RouteAction, RouteCondition, RouteRule};
    use serde_json::json;
    use std::time::Duration;

    fn dispatcher() -> RouteDispatcher {
        let config = RouterConfig::new("deepseek,deepseek-chat").with_rules(vec![RouteRule::new(
            "big",
            RouteCondition::tokens_above(1000.0),
            RouteAction::to("gemini,gemini-2.5-pro"),
        )]);
        let engine = Arc::new(RoutingEngine::new(config).unwrap());
        let groups = Arc::new(GroupManager::new());
        groups
            .add_group(
                "long",
                vec!["gemini,gemini-2.5-pro".to_string()],
                InstanceRegistryConfig::default().with_health_check_interval(Duration::ZERO),
            )
            .unwrap();
        RouteDispatcher::new(engine, groups)
    }

    #[tokio::test]
    async fn test_grouped_route_selects_instance() {
        let dispatcher = dispatcher();
        let request = RouteRequest::new(json!({"model": "m"}));

        let dispatch = dispatcher
            .dispatch(&request, 5000, &ProviderCatalog::default(), None)
            .await;

        assert_eq!(dispatch.group.as_deref(), Some("long"));
        let instance = dispatch.instance.clone().unwrap();
        assert_eq!(instance.route, "gemini,gemini-2.5-pro");
        assert_eq!(instance.connection_count, 1);

        dispatcher.release(&dispatch).unwrap();
        let info = dispatcher.groups().get_group("long").unwrap();
        assert_eq!(info.instances[0].connection_count, 0);
    }

    #[tokio::test]
    async fn test_ungrouped_route_has_no_instance() {
        let dispatcher = dispatcher();
        let request = RouteRequest::new(json!({"model": "m"}));

        let dispatch = dispatcher
            .dispatch(&request, 10, &ProviderCatalog::default(), None)
            .await;

        assert_eq!(dispatch.result.route, "deepseek,deepseek-chat");
        assert!(dispatch.group.is_none());
        assert!(dispatch.instance.is_none());
        assert!(dispatcher.release(&dispatch).is_ok());
    }
}
