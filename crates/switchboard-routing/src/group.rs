//! Group manager
//!
//! A group is a named set of routes backed by one [`InstanceRegistry`] with
//! one instance per route. Callers select instances by group name; the
//! dispatcher finds the group of a resolved route through the reverse
//! route → group lookup.

use crate::config::InstanceRegistryConfig;
use crate::instance::{InstanceRegistry, RouteInstance};
use crate::observer::RoutingObserver;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use switchboard_core::{Error, Result};

struct Group {
    routes: Vec<String>,
    registry: Arc<InstanceRegistry>,
}

#[derive(Default)]
struct GroupTable {
    groups: HashMap<String, Group>,
    /// Route → owning group
    by_route: HashMap<String, String>,
}

impl GroupTable {
    fn detach(&mut self, name: &str) -> Option<Group> {
        let group = self.groups.remove(name)?;
        self.by_route.retain(|_, owner| owner != name);
        Some(group)
    }
}

/// Read-only view of a group
#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub routes: Vec<String>,
    pub instances: Vec<RouteInstance>,
}

/// Named groups of load-balanced routes
#[derive(Default)]
pub struct GroupManager {
    table: RwLock<GroupTable>,
    observer: Option<Arc<dyn RoutingObserver>>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report instance events of every group to `observer`
    pub fn with_observer(mut self, observer: Arc<dyn RoutingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Create a group with one instance per route
    ///
    /// An existing group with the same name is replaced and its registry
    /// stopped. A route already owned by another group is moved to this one.
    pub fn add_group(&self, name: &str, routes: Vec<String>, config: InstanceRegistryConfig) -> Result<()> {
        config.validate()?;
        if routes.len() > config.max_instances {
            return Err(Error::CapacityExceeded {
                max: config.max_instances,
            });
        }

        let mut builder = InstanceRegistry::builder(config).group(name);
        if let Some(observer) = &self.observer {
            builder = builder.observer(observer.clone());
        }
        let registry = builder.build();
        for route in &routes {
            registry.add_instance(route.clone(), None)?;
        }

        let replaced = {
            let mut table = self.write();
            let replaced = table.detach(name);
            for route in &routes {
                if let Some(previous) = table.by_route.insert(route.clone(), name.to_string()) {
                    if previous != name {
                        tracing::warn!(route = %route, from = %previous, to = %name, "Route moved between groups");
                    }
                }
            }
            table.groups.insert(
                name.to_string(),
                Group {
                    routes: routes.clone(),
                    registry: Arc::new(registry),
                },
            );
            replaced
        };

        if let Some(old) = replaced {
            old.registry.stop();
        }
        tracing::info!(group = %name, routes = routes.len(), "Added instance group");
        Ok(())
    }

    /// Remove a group and stop its registry
    ///
    /// The observer sees every instance of the group removed.
    pub fn remove_group(&self, name: &str) -> Result<()> {
        let group = self
            .write()
            .detach(name)
            .ok_or_else(|| Error::GroupNotFound(name.to_string()))?;

        group.registry.stop();
        tracing::info!(group = %name, "Removed instance group");
        Ok(())
    }

    /// Replace a group with a freshly built one
    pub fn update_group(&self, name: &str, routes: Vec<String>, config: InstanceRegistryConfig) -> Result<()> {
        // A missing group is fine; update doubles as create
        match self.remove_group(name) {
            Ok(()) | Err(Error::GroupNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.add_group(name, routes, config)
    }

    /// Select an instance from a group
    ///
    /// `Ok(None)` means the group exists but has no healthy instance.
    pub fn select_instance(&self, group: &str) -> Result<Option<RouteInstance>> {
        Ok(self.registry(group)?.select_instance())
    }

    /// Release a connection opened through [`select_instance`](Self::select_instance)
    pub fn release(&self, group: &str, instance_id: &str) -> Result<()> {
        self.registry(group)?.release_instance(instance_id)
    }

    /// Group owning `route`
    pub fn group_for_route(&self, route: &str) -> Option<String> {
        self.read().by_route.get(route).cloned()
    }

    /// Registry backing a group
    pub fn registry(&self, group: &str) -> Result<Arc<InstanceRegistry>> {
        self.read()
            .groups
            .get(group)
            .map(|g| g.registry.clone())
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))
    }

    pub fn get_group(&self, name: &str) -> Option<GroupInfo> {
        let table = self.read();
        table.groups.get(name).map(|group| GroupInfo {
            name: name.to_string(),
            routes: group.routes.clone(),
            instances: group.registry.instances(),
        })
    }

    /// Names of all groups, sorted
    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().groups.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every group and stop all registries
    pub fn shutdown(&self) {
        let groups: Vec<(String, Group)> = {
            let mut table = self.write();
            table.by_route.clear();
            table.groups.drain().collect()
        };

        for (name, group) in groups {
            group.registry.stop();
            tracing::debug!(group = %name, "Stopped instance group");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, GroupTable> {
        self.table.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GroupTable> {
        self.table.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupManager").field("groups", &self.groups()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceStatus;
    use std::time::Duration;

    fn config() -> InstanceRegistryConfig {
        InstanceRegistryConfig::default().with_health_check_interval(Duration::ZERO)
    }

    fn routes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_add_group_creates_instances() {
        let manager = GroupManager::new();
        manager
            .add_group("claude", routes(&["openrouter,claude", "anthropic,claude"]), config())
            .unwrap();

        let info = manager.get_group("claude").unwrap();
        assert_eq!(info.routes.len(), 2);
        assert_eq!(info.instances.len(), 2);
        assert!(info.instances.iter().all(|i| i.status == InstanceStatus::Healthy));

        assert_eq!(manager.group_for_route("anthropic,claude").as_deref(), Some("claude"));
        assert_eq!(manager.group_for_route("other,model"), None);
    }

    #[test]
    fn test_capacity_checked_before_creation() {
        let manager = GroupManager::new();
        let err = manager
            .add_group("g", routes(&["a,1", "b,2", "c,3"]), config().with_max_instances(2))
            .unwrap_err();

        assert!(matches!(err, Error::CapacityExceeded { max: 2 }));
        assert!(manager.is_empty());
        assert_eq!(manager.group_for_route("a,1"), None);
    }

    #[test]
    fn test_remove_group_clears_routes() {
        let manager = GroupManager::new();
        manager.add_group("g", routes(&["a,1"]), config()).unwrap();

        manager.remove_group("g").unwrap();
        assert!(manager.get_group("g").is_none());
        assert_eq!(manager.group_for_route("a,1"), None);
        assert!(matches!(manager.remove_group("g"), Err(Error::GroupNotFound(_))));
    }

    #[test]
    fn test_update_group_replaces_routes() {
        let manager = GroupManager::new();
        manager.add_group("g", routes(&["a,1", "b,2"]), config()).unwrap();
        manager.update_group("g", routes(&["c,3"]), config()).unwrap();

        assert_eq!(manager.group_for_route("a,1"), None);
        assert_eq!(manager.group_for_route("c,3").as_deref(), Some("g"));
        assert_eq!(manager.get_group("g").unwrap().instances.len(), 1);

        // Update of an unknown group creates it
        manager.update_group("h", routes(&["d,4"]), config()).unwrap();
        assert_eq!(manager.groups(), vec!["g".to_string(), "h".to_string()]);
    }

    #[test]
    fn test_select_and_release() {
        let manager = GroupManager::new();
        manager.add_group("g", routes(&["a,1"]), config()).unwrap();

        let instance = manager.select_instance("g").unwrap().unwrap();
        assert_eq!(instance.route, "a,1");
        assert_eq!(instance.connection_count, 1);

        manager.release("g", &instance.id).unwrap();
        let info = manager.get_group("g").unwrap();
        assert_eq!(info.instances[0].connection_count, 0);

        assert!(matches!(manager.select_instance("missing"), Err(Error::GroupNotFound(_))));
    }

    #[test]
    fn test_shutdown_removes_everything() {
        let manager = GroupManager::new();
        manager.add_group("g", routes(&["a,1"]), config()).unwrap();
        manager.add_group("h", routes(&["b,2"]), config()).unwrap();

        manager.shutdown();
        assert!(manager.is_empty());
        assert_eq!(manager.group_for_route("b,2"), None);
    }
}
