//! Gateway configuration document

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use switchboard_core::{Error, ProviderCatalog, ProviderEntry, Result};
use switchboard_observability::LoggingConfig;
use switchboard_routing::{
    GroupManager, InstanceRegistryConfig, LegacyRouterConfig, RouterConfig, is_legacy_router,
    migrate_legacy_config,
};
use tracing::{debug, info};

const ROUTER_KEYS: &[&str] = &["router", "Router"];

/// An instance group declared in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Routes served by the group; one instance is created per route
    pub routes: Vec<String>,
    #[serde(default)]
    pub registry: InstanceRegistryConfig,
}

/// Top-level configuration file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default, alias = "Providers")]
    pub providers: Vec<ProviderEntry>,

    #[serde(alias = "Router")]
    pub router: RouterConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Parse a raw document, migrating a slot-based router section
    pub fn from_value(mut value: Value) -> Result<Self> {
        let object = value
            .as_object_mut()
            .ok_or_else(|| Error::Config("Configuration must be an object".to_string()))?;

        if let Some(key) = ROUTER_KEYS.iter().find(|key| object.contains_key(**key))
            && let Some(section) = object.get(*key)
            && is_legacy_router(section)
        {
            let legacy: LegacyRouterConfig = serde_json::from_value(section.clone())
                .map_err(|e| Error::Config(format!("Invalid legacy router section: {e}")))?;
            let migrated = migrate_legacy_config(&legacy);
            info!(
                rules = migrated.rules.len(),
                default_route = %migrated.default_route,
                "Migrated legacy router configuration to rules"
            );
            object.insert((*key).to_string(), serde_json::to_value(migrated)?);
        }

        let config: GatewayConfig = serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
        debug!(
            providers = config.providers.len(),
            rules = config.router.rules.len(),
            groups = config.groups.len(),
            "Parsed gateway configuration"
        );
        Ok(config)
    }

    /// Provider catalog for provider/model resolution
    pub fn catalog(&self) -> ProviderCatalog {
        ProviderCatalog::new(self.providers.clone())
    }

    /// Check the router, every group, and cross-section consistency
    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;

        let mut providers = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(Error::ConfigValidation("provider name must not be empty".to_string()));
            }
            if !providers.insert(provider.name.as_str()) {
                return Err(Error::ConfigValidation(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
        }

        let mut groups = HashSet::new();
        let mut routes = HashSet::new();
        for group in &self.groups {
            if group.name.is_empty() {
                return Err(Error::ConfigValidation("group name must not be empty".to_string()));
            }
            if !groups.insert(group.name.as_str()) {
                return Err(Error::ConfigValidation(format!("duplicate group '{}'", group.name)));
            }
            if group.routes.is_empty() {
                return Err(Error::ConfigValidation(format!(
                    "group '{}' has no routes",
                    group.name
                )));
            }
            for route in &group.routes {
                if !routes.insert(route.as_str()) {
                    return Err(Error::ConfigValidation(format!(
                        "route '{route}' belongs to more than one group"
                    )));
                }
            }
            group.registry.validate()?;
            if group.routes.len() > group.registry.max_instances {
                return Err(Error::ConfigValidation(format!(
                    "group '{}' has {} routes but allows at most {} instances",
                    group.name,
                    group.routes.len(),
                    group.registry.max_instances
                )));
            }
        }

        Ok(())
    }

    /// Register every configured group with `manager`
    pub fn apply_groups(&self, manager: &GroupManager) -> Result<()> {
        for group in &self.groups {
            manager.add_group(&group.name, group.routes.clone(), group.registry.clone())?;
        }
        Ok(())
    }
}
