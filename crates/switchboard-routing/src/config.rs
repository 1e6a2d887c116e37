//! Router and instance registry configuration
//!
//! Field names are snake_case. The camelCase spellings used by older
//! configuration files (`defaultRoute`, `maxSize`, `healthCheckInterval`, ...)
//! are accepted as aliases.

use crate::rule::RouteRule;
use crate::strategy::LoadBalancingStrategy;
use crate::variables::DEFAULT_SUBAGENT_TAG;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use switchboard_core::{Error, Result};

/// Routing engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Route used when no rule matches or evaluation fails
    #[serde(alias = "defaultRoute")]
    pub default_route: String,

    /// Routing rules
    #[serde(default)]
    pub rules: Vec<RouteRule>,

    /// Result cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Rule evaluation tracing
    #[serde(default)]
    pub debug: DebugConfig,

    /// Marker tag that carries a subagent route in a system block
    #[serde(default = "default_subagent_tag", alias = "subagentTag")]
    pub subagent_tag: String,

    /// Time budget for one external predicate call
    #[serde(default = "default_external_timeout_ms", alias = "externalTimeoutMs")]
    pub external_timeout_ms: u64,
}

/// Result cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of cached results
    #[serde(default = "default_cache_size", alias = "maxSize")]
    pub max_size: usize,

    /// Entry lifetime in milliseconds (0 = no expiry)
    #[serde(default = "default_cache_ttl_ms", alias = "ttl")]
    pub ttl_ms: u64,
}

/// Debug tracing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Trace every rule evaluation at debug level
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_log_level", alias = "logLevel")]
    pub log_level: String,
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> usize {
    1000
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_subagent_tag() -> String {
    DEFAULT_SUBAGENT_TAG.to_string()
}

fn default_external_timeout_ms() -> u64 {
    5000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_size: default_cache_size(),
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Caching turned off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_level: default_log_level(),
        }
    }
}

impl RouterConfig {
    /// Configuration with the given default route and no rules
    pub fn new(default_route: impl Into<String>) -> Self {
        Self {
            default_route: default_route.into(),
            rules: Vec::new(),
            cache: CacheConfig::default(),
            debug: DebugConfig::default(),
            subagent_tag: default_subagent_tag(),
            external_timeout_ms: default_external_timeout_ms(),
        }
    }

    /// Set the rules
    pub fn with_rules(mut self, rules: Vec<RouteRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Set the cache configuration
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Enable rule evaluation tracing
    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug.enabled = enabled;
        self
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_route.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "default_route cannot be empty".to_string(),
            ));
        }

        if self.cache.enabled && self.cache.max_size == 0 {
            return Err(Error::ConfigValidation(
                "cache.max_size must be greater than 0 when caching is enabled".to_string(),
            ));
        }

        if self.subagent_tag.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "subagent_tag cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(Error::ConfigValidation("rule name cannot be empty".to_string()));
            }
            if !seen.insert(rule.name.as_str()) {
                tracing::warn!(rule = %rule.name, "Duplicate rule name, the later rule replaces the earlier one");
            }
        }

        Ok(())
    }
}

/// Partial update for [`RouterConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfigPatch {
    #[serde(default, alias = "defaultRoute", skip_serializing_if = "Option::is_none")]
    pub default_route: Option<String>,
    /// Replaces the whole rule set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<RouteRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugConfig>,
    #[serde(default, alias = "subagentTag", skip_serializing_if = "Option::is_none")]
    pub subagent_tag: Option<String>,
    #[serde(default, alias = "externalTimeoutMs", skip_serializing_if = "Option::is_none")]
    pub external_timeout_ms: Option<u64>,
}

impl RouterConfigPatch {
    /// Apply the patch on top of `base`
    pub fn apply(&self, base: &RouterConfig) -> RouterConfig {
        RouterConfig {
            default_route: self
                .default_route
                .clone()
                .unwrap_or_else(|| base.default_route.clone()),
            rules: self.rules.clone().unwrap_or_else(|| base.rules.clone()),
            cache: self.cache.clone().unwrap_or_else(|| base.cache.clone()),
            debug: self.debug.clone().unwrap_or_else(|| base.debug.clone()),
            subagent_tag: self
                .subagent_tag
                .clone()
                .unwrap_or_else(|| base.subagent_tag.clone()),
            external_timeout_ms: self.external_timeout_ms.unwrap_or(base.external_timeout_ms),
        }
    }

    /// Patch that replaces the rules only
    pub fn rules(rules: Vec<RouteRule>) -> Self {
        Self {
            rules: Some(rules),
            ..Default::default()
        }
    }
}

impl From<RouterConfig> for RouterConfigPatch {
    fn from(config: RouterConfig) -> Self {
        Self {
            default_route: Some(config.default_route),
            rules: Some(config.rules),
            cache: Some(config.cache),
            debug: Some(config.debug),
            subagent_tag: Some(config.subagent_tag),
            external_timeout_ms: Some(config.external_timeout_ms),
        }
    }
}

/// Instance registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRegistryConfig {
    /// Maximum number of instances, draining ones included
    #[serde(default = "default_max_instances", alias = "maxInstances")]
    pub max_instances: usize,

    /// Health check period in milliseconds (0 disables the timer)
    #[serde(default = "default_health_check_interval_ms", alias = "healthCheckInterval")]
    pub health_check_interval_ms: u64,

    /// Budget for one instance's health check in milliseconds
    #[serde(default = "default_health_check_timeout_ms", alias = "healthCheckTimeout")]
    pub health_check_timeout_ms: u64,

    /// An instance idle for longer than this is considered unhealthy
    #[serde(default = "default_recovery_timeout_ms", alias = "recoveryTimeout")]
    pub recovery_timeout_ms: u64,

    /// Connection ceiling for a healthy instance
    #[serde(default = "default_max_connections", alias = "maxConnections")]
    pub max_connections: u32,

    /// How often a draining instance is checked for removal
    #[serde(default = "default_drain_poll_interval_ms", alias = "drainPollInterval")]
    pub drain_poll_interval_ms: u64,

    #[serde(default, alias = "loadBalancing")]
    pub load_balancing: LoadBalancingStrategy,
}

fn default_max_instances() -> usize {
    10
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_health_check_timeout_ms() -> u64 {
    5000
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_max_connections() -> u32 {
    100
}

fn default_drain_poll_interval_ms() -> u64 {
    1000
}

impl Default for InstanceRegistryConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            max_connections: default_max_connections(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
            load_balancing: LoadBalancingStrategy::default(),
        }
    }
}

impl InstanceRegistryConfig {
    /// Set the load balancing strategy
    pub fn with_load_balancing(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing = strategy;
        self
    }

    /// Set the health check interval (0 disables the timer)
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the recovery window
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the maximum number of instances
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    /// Health check period, `None` when disabled
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0).then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Drain poll period (at least 1ms)
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms.max(1))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_instances == 0 {
            return Err(Error::ConfigValidation(
                "max_instances must be greater than 0".to_string(),
            ));
        }
        if self.health_check_timeout_ms == 0 {
            return Err(Error::ConfigValidation(
                "health_check_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
