//! Instance registry
//!
//! Tracks the backend instances serving one or more routes, their health and
//! their open connections, and hands out instances with the configured
//! [`LoadBalancingStrategy`](crate::LoadBalancingStrategy).
//!
//! Status transitions:
//!
//! - `healthy ⇄ unhealthy`, driven by the periodic health check
//! - `healthy | unhealthy → draining → deleted`, driven by
//!   [`InstanceRegistry::remove_instance`]; deletion happens once the
//!   instance has no open connections
//!
//! `draining` is terminal: the instance only leaves it by being deleted.
//!
//! Only healthy instances are selectable. The health check timer and drain
//! pollers are tokio tasks holding a weak reference to the registry; they are
//! aborted by [`InstanceRegistry::stop`] and when the registry is dropped.

use crate::config::InstanceRegistryConfig;
use crate::observer::RoutingObserver;
use crate::strategy::StrategyError;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use switchboard_core::{Error, Result};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Instance health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
    /// Scheduled for removal; serves in-flight connections only
    Draining,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// One addressable backend endpoint for a route
#[derive(Debug, Clone, Serialize)]
pub struct RouteInstance {
    pub id: String,
    /// `provider,model` served by this instance
    pub route: String,
    pub status: InstanceStatus,
    #[serde(skip)]
    pub last_used: Instant,
    /// When `status` last changed
    #[serde(skip)]
    pub status_changed: Instant,
    pub connection_count: u32,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl RouteInstance {
    /// Create a healthy, idle instance
    pub fn new(id: impl Into<String>, route: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            route: route.into(),
            status: InstanceStatus::Healthy,
            last_used: now,
            status_changed: now,
            connection_count: 0,
            metadata: Map::new(),
        }
    }

    /// Set the metadata
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Time since the instance was last selected (or created)
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Time spent in the current status
    pub fn status_age(&self) -> Duration {
        self.status_changed.elapsed()
    }

    fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.status_changed = Instant::now();
    }

    pub fn is_selectable(&self) -> bool {
        self.status == InstanceStatus::Healthy
    }
}

/// Decides whether an instance is healthy
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, instance: &RouteInstance) -> Result<bool>;
}

/// Activity based health check
///
/// An instance is healthy while it has been used within the recovery window
/// and its connection count stays below the ceiling.
///
/// An instance that went unhealthy while idle gets another chance once it
/// has been unhealthy for a full recovery window. It then stays healthy
/// until it is used again, so idleness alone degrades it once per idle
/// stretch.
#[derive(Debug, Clone)]
pub struct ActivityHealthCheck {
    recovery_window: Duration,
    max_connections: u32,
}

impl ActivityHealthCheck {
    pub fn new(recovery_window: Duration, max_connections: u32) -> Self {
        Self {
            recovery_window,
            max_connections,
        }
    }

    pub fn from_config(config: &InstanceRegistryConfig) -> Self {
        Self::new(config.recovery_timeout(), config.max_connections)
    }
}

#[async_trait]
impl HealthCheck for ActivityHealthCheck {
    async fn check(&self, instance: &RouteInstance) -> Result<bool> {
        if instance.connection_count >= self.max_connections {
            return Ok(false);
        }
        if instance.idle_for() < self.recovery_window {
            return Ok(true);
        }

        // Status changed after the last use: the idle penalty was already applied
        let changed_since_use = instance.status_changed > instance.last_used;
        Ok(match instance.status {
            InstanceStatus::Healthy => changed_since_use,
            InstanceStatus::Unhealthy => changed_since_use && instance.status_age() >= self.recovery_window,
            InstanceStatus::Draining => false,
        })
    }
}

/// Label used in logs when a registry does not belong to a group
const UNGROUPED: &str = "ungrouped";

struct RegistryState {
    group: String,
    config: InstanceRegistryConfig,
    instances: Mutex<Vec<RouteInstance>>,
    health_check: Arc<dyn HealthCheck>,
    observer: Option<Arc<dyn RoutingObserver>>,
    torn_down: AtomicBool,
}

impl RegistryState {
    fn lock(&self) -> MutexGuard<'_, Vec<RouteInstance>> {
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify_status(&self, instance: &RouteInstance) {
        if let Some(observer) = &self.observer {
            observer.on_instance_status(&self.group, instance);
        }
    }

    /// Check every non-draining instance and apply genuine transitions
    async fn run_health_check(&self) {
        let snapshot: Vec<RouteInstance> = self
            .lock()
            .iter()
            .filter(|instance| instance.status != InstanceStatus::Draining)
            .cloned()
            .collect();

        if snapshot.is_empty() {
            return;
        }

        let timeout = self.config.health_check_timeout();
        let outcomes = join_all(snapshot.iter().map(|instance| async move {
            let outcome = match tokio::time::timeout(timeout, self.health_check.check(instance)).await {
                Ok(Ok(healthy)) => Ok(healthy),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
            };
            (instance.id.clone(), outcome)
        }))
        .await;

        let mut changed = Vec::new();
        {
            let mut instances = self.lock();
            for (id, outcome) in outcomes {
                let Some(instance) = instances.iter_mut().find(|i| i.id == id) else {
                    continue;
                };
                // Removal started while the check was running
                if instance.status == InstanceStatus::Draining {
                    continue;
                }

                let next = match outcome {
                    Ok(true) => InstanceStatus::Healthy,
                    Ok(false) => InstanceStatus::Unhealthy,
                    Err(e) => {
                        tracing::error!(
                            group = %self.group,
                            instance_id = %id,
                            error = %e,
                            "Instance health check failed"
                        );
                        InstanceStatus::Unhealthy
                    }
                };

                if next == instance.status {
                    continue;
                }
                if next == InstanceStatus::Healthy {
                    tracing::info!(group = %self.group, instance_id = %id, route = %instance.route, "Instance recovered");
                } else {
                    tracing::warn!(group = %self.group, instance_id = %id, route = %instance.route, "Instance became unhealthy");
                }
                instance.set_status(next);
                changed.push(instance.clone());
            }
        }

        for instance in &changed {
            self.notify_status(instance);
        }
    }

    /// Report every remaining instance as removed; runs once
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(observer) = &self.observer else {
            return;
        };
        let ids: Vec<String> = self.lock().iter().map(|i| i.id.clone()).collect();
        for id in &ids {
            observer.on_instance_removed(&self.group, id);
        }
    }

    /// Delete a draining instance once idle; returns true when nothing is left to wait for
    fn finish_drain(&self, id: &str) -> bool {
        let mut instances = self.lock();
        let Some(index) = instances.iter().position(|i| i.id == id) else {
            return true;
        };
        if instances[index].status != InstanceStatus::Draining {
            return true;
        }
        if instances[index].connection_count > 0 {
            return false;
        }

        let removed = instances.remove(index);
        drop(instances);

        tracing::info!(group = %self.group, instance_id = %removed.id, route = %removed.route, "Removed instance");
        if let Some(observer) = &self.observer {
            observer.on_instance_removed(&self.group, &removed.id);
        }
        true
    }
}

/// Builder for [`InstanceRegistry`]
pub struct InstanceRegistryBuilder {
    config: InstanceRegistryConfig,
    group: Option<String>,
    health_check: Option<Arc<dyn HealthCheck>>,
    observer: Option<Arc<dyn RoutingObserver>>,
}

impl InstanceRegistryBuilder {
    /// Name of the owning group (used in logs and observer calls)
    pub fn group(mut self, name: impl Into<String>) -> Self {
        self.group = Some(name.into());
        self
    }

    /// Replace the default [`ActivityHealthCheck`]
    pub fn health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RoutingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Build the registry and start its health check timer
    pub fn build(self) -> InstanceRegistry {
        let health_check = self
            .health_check
            .unwrap_or_else(|| Arc::new(ActivityHealthCheck::from_config(&self.config)));

        let state = Arc::new(RegistryState {
            group: self.group.unwrap_or_else(|| UNGROUPED.to_string()),
            config: self.config,
            instances: Mutex::new(Vec::new()),
            health_check,
            observer: self.observer,
            torn_down: AtomicBool::new(false),
        });

        let registry = InstanceRegistry {
            state,
            tasks: Mutex::new(Vec::new()),
        };
        registry.start_health_check();
        registry
    }
}

/// Health-checked, load-balanced set of instances
pub struct InstanceRegistry {
    state: Arc<RegistryState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InstanceRegistry {
    /// Create a registry with the default health check
    pub fn new(config: InstanceRegistryConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: InstanceRegistryConfig) -> InstanceRegistryBuilder {
        InstanceRegistryBuilder {
            config,
            group: None,
            health_check: None,
            observer: None,
        }
    }

    pub fn config(&self) -> &InstanceRegistryConfig {
        &self.state.config
    }

    /// Add a healthy instance serving `route`; returns its ID
    pub fn add_instance(&self, route: impl Into<String>, metadata: Option<Map<String, Value>>) -> Result<String> {
        let route = route.into();
        let instance = {
            let mut instances = self.state.lock();
            if instances.len() >= self.state.config.max_instances {
                return Err(Error::CapacityExceeded {
                    max: self.state.config.max_instances,
                });
            }

            let id = format!("inst_{}", uuid::Uuid::new_v4().simple());
            let instance = RouteInstance::new(id, route).with_metadata(metadata.unwrap_or_default());
            instances.push(instance.clone());
            instance
        };

        tracing::info!(group = %self.state.group, instance_id = %instance.id, route = %instance.route, "Added instance");
        self.state.notify_status(&instance);
        Ok(instance.id)
    }

    /// Start removing an instance
    ///
    /// The instance turns `draining` immediately and is deleted once its
    /// connection count reaches zero. Returns without waiting. Removing an
    /// instance that is already draining is a no-op.
    pub fn remove_instance(&self, id: &str) -> Result<()> {
        if !self.transition(id, InstanceStatus::Draining)? {
            return Ok(());
        }

        match Handle::try_current() {
            Ok(handle) => {
                let weak: Weak<RegistryState> = Arc::downgrade(&self.state);
                let poll = self.state.config.drain_poll_interval();
                let id = id.to_string();
                let task = handle.spawn(async move {
                    let mut ticker = tokio::time::interval(poll);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let Some(state) = weak.upgrade() else { break };
                        if state.finish_drain(&id) {
                            break;
                        }
                    }
                });
                self.track(task);
            }
            Err(_) => {
                // Without a runtime the last release completes the removal
                self.state.finish_drain(id);
            }
        }
        Ok(())
    }

    /// Pick a healthy instance and open a connection on it
    pub fn select_instance(&self) -> Option<RouteInstance> {
        let selected = {
            let mut instances = self.state.lock();
            let healthy: Vec<usize> = instances
                .iter()
                .enumerate()
                .filter(|(_, instance)| instance.is_selectable())
                .map(|(i, _)| i)
                .collect();
            let candidates: Vec<&RouteInstance> = healthy.iter().map(|&i| &instances[i]).collect();

            match self.state.config.load_balancing.select(&candidates) {
                Ok(pick) => {
                    let instance = &mut instances[healthy[pick]];
                    instance.last_used = Instant::now();
                    instance.connection_count = instance.connection_count.saturating_add(1);
                    instance.clone()
                }
                Err(StrategyError::NoCandidates) => {
                    tracing::warn!(group = %self.state.group, "No healthy instances available");
                    return None;
                }
                Err(e) => {
                    tracing::error!(group = %self.state.group, error = %e, "Instance selection failed");
                    return None;
                }
            }
        };

        tracing::debug!(
            group = %self.state.group,
            instance_id = %selected.id,
            route = %selected.route,
            connections = selected.connection_count,
            "Selected instance"
        );
        if let Some(observer) = &self.state.observer {
            observer.on_instance_selected(&self.state.group, &selected);
        }
        Some(selected)
    }

    /// Close a connection opened by [`select_instance`](Self::select_instance)
    pub fn release_instance(&self, id: &str) -> Result<()> {
        let drained = {
            let mut instances = self.state.lock();
            let instance = instances
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
            instance.connection_count = instance.connection_count.saturating_sub(1);
            instance.status == InstanceStatus::Draining && instance.connection_count == 0
        };

        if drained {
            self.state.finish_drain(id);
        }
        Ok(())
    }

    /// Set an instance's status directly
    ///
    /// `Draining` starts a removal as [`remove_instance`](Self::remove_instance)
    /// does. A draining instance cannot be moved back to another status.
    pub fn update_instance_status(&self, id: &str, status: InstanceStatus) -> Result<()> {
        if status == InstanceStatus::Draining {
            return self.remove_instance(id);
        }
        self.transition(id, status).map(|_| ())
    }

    /// Apply a status change; returns false when the status is unchanged
    fn transition(&self, id: &str, status: InstanceStatus) -> Result<bool> {
        let instance = {
            let mut instances = self.state.lock();
            let instance = instances
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
            if instance.status == status {
                return Ok(false);
            }
            if instance.status == InstanceStatus::Draining {
                return Err(Error::InvalidRequest(format!(
                    "instance {id} is draining and cannot become {status}"
                )));
            }
            instance.set_status(status);
            instance.clone()
        };

        tracing::debug!(group = %self.state.group, instance_id = %id, status = %status, "Updated instance status");
        self.state.notify_status(&instance);
        Ok(true)
    }

    /// Run one health check pass over all instances
    pub async fn health_check(&self) {
        self.state.run_health_check().await;
    }

    /// Copy of all instances in insertion order
    pub fn instances(&self) -> Vec<RouteInstance> {
        self.state.lock().clone()
    }

    pub fn get_instance(&self, id: &str) -> Option<RouteInstance> {
        self.state.lock().iter().find(|i| i.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of selectable instances
    pub fn healthy_count(&self) -> usize {
        self.state.lock().iter().filter(|i| i.is_selectable()).count()
    }

    /// Stop the health check timer and pending drain pollers
    ///
    /// The observer sees every remaining instance as removed. Instances stay
    /// readable through [`instances`](Self::instances) afterwards.
    pub fn stop(&self) {
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if !tasks.is_empty() {
                tracing::debug!(group = %self.state.group, tasks = tasks.len(), "Stopping instance registry tasks");
            }
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.state.teardown();
    }

    fn start_health_check(&self) {
        let Some(interval) = self.state.config.health_check_interval() else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!(group = %self.state.group, "No tokio runtime, health checks disabled");
            return;
        };

        let weak = Arc::downgrade(&self.state);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else { break };
                state.run_health_check().await;
            }
        });
        self.track(task);
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}

impl Drop for InstanceRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("group", &self.state.group)
            .field("config", &self.state.config)
            .field("instances", &self.len())
            .finish()
    }
}
