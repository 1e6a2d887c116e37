//! Observation hooks
//!
//! The routing crate reports decisions and instance changes through
//! [`RoutingObserver`]; metrics backends implement it. Every method has a
//! no-op default.

use crate::context::RouteResult;
use crate::instance::RouteInstance;

pub trait RoutingObserver: Send + Sync {
    /// A routing call finished (computed, cached or fallback)
    fn on_decision(&self, _result: &RouteResult) {}

    /// An instance was handed out by a registry
    fn on_instance_selected(&self, _group: &str, _instance: &RouteInstance) {}

    /// An instance was added or changed status
    fn on_instance_status(&self, _group: &str, _instance: &RouteInstance) {}

    /// An instance was deleted from its registry
    fn on_instance_removed(&self, _group: &str, _instance_id: &str) {}
}
