//! Prometheus metrics for routing decisions and instance health
//!
//! [`RoutingMetrics`] implements [`RoutingObserver`], so attaching it to a
//! `RoutingEngine` or `GroupManager` is enough to populate every series.

use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use switchboard_routing::{DEFAULT_RULE_LABEL, InstanceStatus, RouteInstance, RouteResult, RoutingObserver};

/// Gauge value reported for an instance status
pub fn status_value(status: InstanceStatus) -> f64 {
    match status {
        InstanceStatus::Healthy => 0.0,
        InstanceStatus::Unhealthy => 1.0,
        InstanceStatus::Draining => 2.0,
    }
}

/// Routing metrics collector
#[derive(Clone)]
pub struct RoutingMetrics {
    registry: Arc<Registry>,

    pub decisions_total: CounterVec,
    pub cache_total: CounterVec,
    pub fallbacks_total: Counter,
    pub decision_seconds: Histogram,

    pub instance_selections_total: CounterVec,
    /// 0 healthy, 1 unhealthy, 2 draining
    pub instance_status: GaugeVec,
}

impl RoutingMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let decisions_total = CounterVec::new(
            Opts::new(
                "switchboard_routing_decisions_total",
                "Total number of routing decisions by deciding rule",
            ),
            &["rule"],
        )?;

        let cache_total = CounterVec::new(
            Opts::new(
                "switchboard_routing_cache_total",
                "Routing result cache lookups by outcome",
            ),
            &["outcome"],
        )?;

        let fallbacks_total = Counter::with_opts(Opts::new(
            "switchboard_routing_fallbacks_total",
            "Total number of evaluations that failed and used the default route",
        ))?;

        let decision_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "switchboard_routing_decision_seconds",
                "Time spent computing uncached routing decisions",
            )
            .buckets(vec![
                0.0001, 0.00025, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0,
            ]),
        )?;

        let instance_selections_total = CounterVec::new(
            Opts::new(
                "switchboard_instance_selections_total",
                "Total number of instances handed out per group",
            ),
            &["group"],
        )?;

        let instance_status = GaugeVec::new(
            Opts::new(
                "switchboard_instance_status",
                "Instance status (0=healthy, 1=unhealthy, 2=draining)",
            ),
            &["group", "instance"],
        )?;

        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(cache_total.clone()))?;
        registry.register(Box::new(fallbacks_total.clone()))?;
        registry.register(Box::new(decision_seconds.clone()))?;
        registry.register(Box::new(instance_selections_total.clone()))?;
        registry.register(Box::new(instance_status.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            decisions_total,
            cache_total,
            fallbacks_total,
            decision_seconds,
            instance_selections_total,
            instance_status,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl RoutingObserver for RoutingMetrics {
    fn on_decision(&self, result: &RouteResult) {
        if result.is_fallback() {
            self.fallbacks_total.inc();
            return;
        }

        let rule = result.matched_rule.as_deref().unwrap_or(DEFAULT_RULE_LABEL);
        self.decisions_total.with_label_values(&[rule]).inc();

        if result.from_cache {
            self.cache_total.with_label_values(&["hit"]).inc();
        } else {
            self.cache_total.with_label_values(&["miss"]).inc();
            self.decision_seconds.observe(result.decision_time_ms / 1000.0);
        }
    }

    fn on_instance_selected(&self, group: &str, _instance: &RouteInstance) {
        self.instance_selections_total
            .with_label_values(&[group])
            .inc();
    }

    fn on_instance_status(&self, group: &str, instance: &RouteInstance) {
        self.instance_status
            .with_label_values(&[group, instance.id.as_str()])
            .set(status_value(instance.status));
    }

    fn on_instance_removed(&self, group: &str, instance_id: &str) {
        if let Err(e) = self.instance_status.remove_label_values(&[group, instance_id]) {
            tracing::debug!(group = %group, instance_id = %instance_id, error = %e, "No status series to remove");
        }
    }
}

impl std::fmt::Debug for RoutingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_routing::RouteMetadata;

    fn decision(rule: Option<&str>, from_cache: bool) -> RouteResult {
        RouteResult {
            route: "gemini,gemini-2.5-pro".to_string(),
            matched_rule: rule.map(str::to_string),
            transformers: Vec::new(),
            decision_time_ms: 2.0,
            from_cache,
            metadata: RouteMetadata::default(),
        }
    }

    fn counter_value(metrics: &RoutingMetrics, name: &str, label: (&str, &str)) -> f64 {
        let gathered = metrics.registry().gather();
        let family = gathered
            .iter()
            .find(|m| m.name() == name)
            .unwrap_or_else(|| panic!("{name} metric not found"));
        let metric = family
            .metric
            .iter()
            .find(|m| m.label.iter().any(|l| l.name() == label.0 && l.value() == label.1))
            .unwrap_or_else(|| panic!("{name}{{{}={}}} not found", label.0, label.1));
        metric.counter.as_ref().unwrap().value.unwrap()
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = RoutingMetrics::new().unwrap();
        // Plain counters and histograms are exported before any observation
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_decisions_and_cache_outcomes() {
        let metrics = RoutingMetrics::new().unwrap();
        metrics.on_decision(&decision(Some("longContext"), false));
        metrics.on_decision(&decision(Some("longContext"), true));
        metrics.on_decision(&decision(None, false));

        assert_eq!(counter_value(&metrics, "switchboard_routing_decisions_total", ("rule", "longContext")), 2.0);
        assert_eq!(counter_value(&metrics, "switchboard_routing_decisions_total", ("rule", "default")), 1.0);
        assert_eq!(counter_value(&metrics, "switchboard_routing_cache_total", ("outcome", "hit")), 1.0);
        assert_eq!(counter_value(&metrics, "switchboard_routing_cache_total", ("outcome", "miss")), 2.0);

        let gathered = metrics.registry().gather();
        let histogram = gathered
            .iter()
            .find(|m| m.name() == "switchboard_routing_decision_seconds")
            .expect("decision_seconds metric not found")
            .metric[0]
            .histogram
            .as_ref()
            .unwrap()
            .clone();
        // Cache hits are not timed
        assert_eq!(histogram.sample_count.unwrap(), 2);
        assert!((histogram.sample_sum.unwrap() - 0.004).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_counted_separately() {
        let metrics = RoutingMetrics::new().unwrap();
        metrics.on_decision(&RouteResult::fallback("deepseek,deepseek-chat", "boom", 0.5));

        assert_eq!(metrics.fallbacks_total.get(), 1.0);
        let gathered = metrics.registry().gather();
        let decisions = gathered
            .iter()
            .find(|m| m.name() == "switchboard_routing_decisions_total");
        assert!(decisions.is_none_or(|m| m.metric.is_empty()));
    }

    #[test]
    fn test_instance_status_gauge_lifecycle() {
        let metrics = RoutingMetrics::new().unwrap();
        let mut instance = RouteInstance::new("inst_a", "openrouter,claude");

        metrics.on_instance_status("claude", &instance);
        assert_eq!(
            metrics.instance_status.with_label_values(&["claude", "inst_a"]).get(),
            0.0
        );

        instance.status = InstanceStatus::Draining;
        metrics.on_instance_status("claude", &instance);
        assert_eq!(
            metrics.instance_status.with_label_values(&["claude", "inst_a"]).get(),
            2.0
        );

        metrics.on_instance_removed("claude", "inst_a");
        let text = metrics.gather_text().unwrap();
        assert!(!text.contains("inst_a"));

        // Removing twice is harmless
        metrics.on_instance_removed("claude", "inst_a");
    }

    #[test]
    fn test_selections_per_group() {
        let metrics = RoutingMetrics::new().unwrap();
        let instance = RouteInstance::new("inst_a", "gemini,flash");
        metrics.on_instance_selected("fast", &instance);
        metrics.on_instance_selected("fast", &instance);

        assert_eq!(counter_value(&metrics, "switchboard_instance_selections_total", ("group", "fast")), 2.0);
    }

    #[test]
    fn test_gather_text_exposition() {
        let metrics = RoutingMetrics::new().unwrap();
        metrics.on_decision(&decision(Some("background"), false));

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("# TYPE switchboard_routing_decisions_total counter"));
        assert!(text.contains("switchboard_routing_decisions_total{rule=\"background\"} 1"));
    }
}
