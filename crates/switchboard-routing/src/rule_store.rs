//! Rule storage
//!
//! Rules live in an immutable [`RuleSet`] snapshot behind an `ArcSwap`.
//! Readers take the current snapshot without locking; every mutation builds
//! a new snapshot and swaps it in, so an evaluation in flight always sees a
//! complete rule set.

use crate::rule::RouteRule;
use arc_swap::ArcSwap;
use std::sync::Arc;

/// An immutable set of rules
///
/// Rules keep their insertion order; names are unique.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RouteRule>,
    /// Indices of enabled rules, highest priority first
    order: Vec<usize>,
}

impl RuleSet {
    /// Build a rule set; a later rule replaces an earlier one with the same name in place
    pub fn new(rules: impl IntoIterator<Item = RouteRule>) -> Self {
        let mut deduped: Vec<RouteRule> = Vec::new();
        for rule in rules {
            match deduped.iter_mut().find(|existing| existing.name == rule.name) {
                Some(existing) => *existing = rule,
                None => deduped.push(rule),
            }
        }
        Self::from_unique(deduped)
    }

    fn from_unique(rules: Vec<RouteRule>) -> Self {
        let mut order: Vec<usize> = (0..rules.len()).filter(|&i| rules[i].enabled).collect();
        // Stable sort: equal priorities keep insertion order
        order.sort_by(|&a, &b| rules[b].priority.cmp(&rules[a].priority));
        Self { rules, order }
    }

    /// All rules in insertion order
    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    /// Enabled rules in evaluation order
    pub fn evaluation_order(&self) -> impl Iterator<Item = &RouteRule> {
        self.order.iter().map(|&i| &self.rules[i])
    }

    /// Number of enabled rules
    pub fn enabled_count(&self) -> usize {
        self.order.len()
    }

    pub fn get(&self, name: &str) -> Option<&RouteRule> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn with_rule(&self, rule: RouteRule) -> Self {
        let mut rules = self.rules.clone();
        match rules.iter_mut().find(|existing| existing.name == rule.name) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        Self::from_unique(rules)
    }

    fn without_rule(&self, name: &str) -> Self {
        let rules = self
            .rules
            .iter()
            .filter(|rule| rule.name != name)
            .cloned()
            .collect();
        Self::from_unique(rules)
    }

    fn with_enabled(&self, name: &str, enabled: bool) -> Self {
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                if rule.name == name {
                    rule.clone().with_enabled(enabled)
                } else {
                    rule.clone()
                }
            })
            .collect();
        Self::from_unique(rules)
    }
}

/// Copy-on-write rule store shared between concurrent evaluations
#[derive(Debug)]
pub struct RuleStore {
    current: ArcSwap<RuleSet>,
}

impl RuleStore {
    pub fn new(rules: impl IntoIterator<Item = RouteRule>) -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::new(rules)),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Insert a rule, replacing any rule with the same name in place
    pub fn add_rule(&self, rule: RouteRule) {
        tracing::debug!(rule = %rule.name, priority = rule.priority, "Adding routing rule");
        self.current.rcu(|set| set.with_rule(rule.clone()));
    }

    /// Remove a rule by name; returns whether it existed
    pub fn remove_rule(&self, name: &str) -> bool {
        tracing::debug!(rule = %name, "Removing routing rule");
        let previous = self.current.rcu(|set| set.without_rule(name));
        previous.get(name).is_some()
    }

    /// Enable or disable a rule; returns whether it existed
    pub fn toggle_rule(&self, name: &str, enabled: bool) -> bool {
        let previous = self.current.rcu(|set| set.with_enabled(name, enabled));
        let found = previous.get(name).is_some();
        if found {
            tracing::debug!(rule = %name, enabled, "Toggled routing rule");
        }
        found
    }

    /// Replace the whole rule set atomically
    pub fn replace(&self, rules: impl IntoIterator<Item = RouteRule>) {
        let set = RuleSet::new(rules);
        tracing::info!(rules = set.len(), "Replaced routing rules");
        self.current.store(Arc::new(set));
    }

    /// Copy of all rules in insertion order
    pub fn rules(&self) -> Vec<RouteRule> {
        self.current.load().rules().to_vec()
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
