//! Load balancing strategies for instance selection
//!
//! ## Strategies
//!
//! ### Round-Robin
//! Picks the least recently used instance, so traffic rotates through every
//! healthy instance.
//!
//! ### Least-Connections
//! Picks the instance with the fewest open connections.
//!
//! ### Random
//! Picks uniformly at random.
//!
//! ### Weighted
//! Picks at random with probability proportional to the weight configured
//! for the instance's route. Routes without a weight count as weight 1.
//!
//! ```rust
//! use switchboard_routing::LoadBalancingStrategy;
//!
//! let strategy: LoadBalancingStrategy = serde_json::from_str(
//!     r#"{"type": "weighted", "weights": {"openrouter,claude": 3, "gemini,flash": 1}}"#,
//! ).unwrap();
//! assert_eq!(strategy.weight_for("openrouter,claude"), 3);
//! assert_eq!(strategy.weight_for("unlisted,model"), 1);
//! ```
//!
//! Ties in round-robin and least-connections go to the instance that was
//! added first.

use crate::instance::RouteInstance;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Load balancing strategy configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// Least recently used first
    #[default]
    RoundRobin,

    /// Fewest open connections first
    LeastConnections,

    /// Uniform random choice
    Random,

    /// Random choice weighted per route
    Weighted {
        /// Route → weight; missing routes weigh 1
        #[serde(default)]
        weights: HashMap<String, u32>,
    },
}

impl LoadBalancingStrategy {
    /// Strategy name as used in configuration
    pub fn name(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round-robin",
            LoadBalancingStrategy::LeastConnections => "least-connections",
            LoadBalancingStrategy::Random => "random",
            LoadBalancingStrategy::Weighted { .. } => "weighted",
        }
    }

    /// Weight used for `route`
    ///
    /// A configured weight of 0 counts as 1, like a missing weight.
    pub fn weight_for(&self, route: &str) -> u32 {
        match self {
            LoadBalancingStrategy::Weighted { weights } => {
                weights.get(route).copied().filter(|w| *w > 0).unwrap_or(1)
            }
            _ => 1,
        }
    }

    /// Pick one of `candidates`, returning its index
    pub fn select(&self, candidates: &[&RouteInstance]) -> Result<usize, StrategyError> {
        if candidates.is_empty() {
            return Err(StrategyError::NoCandidates);
        }

        let index = match self {
            LoadBalancingStrategy::RoundRobin => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, instance)| instance.last_used)
                .map(|(i, _)| i)
                .unwrap_or(0),

            LoadBalancingStrategy::LeastConnections => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, instance)| instance.connection_count)
                .map(|(i, _)| i)
                .unwrap_or(0),

            LoadBalancingStrategy::Random => rand::rng().random_range(0..candidates.len()),

            LoadBalancingStrategy::Weighted { .. } => self.select_weighted(candidates)?,
        };

        Ok(index)
    }

    fn select_weighted(&self, candidates: &[&RouteInstance]) -> Result<usize, StrategyError> {
        let total_weight = candidates
            .iter()
            .try_fold(0u64, |acc, instance| {
                acc.checked_add(u64::from(self.weight_for(&instance.route)))
            })
            .ok_or(StrategyError::WeightOverflow)?;

        let mut point = rand::rng().random_range(0..total_weight);
        for (index, instance) in candidates.iter().enumerate() {
            let weight = u64::from(self.weight_for(&instance.route));
            if point < weight {
                return Ok(index);
            }
            point -= weight;
        }

        Ok(0)
    }
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Strategy errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    #[error("No healthy instances to choose from")]
    NoCandidates,

    #[error("Total weight overflow")]
    WeightOverflow,
}
