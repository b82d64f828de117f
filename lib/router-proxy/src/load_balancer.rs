//! Load balancing strategies for distributing traffic across live instances

use rand::Rng;
use registry_core::Lease;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Round-robin: distribute requests evenly across instances
    #[default]
    RoundRobin,
    /// Random: pick uniformly at random
    Random,
}

/// Load balancer for selecting an instance based on a strategy
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    round_robin_counter: AtomicUsize,
}

impl LoadBalancer {
    /// Create a new load balancer with the specified strategy
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Select an instance, skipping instance ids in `exclude`
    pub fn select<'a>(&self, leases: &'a [Lease], exclude: &HashSet<String>) -> Option<&'a Lease> {
        let candidates: Vec<&'a Lease> = leases
            .iter()
            .filter(|lease| !exclude.contains(&lease.instance_id))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let index = match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            LoadBalancingStrategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
        };
        candidates.get(index).copied()
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancingStrategy::default())
    }
}
