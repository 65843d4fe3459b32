//! Pluggable load-balancing strategies.
//!
//! Balancers only ever see candidates that already passed the health,
//! capability and capacity filters; they pick, they do not veto.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::analyzer::RequestDescriptor;

/// Snapshot of one eligible provider handed to a balancer or selector.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub success_rate: f64,
    pub avg_response_ms: f64,
    pub performance_score: f64,
    pub cost_score: f64,
    /// USD per 1K output tokens, the cost-priority sort key
    pub cost_per_output_1k: f64,
    /// Combined input+output cost per 1K tokens
    pub cost_total_1k: f64,
    pub requests_per_minute: u32,
    pub priority_score: f64,
}

/// A provider-selection strategy over a pre-filtered candidate list.
pub trait LoadBalancer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick one candidate, or `None` when the list is empty.
    fn select(&self, candidates: &[Candidate], descriptor: &RequestDescriptor) -> Option<String>;
}

/// Config-selectable balancer variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerKind {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
}

impl LoadBalancerKind {
    pub fn build(self) -> std::sync::Arc<dyn LoadBalancer> {
        match self {
            LoadBalancerKind::RoundRobin => std::sync::Arc::new(RoundRobinBalancer::new()),
            LoadBalancerKind::Weighted => std::sync::Arc::new(WeightedBalancer),
            LoadBalancerKind::LeastConnections => std::sync::Arc::new(LeastConnectionsBalancer),
        }
    }
}

/// Atomic counter modulo candidate count.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, candidates: &[Candidate], _descriptor: &RequestDescriptor) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].name.clone())
    }
}

/// Proportional random draw over
/// `performance * success * (1000/latency) * (1/cost)`.
#[derive(Debug, Default)]
pub struct WeightedBalancer;

impl WeightedBalancer {
    fn weight(candidate: &Candidate) -> f64 {
        let latency_factor = 1000.0 / candidate.avg_response_ms.max(1.0);
        let cost_factor = 1.0 / candidate.cost_total_1k.max(1e-3);
        (candidate.performance_score * candidate.success_rate * latency_factor * cost_factor)
            .max(0.0)
    }
}

impl LoadBalancer for WeightedBalancer {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn select(&self, candidates: &[Candidate], _descriptor: &RequestDescriptor) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let weights: Vec<f64> = candidates.iter().map(Self::weight).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Some(candidates[0].name.clone());
        }

        let draw: f64 = rand::thread_rng().gen_range(0.0..total);
        let mut cumulative = 0.0;
        for (candidate, weight) in candidates.iter().zip(&weights) {
            cumulative += weight;
            if draw < cumulative {
                return Some(candidate.name.clone());
            }
        }
        Some(candidates[candidates.len() - 1].name.clone())
    }
}

/// Smallest requests-per-minute counter wins; ties keep input order.
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer;

impl LoadBalancer for LeastConnectionsBalancer {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select(&self, candidates: &[Candidate], _descriptor: &RequestDescriptor) -> Option<String> {
        candidates
            .iter()
            .min_by_key(|c| c.requests_per_minute)
            .map(|c| c.name.clone())
    }
}
