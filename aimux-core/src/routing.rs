//! Capability- and health-aware provider selection.
//!
//! The router reads health through a non-owning registry handle, filters by
//! capability and capacity, then applies the configured priority. Every
//! decision carries its reasoning and the surviving alternatives in
//! balanced-score order so the failover loop can walk them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::analyzer::RequestDescriptor;
use crate::balancer::{Candidate, LoadBalancer};
use crate::monitor::{ProviderEntry, ProviderRegistry};

/// Selection policy applied to the filtered candidate list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPriority {
    Cost,
    Performance,
    Reliability,
    #[default]
    Balanced,
    Custom,
}

impl RoutingPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingPriority::Cost => "cost",
            RoutingPriority::Performance => "performance",
            RoutingPriority::Reliability => "reliability",
            RoutingPriority::Balanced => "balanced",
            RoutingPriority::Custom => "custom",
        }
    }
}

/// Caller-provided selection hook for `RoutingPriority::Custom`.
pub trait PrioritySelector: Send + Sync {
    fn select(&self, candidates: &[Candidate], descriptor: &RequestDescriptor) -> Option<String>;
}

/// Outcome of one routing pass. `selected` is empty when nothing survived
/// filtering; `alternatives` never contains `selected`.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub selected: String,
    pub priority: RoutingPriority,
    pub alternatives: Vec<String>,
    pub score: f64,
    pub reasoning: String,
}

impl RoutingDecision {
    fn none(priority: RoutingPriority, reasoning: String) -> Self {
        Self {
            selected: String::new(),
            priority,
            alternatives: Vec::new(),
            score: 0.0,
            reasoning,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// Counters over routing outcomes, reported under `/metrics`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RoutingMetricsSnapshot {
    pub total_routings: u64,
    pub selections_by_provider: HashMap<String, u64>,
    pub usage_by_priority: HashMap<String, u64>,
}

pub struct RoutingLogic {
    registry: Arc<ProviderRegistry>,
    balancer: Arc<dyn LoadBalancer>,
    custom_selector: Option<Arc<dyn PrioritySelector>>,
    relax_on_no_capability: bool,
    metrics: Mutex<RoutingMetricsSnapshot>,
}

impl RoutingLogic {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        balancer: Arc<dyn LoadBalancer>,
        relax_on_no_capability: bool,
    ) -> Self {
        Self {
            registry,
            balancer,
            custom_selector: None,
            relax_on_no_capability,
            metrics: Mutex::new(RoutingMetricsSnapshot::default()),
        }
    }

    pub fn with_custom_selector(mut self, selector: Arc<dyn PrioritySelector>) -> Self {
        self.custom_selector = Some(selector);
        self
    }

    pub fn metrics(&self) -> RoutingMetricsSnapshot {
        self.metrics.lock().expect("routing metrics lock poisoned").clone()
    }

    pub fn route(&self, descriptor: &RequestDescriptor, priority: RoutingPriority) -> RoutingDecision {
        let mut reasons: Vec<String> = Vec::new();

        let accepting = self.registry.accepting();
        if accepting.is_empty() {
            let decision =
                RoutingDecision::none(priority, "no healthy providers registered".to_string());
            self.record(&decision, priority);
            return decision;
        }

        // Capability filter, with the relaxation fallback.
        let capable: Vec<&Arc<ProviderEntry>> = accepting
            .iter()
            .filter(|e| {
                e.config
                    .capabilities
                    .contains_all(descriptor.required_capabilities)
            })
            .collect();
        let pool: Vec<&Arc<ProviderEntry>> = if capable.is_empty() {
            if !self.relax_on_no_capability {
                let decision = RoutingDecision::none(
                    priority,
                    "no provider satisfies required capabilities".to_string(),
                );
                self.record(&decision, priority);
                return decision;
            }
            reasons.push("capability-unmet, relaxed to full healthy set".to_string());
            accepting.iter().collect()
        } else {
            capable
        };

        // Capacity filter: drop providers whose next request would overflow
        // their per-minute budget or their concurrency limit.
        let within_capacity: Vec<&Arc<ProviderEntry>> = pool
            .iter()
            .copied()
            .filter(|e| {
                e.health.requests_per_minute() + 1 <= e.config.max_requests_per_minute
                    && e.health.inflight() < e.config.max_concurrent
            })
            .collect();
        if within_capacity.is_empty() {
            let decision = RoutingDecision::none(
                priority,
                "all capable providers are at their request-per-minute cap".to_string(),
            );
            self.record(&decision, priority);
            return decision;
        }

        let candidates: Vec<Candidate> = within_capacity
            .iter()
            .map(|e| candidate_of(e))
            .collect();

        let selected = match priority {
            RoutingPriority::Cost => {
                reasons.push("lowest output-token cost".to_string());
                argmin(&candidates, |c| c.cost_per_output_1k)
            }
            RoutingPriority::Performance => {
                reasons.push("lowest average response time".to_string());
                argmin(&candidates, |c| c.avg_response_ms)
            }
            RoutingPriority::Reliability => {
                reasons.push("highest success rate".to_string());
                argmin(&candidates, |c| -c.success_rate)
            }
            RoutingPriority::Balanced => match self.balancer.select(&candidates, descriptor) {
                Some(name) => {
                    reasons.push(format!("balanced via {} balancer", self.balancer.name()));
                    Some(name)
                }
                None => {
                    reasons.push("balancer abstained, falling back to scalar score".to_string());
                    argmin(&candidates, |c| -balanced_score(c, priority))
                }
            },
            RoutingPriority::Custom => match &self.custom_selector {
                Some(selector) => {
                    reasons.push("custom selector".to_string());
                    selector
                        .select(&candidates, descriptor)
                        .filter(|name| candidates.iter().any(|c| &c.name == name))
                }
                None => {
                    reasons.push("custom priority without selector, using balanced score".to_string());
                    argmin(&candidates, |c| -balanced_score(c, priority))
                }
            },
        };

        let Some(selected) = selected else {
            let decision =
                RoutingDecision::none(priority, "selection yielded no provider".to_string());
            self.record(&decision, priority);
            return decision;
        };

        let score = candidates
            .iter()
            .find(|c| c.name == selected)
            .map(|c| balanced_score(c, priority).clamp(0.0, 1.0))
            .unwrap_or(0.0);

        // Alternatives: everything else, best balanced score first.
        let mut rest: Vec<&Candidate> =
            candidates.iter().filter(|c| c.name != selected).collect();
        rest.sort_by(|a, b| {
            balanced_score(b, priority)
                .partial_cmp(&balanced_score(a, priority))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let alternatives: Vec<String> = rest.into_iter().map(|c| c.name.clone()).collect();

        reasons.push(format!("selected '{selected}'"));
        let decision = RoutingDecision {
            selected,
            priority,
            alternatives,
            score,
            reasoning: reasons.join("; "),
        };
        self.record(&decision, priority);
        decision
    }

    fn record(&self, decision: &RoutingDecision, priority: RoutingPriority) {
        let mut metrics = self.metrics.lock().expect("routing metrics lock poisoned");
        metrics.total_routings += 1;
        *metrics
            .usage_by_priority
            .entry(priority.as_str().to_string())
            .or_insert(0) += 1;
        if !decision.selected.is_empty() {
            *metrics
                .selections_by_provider
                .entry(decision.selected.clone())
                .or_insert(0) += 1;
        }
    }
}

fn candidate_of(entry: &Arc<ProviderEntry>) -> Candidate {
    Candidate {
        name: entry.config.name.clone(),
        success_rate: entry.health.success_rate(),
        avg_response_ms: entry.health.avg_response_ms(),
        performance_score: entry.health.performance_score(),
        cost_score: entry.health.cost_score(),
        cost_per_output_1k: entry.health.cost_per_output_1k(),
        cost_total_1k: entry.health.cost_total_1k(),
        requests_per_minute: entry.health.requests_per_minute(),
        priority_score: entry.config.priority_score,
    }
}

/// First candidate with the minimal key; input order breaks ties.
fn argmin<F: Fn(&Candidate) -> f64>(candidates: &[Candidate], key: F) -> Option<String> {
    let mut best: Option<(&Candidate, f64)> = None;
    for candidate in candidates {
        let value = key(candidate);
        match &best {
            Some((_, current)) if value >= *current => {}
            _ => best = Some((candidate, value)),
        }
    }
    best.map(|(c, _)| c.name.clone())
}

/// Scalar score used for the balanced fallback and alternative ordering:
/// 0.4 on success rate, 0.3 on performance, plus a priority-specific bonus.
fn balanced_score(candidate: &Candidate, priority: RoutingPriority) -> f64 {
    let base = 0.4 * candidate.success_rate + 0.3 * candidate.performance_score;
    let latency_headroom = ((5000.0 - candidate.avg_response_ms) / 4000.0).clamp(0.0, 1.0);
    let bonus = match priority {
        RoutingPriority::Cost => 0.3 * candidate.cost_score,
        RoutingPriority::Performance => 0.3 * latency_headroom,
        RoutingPriority::Reliability => 0.3 * candidate.success_rate,
        RoutingPriority::Balanced | RoutingPriority::Custom => {
            0.15 * candidate.cost_score + 0.15 * latency_headroom
        }
    };
    base + bonus
}
