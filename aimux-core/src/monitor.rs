//! Provider registry and the background health monitor.
//!
//! The registry maps provider names to their config, transport and health
//! handle. The `GatewayManager` owns it; the monitor and the routing logic
//! hold non-owning `Arc` handles - routing reads health, never the other way
//! around.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::ProviderConfig;
use crate::health::{HealthStatus, ProviderHealth};
use crate::transport::ProviderTransport;

/// One registered provider: config, transport and shared health state.
pub struct ProviderEntry {
    pub config: ProviderConfig,
    pub transport: Arc<dyn ProviderTransport>,
    pub health: Arc<ProviderHealth>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    entries: DashMap<String, Arc<ProviderEntry>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: ProviderConfig, transport: Arc<dyn ProviderTransport>) {
        let health = Arc::new(ProviderHealth::new(
            config.name.clone(),
            config.failure_threshold,
            config.recovery_delay,
            config.required_probes,
            config.cost_per_input_1k,
            config.cost_per_output_1k,
        ));
        let name = config.name.clone();
        self.entries.insert(
            name,
            Arc::new(ProviderEntry {
                config,
                transport,
                health,
            }),
        );
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderEntry>> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<Arc<ProviderEntry>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Enabled providers currently accepting traffic, sorted by descending
    /// priority score so downstream tie-breaks follow configuration.
    pub fn accepting(&self) -> Vec<Arc<ProviderEntry>> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| e.value().clone())
            .filter(|e| e.config.enabled && e.health.can_accept_requests())
            .collect();
        entries.sort_by(|a, b| {
            b.config
                .priority_score
                .partial_cmp(&a.config.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.config.name.cmp(&b.config.name))
        });
        entries
    }

    pub fn healthy_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.value().config.enabled && e.value().health.is_healthy())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn unhealthy_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.value().config.enabled || !e.value().health.is_healthy())
            .map(|e| e.key().clone())
            .collect()
    }
}

/// Background prober enforcing circuit transitions.
///
/// A single task wakes on `check_interval`; providers past their probe
/// interval get a real upstream probe, and open circuits past their recovery
/// delay get a half-open probe attempt. Probes run on their own tasks so a
/// slow upstream never stalls the sweep, and a per-provider in-flight flag
/// keeps probes from overlapping.
pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    check_interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ProviderRegistry>, check_interval: Duration) -> Self {
        Self {
            registry,
            check_interval,
        }
    }

    /// Spawn the monitor loop. The task runs until aborted through the
    /// returned handle; dropping the handle detaches it.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    /// One monitor pass over the registry. Public for tests.
    pub fn sweep(&self) {
        for entry in self.registry.entries() {
            if !entry.config.enabled {
                continue;
            }
            let due = match entry.health.status() {
                HealthStatus::CircuitOpen => entry.health.recovery_due(),
                _ => entry.health.probe_due(entry.config.probe_interval),
            };
            if !due || !entry.health.mark_probe_started() {
                continue;
            }
            tokio::spawn(async move {
                let name = entry.config.name.clone();
                match entry.transport.probe().await {
                    Ok(latency_ms) => {
                        tracing::debug!(provider = %name, latency_ms, "probe succeeded");
                        entry.health.mark_success(latency_ms);
                    }
                    Err(e) => {
                        tracing::warn!(provider = %name, error = %e, "probe failed");
                        entry.health.mark_failure(None);
                    }
                }
                entry.health.mark_probe_finished();
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted transports shared by the core test suites.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::{json, Value};

    use crate::error::GatewayError;
    use crate::models::{ApiFormat, ProviderResponse, Usage};
    use crate::transport::{ChunkStream, ProviderTransport};

    /// Outcome script for one `send` call.
    #[derive(Clone)]
    pub enum Scripted {
        Ok(Value),
        Status(u16, Value),
    }

    /// Transport that replays a scripted sequence of responses, then repeats
    /// the last one. Records how many sends it served.
    pub struct ScriptedTransport {
        name: String,
        format: ApiFormat,
        script: Mutex<VecDeque<Scripted>>,
        fallback: Scripted,
        pub sends: AtomicUsize,
        pub probes: AtomicUsize,
        pub last_body: Mutex<Option<Value>>,
        probe_ok: bool,
    }

    impl ScriptedTransport {
        pub fn new(name: &str, format: ApiFormat, script: Vec<Scripted>) -> Self {
            Self {
                name: name.to_string(),
                format,
                fallback: script.last().cloned().unwrap_or(Scripted::Ok(json!({}))),
                script: Mutex::new(script.into()),
                sends: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                last_body: Mutex::new(None),
                probe_ok: true,
            }
        }

        pub fn always_ok(name: &str, format: ApiFormat) -> Self {
            let body = json!({
                "id": format!("{name}-resp"),
                "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
            });
            Self::new(name, format, vec![Scripted::Ok(body)])
        }

        pub fn always_failing(name: &str, format: ApiFormat, status: u16) -> Self {
            let mut t = Self::new(
                name,
                format,
                vec![Scripted::Status(
                    status,
                    json!({"error": {"message": "scripted failure"}}),
                )],
            );
            t.probe_ok = false;
            t
        }

        pub fn with_probe_ok(mut self, ok: bool) -> Self {
            self.probe_ok = ok;
            self
        }
    }

    #[async_trait::async_trait]
    impl ProviderTransport for ScriptedTransport {
        fn name(&self) -> &str {
            &self.name
        }

        fn wire_format(&self) -> ApiFormat {
            self.format
        }

        async fn send(&self, body: &Value) -> Result<ProviderResponse, GatewayError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            *self.last_body.lock().unwrap() = Some(body.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            let (status, body) = match next {
                Scripted::Ok(body) => (200, body),
                Scripted::Status(status, body) => (status, body),
            };
            let success = (200..300).contains(&status);
            Ok(ProviderResponse {
                success,
                status,
                provider: self.name.clone(),
                usage: success.then(|| Usage::from_body(&body)).flatten(),
                body,
                response_time_ms: 5,
            })
        }

        async fn send_stream(&self, _body: &Value) -> Result<ChunkStream, GatewayError> {
            let chunks = vec![
                json!({"choices": [{"delta": {"content": "he"}}]}),
                json!({"choices": [{"delta": {"content": "llo"}}]}),
            ];
            Ok(Box::pin(futures::stream::iter(
                chunks.into_iter().map(Ok).collect::<Vec<_>>(),
            )))
        }

        async fn probe(&self) -> Result<u64, GatewayError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_ok {
                Ok(3)
            } else {
                Err(GatewayError::Provider {
                    provider: self.name.clone(),
                    status: 503,
                    message: "probe down".to_string(),
                    retryable: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedTransport;
    use super::*;
    use crate::models::ApiFormat;
    use std::sync::Arc;

    fn config(name: &str, priority: f64) -> ProviderConfig {
        let mut c = ProviderConfig::new(
            name,
            "https://api.example.com",
            "sk-test-0123456789abcdef",
            ApiFormat::OpenAi,
        )
        .with_models(vec!["m".into()]);
        c.priority_score = priority;
        c
    }

    #[test]
    fn accepting_sorts_by_priority_desc() {
        let registry = ProviderRegistry::new();
        registry.insert(
            config("low", 1.0),
            Arc::new(ScriptedTransport::always_ok("low", ApiFormat::OpenAi)),
        );
        registry.insert(
            config("high", 9.0),
            Arc::new(ScriptedTransport::always_ok("high", ApiFormat::OpenAi)),
        );
        let names: Vec<String> = registry
            .accepting()
            .iter()
            .map(|e| e.config.name.clone())
            .collect();
        assert_eq!(names, ["high", "low"]);
    }

    #[test]
    fn disabled_providers_are_not_accepting() {
        let registry = ProviderRegistry::new();
        let mut c = config("off", 1.0);
        c.enabled = false;
        registry.insert(
            c,
            Arc::new(ScriptedTransport::always_ok("off", ApiFormat::OpenAi)),
        );
        assert!(registry.accepting().is_empty());
        assert_eq!(registry.unhealthy_names(), vec!["off".to_string()]);
    }

    #[tokio::test]
    async fn sweep_probes_providers_and_records_outcomes() {
        let registry = Arc::new(ProviderRegistry::new());
        let up = Arc::new(ScriptedTransport::always_ok("up", ApiFormat::OpenAi));
        let down = Arc::new(ScriptedTransport::always_failing(
            "down",
            ApiFormat::OpenAi,
            503,
        ));
        registry.insert(config("up", 0.0), up.clone());
        registry.insert(config("down", 0.0), down.clone());

        let monitor = HealthMonitor::new(registry.clone(), Duration::from_secs(5));
        monitor.sweep();
        // Let the spawned probe tasks settle.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(up.probes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(down.probes.load(std::sync::atomic::Ordering::SeqCst), 1);
        let down_entry = registry.get("down").unwrap();
        assert_eq!(down_entry.health.snapshot().consecutive_failures, 1);

        // A second immediate sweep is a no-op: nothing is due yet.
        monitor.sweep();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(up.probes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removing_a_provider_does_not_disturb_others() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.insert(
            config("a", 0.0),
            Arc::new(ScriptedTransport::always_ok("a", ApiFormat::OpenAi)),
        );
        registry.insert(
            config("b", 0.0),
            Arc::new(ScriptedTransport::always_ok("b", ApiFormat::OpenAi)),
        );
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.contains("b"));
        assert_eq!(registry.len(), 1);
    }
}
