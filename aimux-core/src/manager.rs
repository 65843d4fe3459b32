//! The gateway orchestrator: provider registration, the
//! route -> attempt -> observe -> failover loop, and request metrics.
//!
//! The manager owns the provider registry; the routing logic and the health
//! monitor hold non-owning handles to it. Per attempt it translates the
//! client body into the provider's wire format, dispatches through the
//! transport, feeds the outcome back into health and metrics, and walks the
//! decision's alternatives on retryable failures - bounded by the fan-out
//! cap so a bad day upstream cannot multiply client latency indefinitely.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::analyzer::{RequestAnalyzer, RequestType};
use crate::config::{GatewayConfig, ProviderConfig};
use crate::error::GatewayError;
use crate::health::HealthSnapshot;
use crate::models::ApiFormat;
use crate::monitor::{HealthMonitor, ProviderRegistry};
use crate::routing::{RoutingDecision, RoutingLogic, RoutingMetricsSnapshot};
use crate::streaming::{
    ChunkFormatter, CrossFormatChunkFormatter, StreamContext, StreamId, StreamingProcessor,
};
use crate::transform::{ApiTransformer, ModelMap, TransformWarning};
use crate::transport::{HttpTransport, ProviderTransport};

/// A settled dispatch: the provider's response translated back to the
/// client's format, plus gateway metadata for the response headers.
#[derive(Debug)]
pub struct GatewayReply {
    pub body: Value,
    pub provider: String,
    pub status: u16,
    pub response_time_ms: u64,
    pub warnings: Vec<TransformWarning>,
}

/// Handle for an established upstream stream: the manager pumps upstream
/// chunks through the streaming processor; the caller drains `events`.
pub struct StreamHandle {
    pub stream_id: StreamId,
    pub provider: String,
    /// Time to establish the upstream stream, in milliseconds
    pub establish_ms: u64,
    pub events: tokio::sync::mpsc::UnboundedReceiver<Value>,
}

/// One completed request, appended to the bounded metrics ring.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetric {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub provider: String,
    pub success: bool,
    pub status: u16,
    pub duration_ms: u64,
    pub routing_reason: String,
    pub token_estimate: u64,
}

/// Aggregates computed on read over the metrics ring.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub requests_by_provider: HashMap<String, u64>,
    pub routing: RoutingMetricsSnapshot,
    pub uptime_seconds: u64,
    pub recent: Vec<RequestMetric>,
}

/// Model listing entry aggregated from healthy providers.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
}

pub struct GatewayManager {
    config: RwLock<GatewayConfig>,
    registry: Arc<ProviderRegistry>,
    routing: RwLock<Arc<RoutingLogic>>,
    analyzer: RequestAnalyzer,
    transformer: Arc<ApiTransformer>,
    streaming: Arc<StreamingProcessor>,
    metrics: Mutex<VecDeque<RequestMetric>>,
    started_at: Instant,
}

impl GatewayManager {
    /// Build a manager from config, registering every enabled provider.
    /// The health monitor is not started here; call [`spawn_monitor`].
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>, GatewayError> {
        let registry = Arc::new(ProviderRegistry::new());
        let transformer = Arc::new(ApiTransformer::new(
            ModelMap::new(config.model_map.clone()),
            config.preserve_unknown_fields,
        ));
        let routing = Arc::new(RoutingLogic::new(
            registry.clone(),
            config.routing.load_balancer.build(),
            config.routing.relax_on_no_capability,
        ));
        let streaming = Arc::new(StreamingProcessor::new(config.streaming.clone()));

        let manager = Arc::new(Self {
            registry,
            routing: RwLock::new(routing),
            analyzer: RequestAnalyzer::new(),
            transformer,
            streaming,
            metrics: Mutex::new(VecDeque::new()),
            started_at: Instant::now(),
            config: RwLock::new(config.clone()),
        });

        for provider in config.providers.into_values() {
            if provider.enabled {
                manager.add_provider(provider)?;
            }
        }
        Ok(manager)
    }

    /// Start the background health monitor. Abort through the returned
    /// handle to stop it; dropping the handle detaches the task.
    pub fn spawn_monitor(&self) -> tokio::task::JoinHandle<()> {
        let interval = self.config.read().expect("config lock").check_interval;
        HealthMonitor::new(self.registry.clone(), interval).spawn()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn transformer(&self) -> &Arc<ApiTransformer> {
        &self.transformer
    }

    pub fn streaming(&self) -> &Arc<StreamingProcessor> {
        &self.streaming
    }

    /// Validate and register a provider, creating its HTTP transport.
    pub fn add_provider(&self, config: ProviderConfig) -> Result<(), GatewayError> {
        validate_provider_config(&config)?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        self.register_transport(config, transport)
    }

    /// Register a provider with a caller-supplied transport. Used by tests
    /// and embedders with non-HTTP upstreams.
    pub fn register_transport(
        &self,
        config: ProviderConfig,
        transport: Arc<dyn ProviderTransport>,
    ) -> Result<(), GatewayError> {
        validate_provider_config(&config)?;
        tracing::info!(provider = %config.name, base_url = %config.base_url, "provider registered");
        self.registry.insert(config, transport);
        Ok(())
    }

    pub fn remove_provider(&self, name: &str) -> bool {
        let removed = self.registry.remove(name);
        if removed {
            tracing::info!(provider = %name, "provider removed");
        }
        removed
    }

    /// The canonical dispatch loop for a non-streaming request.
    pub async fn route_request(
        &self,
        body: &Value,
        client_format: ApiFormat,
        deadline: Option<Duration>,
    ) -> Result<GatewayReply, GatewayError> {
        validate_inbound(body, client_format)?;
        let descriptor = self.analyzer.analyze_value(body);
        let decision = self.route(&descriptor);
        if decision.is_empty() {
            return Err(GatewayError::NoProvider {
                reason: decision.reasoning,
            });
        }

        let deadline_at = deadline.map(|d| Instant::now() + d);
        let attempt_order = self.attempt_order(&decision, descriptor.request_type);
        let mut errors: Vec<String> = Vec::new();
        let mut attempts = 0usize;

        for name in attempt_order {
            let Some(entry) = self.registry.get(&name) else {
                continue;
            };
            if !entry.health.can_accept_requests() {
                errors.push(format!("{name}: circuit open"));
                continue;
            }

            // Inbound translation failure is the client's 400, not a failover.
            let (upstream_body, warnings) = self
                .transformer
                .transform_request(body, client_format, entry.config.format)
                .map_err(GatewayError::RequestTransform)?;

            if let Some(at) = deadline_at {
                if Instant::now() >= at {
                    return Err(GatewayError::DeadlineExceeded);
                }
            }

            attempts += 1;
            entry.health.record_admission();
            let started = Instant::now();
            let send = entry.transport.send(&upstream_body);
            let outcome = match deadline_at {
                Some(at) => {
                    match tokio::time::timeout(at.saturating_duration_since(started), send).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            // Deadline elapsed mid-attempt: record the
                            // timeout and stop, no further attempts.
                            entry.health.finish_request();
                            entry.health.mark_failure(None);
                            self.record_metric(&name, false, 408, started, &decision, &descriptor);
                            return Err(GatewayError::DeadlineExceeded);
                        }
                    }
                }
                None => send.await,
            };

            match outcome {
                Ok(response) if response.success => {
                    entry.health.finish_request();
                    entry.health.mark_success(response.response_time_ms);
                    self.record_metric(&name, true, response.status, started, &decision, &descriptor);
                    let (client_body, mut response_warnings) = self
                        .transformer
                        .transform_response(&response.body, client_format, entry.config.format)
                        .map_err(GatewayError::ResponseTransform)?;
                    let mut all_warnings = warnings;
                    all_warnings.append(&mut response_warnings);
                    return Ok(GatewayReply {
                        body: client_body,
                        provider: name,
                        status: response.status,
                        response_time_ms: response.response_time_ms,
                        warnings: all_warnings,
                    });
                }
                Ok(response) => {
                    entry.health.finish_request();
                    entry.health.mark_failure(Some(response.response_time_ms));
                    self.record_metric(&name, false, response.status, started, &decision, &descriptor);
                    if response.is_retryable_failure() {
                        errors.push(format!("{name}: upstream status {}", response.status));
                        continue;
                    }
                    // Terminal 4xx goes straight back to the client with
                    // provider context; error envelopes pass through
                    // translation untouched.
                    let (client_body, _) = self
                        .transformer
                        .transform_response(&response.body, client_format, entry.config.format)
                        .unwrap_or((response.body.clone(), Vec::new()));
                    return Ok(GatewayReply {
                        body: client_body,
                        provider: name,
                        status: response.status,
                        response_time_ms: response.response_time_ms,
                        warnings,
                    });
                }
                Err(e) => {
                    entry.health.finish_request();
                    entry.health.mark_failure(None);
                    self.record_metric(&name, false, 0, started, &decision, &descriptor);
                    tracing::warn!(provider = %name, error = %e, "transport failure");
                    errors.push(format!("{name}: {e}"));
                    if !e.is_retryable() {
                        return Err(e);
                    }
                }
            }
        }

        Err(GatewayError::AllProvidersFailed { attempts, errors })
    }

    /// Establish an upstream stream and pump its chunks through the
    /// streaming processor. Failover applies only until the stream is
    /// established; after the first chunk the provider is committed.
    pub async fn route_stream(
        &self,
        body: &Value,
        client_format: ApiFormat,
    ) -> Result<StreamHandle, GatewayError> {
        validate_inbound(body, client_format)?;
        let descriptor = self.analyzer.analyze_value(body);
        let decision = self.route(&descriptor);
        if decision.is_empty() {
            return Err(GatewayError::NoProvider {
                reason: decision.reasoning,
            });
        }

        let attempt_order = self.attempt_order(&decision, descriptor.request_type);
        let mut errors: Vec<String> = Vec::new();
        let mut attempts = 0usize;

        for name in attempt_order {
            let Some(entry) = self.registry.get(&name) else {
                continue;
            };
            if !entry.health.can_accept_requests() {
                errors.push(format!("{name}: circuit open"));
                continue;
            }

            let (mut upstream_body, _) = self
                .transformer
                .transform_request(body, client_format, entry.config.format)
                .map_err(GatewayError::RequestTransform)?;
            if let Some(map) = upstream_body.as_object_mut() {
                map.insert("stream".to_string(), Value::Bool(true));
            }

            attempts += 1;
            entry.health.record_admission();
            let started = Instant::now();
            match entry.transport.send_stream(&upstream_body).await {
                Ok(mut chunks) => {
                    let establish_ms = started.elapsed().as_millis() as u64;
                    entry.health.finish_request();
                    entry.health.mark_success(establish_ms);
                    self.record_metric(&name, true, 200, started, &decision, &descriptor);

                    let model = body.get("model").and_then(Value::as_str).unwrap_or_default();
                    let context = StreamContext {
                        request_id: Uuid::new_v4().to_string(),
                        provider: name.clone(),
                        model: model.to_string(),
                        client_format,
                        provider_format: entry.config.format,
                    };
                    let formatter: Arc<dyn ChunkFormatter> = Arc::new(CrossFormatChunkFormatter);
                    let (stream_id, events) = self.streaming.create_stream(context, formatter)?;

                    let processor = self.streaming.clone();
                    let provider = name.clone();
                    tokio::spawn(async move {
                        use futures::StreamExt;
                        while let Some(chunk) = chunks.next().await {
                            match chunk {
                                Ok(value) => {
                                    if !processor.process_chunk(stream_id, value, false).await {
                                        tracing::warn!(
                                            provider = %provider,
                                            stream_id = %stream_id,
                                            "chunk dropped under backpressure"
                                        );
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(provider = %provider, error = %e, "upstream stream error");
                                    processor.cancel(stream_id).await;
                                    return;
                                }
                            }
                        }
                        // Upstream done: admit the end-of-stream marker.
                        processor.process_chunk(stream_id, Value::Null, true).await;
                    });

                    return Ok(StreamHandle {
                        stream_id,
                        provider: name,
                        establish_ms,
                        events,
                    });
                }
                Err(e) => {
                    entry.health.finish_request();
                    entry.health.mark_failure(None);
                    self.record_metric(&name, false, 0, started, &decision, &descriptor);
                    errors.push(format!("{name}: {e}"));
                    if !e.is_retryable() {
                        return Err(e);
                    }
                }
            }
        }

        Err(GatewayError::AllProvidersFailed { attempts, errors })
    }

    fn route(&self, descriptor: &crate::analyzer::RequestDescriptor) -> RoutingDecision {
        let priority = self.config.read().expect("config lock").routing.priority;
        let routing = self.routing.read().expect("routing lock").clone();
        routing.route(descriptor, priority)
    }

    /// Attempt order: specialist pin (if any) first, then the selection,
    /// then alternatives - deduplicated and capped at 1 + fan-out.
    fn attempt_order(&self, decision: &RoutingDecision, request_type: RequestType) -> Vec<String> {
        let config = self.config.read().expect("config lock");
        let pin = match request_type {
            RequestType::Thinking => config.thinking_provider.clone(),
            RequestType::Multimodal => config.vision_provider.clone(),
            RequestType::Tools => config.tools_provider.clone(),
            _ => None,
        }
        .or_else(|| config.default_provider.clone())
        .filter(|name| {
            self.registry
                .get(name)
                .is_some_and(|e| e.config.enabled && e.health.can_accept_requests())
        });
        let cap = 1 + config.routing.fan_out_cap;
        drop(config);

        let mut order = Vec::new();
        let mut push = |name: String| {
            if !name.is_empty() && !order.contains(&name) {
                order.push(name);
            }
        };
        if let Some(pin) = pin {
            push(pin);
        }
        push(decision.selected.clone());
        for alt in &decision.alternatives {
            push(alt.clone());
        }
        order.truncate(cap);
        order
    }

    fn record_metric(
        &self,
        provider: &str,
        success: bool,
        status: u16,
        started: Instant,
        decision: &RoutingDecision,
        descriptor: &crate::analyzer::RequestDescriptor,
    ) {
        let capacity = self.config.read().expect("config lock").metrics_capacity;
        let mut ring = self.metrics.lock().expect("metrics lock poisoned");
        if ring.len() >= capacity {
            ring.pop_front();
        }
        ring.push_back(RequestMetric {
            timestamp: chrono::Utc::now(),
            provider: provider.to_string(),
            success,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            routing_reason: decision.reasoning.clone(),
            token_estimate: descriptor.token_estimate,
        });
    }

    pub fn get_metrics(&self) -> MetricsReport {
        let ring = self.metrics.lock().expect("metrics lock poisoned");
        let total = ring.len() as u64;
        let successful = ring.iter().filter(|m| m.success).count() as u64;
        let avg_duration_ms = if total > 0 {
            ring.iter().map(|m| m.duration_ms as f64).sum::<f64>() / total as f64
        } else {
            0.0
        };
        let mut by_provider: HashMap<String, u64> = HashMap::new();
        for metric in ring.iter() {
            *by_provider.entry(metric.provider.clone()).or_insert(0) += 1;
        }
        let routing = self.routing.read().expect("routing lock").metrics();
        MetricsReport {
            total_requests: total,
            successful_requests: successful,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            avg_duration_ms,
            requests_by_provider: by_provider,
            routing,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            recent: ring.iter().cloned().collect(),
        }
    }

    pub fn healthy_providers(&self) -> Vec<String> {
        self.registry.healthy_names()
    }

    pub fn unhealthy_providers(&self) -> Vec<String> {
        self.registry.unhealthy_names()
    }

    pub fn health_snapshots(&self) -> HashMap<String, HealthSnapshot> {
        self.registry
            .entries()
            .into_iter()
            .map(|e| (e.config.name.clone(), e.health.snapshot()))
            .collect()
    }

    /// Aggregated model list across providers currently accepting traffic.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        let mut models = Vec::new();
        for entry in self.registry.accepting() {
            for model in &entry.config.models {
                models.push(ModelInfo {
                    id: model.clone(),
                    provider: entry.config.name.clone(),
                });
            }
        }
        models
    }

    pub fn config_snapshot(&self) -> GatewayConfig {
        self.config.read().expect("config lock").clone()
    }

    /// Swap in a new configuration: re-register providers, reload the model
    /// map snapshot, and rebuild routing with the new strategy.
    pub fn load_config(&self, config: GatewayConfig) -> Result<(), GatewayError> {
        for provider in config.providers.values() {
            validate_provider_config(provider)?;
        }

        for name in self
            .registry
            .entries()
            .iter()
            .map(|e| e.config.name.clone())
            .collect::<Vec<_>>()
        {
            self.registry.remove(&name);
        }
        for provider in config.providers.values() {
            if provider.enabled {
                self.add_provider(provider.clone())?;
            }
        }

        self.transformer
            .reload_model_map(ModelMap::new(config.model_map.clone()));
        *self.routing.write().expect("routing lock") = Arc::new(RoutingLogic::new(
            self.registry.clone(),
            config.routing.load_balancer.build(),
            config.routing.relax_on_no_capability,
        ));
        *self.config.write().expect("config lock") = config;
        tracing::info!("configuration reloaded");
        Ok(())
    }
}

fn validate_inbound(body: &Value, client_format: ApiFormat) -> Result<(), GatewayError> {
    if client_format == ApiFormat::Unknown {
        return Err(GatewayError::Validation {
            message: "could not determine request format".to_string(),
        });
    }
    let messages = body.get("messages").and_then(Value::as_array);
    match messages {
        Some(messages) if !messages.is_empty() => Ok(()),
        Some(_) => Err(GatewayError::Validation {
            message: "messages must not be empty".to_string(),
        }),
        None => Err(GatewayError::Validation {
            message: "request has no messages array".to_string(),
        }),
    }
}

/// Admission checks for provider registration.
fn validate_provider_config(config: &ProviderConfig) -> Result<(), GatewayError> {
    let name_ok = !config.name.is_empty()
        && config.name.len() <= 64
        && config
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !name_ok {
        return Err(GatewayError::Config {
            message: format!("invalid provider name '{}'", config.name),
        });
    }

    let url = &config.base_url;
    let host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    let url_ok = host.is_some_and(|rest| {
        let host = rest.split('/').next().unwrap_or("");
        !host.is_empty() && !host.contains(char::is_whitespace)
    });
    if !url_ok {
        return Err(GatewayError::Config {
            message: format!("invalid base url '{url}' for provider '{}'", config.name),
        });
    }

    let credential_ok =
        config.credential.len() >= 16 && config.credential.chars().any(|c| c.is_ascii_alphanumeric());
    if !credential_ok {
        return Err(GatewayError::Config {
            message: format!("invalid credential for provider '{}'", config.name),
        });
    }

    if config.models.is_empty() {
        return Err(GatewayError::Config {
            message: format!("provider '{}' lists no models", config.name),
        });
    }
    Ok(())
}
