//! Configuration types for the dispatch engine.
//!
//! These are the logical config entities; file loading and the server
//! section live in the gateway crate. Durations serialize as "300s"-style
//! strings so TOML configs stay readable.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::LoadBalancerKind;
use crate::capability::CapabilitySet;
use crate::models::ApiFormat;
use crate::routing::RoutingPriority;
use crate::transform::ModelPair;

/// Registration data for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique name, `[A-Za-z0-9_-]{1,64}`
    pub name: String,
    /// http(s) endpoint the transport talks to
    pub base_url: String,
    /// Opaque credential handle (>= 16 chars, at least one alphanumeric)
    pub credential: String,
    /// Wire format this provider speaks
    #[serde(default = "default_format")]
    pub format: ApiFormat,
    /// Models served by this provider; must not be empty
    pub models: Vec<String>,
    #[serde(default = "CapabilitySet::all")]
    pub capabilities: CapabilitySet,
    /// Tie-break ordering for candidates; higher first
    #[serde(default)]
    pub priority_score: f64,
    /// USD per 1K input tokens
    #[serde(default)]
    pub cost_per_input_1k: f64,
    /// USD per 1K output tokens
    #[serde(default)]
    pub cost_per_output_1k: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_max_rpm")]
    pub max_requests_per_minute: u32,
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit blocks traffic
    #[serde(default = "default_recovery_delay", with = "duration_serde")]
    pub recovery_delay: Duration,
    /// Successful probes needed to close the circuit
    #[serde(default = "default_required_probes")]
    pub required_probes: u32,
    /// How often the monitor probes this provider
    #[serde(default = "default_probe_interval", with = "duration_serde")]
    pub probe_interval: Duration,
    /// Per-attempt upstream timeout
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ProviderConfig {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        credential: impl Into<String>,
        format: ApiFormat,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            credential: credential.into(),
            format,
            models: Vec::new(),
            capabilities: CapabilitySet::all(),
            priority_score: 0.0,
            cost_per_input_1k: 0.0,
            cost_per_output_1k: 0.0,
            max_concurrent: default_max_concurrent(),
            max_requests_per_minute: default_max_rpm(),
            failure_threshold: default_failure_threshold(),
            recovery_delay: default_recovery_delay(),
            required_probes: default_required_probes(),
            probe_interval: default_probe_interval(),
            request_timeout: default_request_timeout(),
            enabled: default_enabled(),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }
}

fn default_format() -> ApiFormat {
    ApiFormat::OpenAi
}
fn default_max_concurrent() -> u32 {
    64
}
fn default_max_rpm() -> u32 {
    600
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_delay() -> Duration {
    Duration::from_secs(300)
}
fn default_required_probes() -> u32 {
    3
}
fn default_probe_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_enabled() -> bool {
    true
}

/// Routing behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSettings {
    #[serde(default)]
    pub priority: RoutingPriority,
    #[serde(default)]
    pub load_balancer: LoadBalancerKind,
    /// When no provider satisfies the capability filter, fall back to the
    /// full healthy set instead of failing with 503.
    #[serde(default = "default_relax")]
    pub relax_on_no_capability: bool,
    /// Upper bound on failover attempts beyond the selected provider
    #[serde(default = "default_fan_out")]
    pub fan_out_cap: usize,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            priority: RoutingPriority::default(),
            load_balancer: LoadBalancerKind::default(),
            relax_on_no_capability: default_relax(),
            fan_out_cap: default_fan_out(),
        }
    }
}

fn default_relax() -> bool {
    true
}
fn default_fan_out() -> usize {
    3
}

/// Streaming processor knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSettings {
    /// Worker count; 0 = hardware parallelism, always clamped to [2, 32]
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_max_chunks")]
    pub max_chunks_per_stream: u64,
    #[serde(default = "default_max_streams")]
    pub max_active_streams: usize,
    #[serde(default = "default_stream_timeout", with = "duration_serde")]
    pub stream_timeout: Duration,
    #[serde(default = "default_chunk_wait", with = "duration_serde")]
    pub chunk_wait_timeout: Duration,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            max_chunks_per_stream: default_max_chunks(),
            max_active_streams: default_max_streams(),
            stream_timeout: default_stream_timeout(),
            chunk_wait_timeout: default_chunk_wait(),
        }
    }
}

fn default_max_chunks() -> u64 {
    10_000
}
fn default_max_streams() -> usize {
    1024
}
fn default_stream_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_chunk_wait() -> Duration {
    Duration::from_secs(10)
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Provider pinned when no specialist applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    /// Specialist pins per descriptor type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_provider: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub routing: RoutingSettings,
    #[serde(default)]
    pub streaming: StreamingSettings,
    #[serde(default)]
    pub model_map: Vec<ModelPair>,
    /// Copy unrecognized body fields through translation
    #[serde(default = "default_preserve_unknown")]
    pub preserve_unknown_fields: bool,
    /// Completed-request metrics ring size
    #[serde(default = "default_metrics_capacity")]
    pub metrics_capacity: usize,
    /// Health monitor wake interval
    #[serde(default = "default_check_interval", with = "duration_serde")]
    pub check_interval: Duration,
}

fn default_preserve_unknown() -> bool {
    true
}
fn default_metrics_capacity() -> usize {
    10_000
}
fn default_check_interval() -> Duration {
    Duration::from_secs(5)
}

/// Serialize durations as "300s"-style strings, accepting "500ms", "2m",
/// "1h" and bare seconds on the way in.
pub mod duration_serde {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text).map_err(Error::custom),
        }
    }

    pub fn parse_duration(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty duration".to_string());
        }
        let (number, unit) = match text.find(|c: char| !c.is_ascii_digit() && c != '.') {
            Some(idx) => text.split_at(idx),
            None => (text, "s"),
        };
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration number: {text}"))?;
        let millis = match unit {
            "ms" => value,
            "s" => value * 1000.0,
            "m" => value * 60_000.0,
            "h" => value * 3_600_000.0,
            other => return Err(format!("unknown duration unit: {other}")),
        };
        Ok(Duration::from_millis(millis.round() as u64))
    }
}
