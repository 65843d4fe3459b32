//! Per-provider health state: circuit breaker, EMA metrics, RPM window.
//!
//! Status transitions depend on the failure counter, so both live behind one
//! mutex and change together. The requests-per-minute window is kept in
//! atomics since capacity checks tolerate slight staleness.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Health status of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    CircuitOpen,
}

/// Smoothing factor for the response-time EMA.
const RESPONSE_TIME_ALPHA: f64 = 0.1;
/// Success-rate gain on success. Failures pull harder (0.1) than successes
/// restore (0.05); the asymmetry is deliberate.
const SUCCESS_ALPHA: f64 = 0.05;
const FAILURE_ALPHA: f64 = 0.1;
const ERROR_RATE_STEP: f64 = 0.1;

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    consecutive_failures: u32,
    probe_successes: u32,
    circuit_opened_at: Option<Instant>,
    last_probe_at: Option<Instant>,
    avg_response_ms: f64,
    seeded: bool,
    success_rate: f64,
    error_rate: f64,
    total_requests: u64,
    successful_requests: u64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            probe_successes: 0,
            circuit_opened_at: None,
            last_probe_at: None,
            avg_response_ms: 0.0,
            seeded: false,
            success_rate: 1.0,
            error_rate: 0.0,
            total_requests: 0,
            successful_requests: 0,
        }
    }
}

/// Serializable view of a provider's health for reporting endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub avg_response_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub requests_per_minute: u32,
}

pub struct ProviderHealth {
    name: String,
    failure_threshold: u32,
    recovery_delay: Duration,
    required_probes: u32,
    cost_per_input_1k: f64,
    cost_per_output_1k: f64,
    state: Mutex<HealthState>,
    // Fixed one-minute window, reset lazily on rollover.
    window_count: AtomicU32,
    window_start_secs: AtomicU64,
    inflight: AtomicU32,
    probe_in_flight: AtomicBool,
}

impl ProviderHealth {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_delay: Duration,
        required_probes: u32,
        cost_per_input_1k: f64,
        cost_per_output_1k: f64,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_delay,
            required_probes: required_probes.max(1),
            cost_per_input_1k,
            cost_per_output_1k,
            state: Mutex::new(HealthState::default()),
            window_count: AtomicU32::new(0),
            window_start_secs: AtomicU64::new(now_secs()),
            inflight: AtomicU32::new(0),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record a successful exchange. Resets the failure counter; in
    /// CircuitOpen, counts a recovery probe and closes the circuit once
    /// enough probes succeeded.
    pub fn mark_success(&self, response_ms: u64) {
        let mut state = self.state.lock().expect("health lock poisoned");
        state.total_requests += 1;
        state.successful_requests += 1;
        self.observe_latency(&mut state, response_ms);
        state.success_rate += SUCCESS_ALPHA * (1.0 - state.success_rate);
        state.error_rate = (state.error_rate - SUCCESS_ALPHA).max(0.0);
        state.consecutive_failures = 0;

        match state.status {
            HealthStatus::CircuitOpen => {
                state.probe_successes += 1;
                if state.probe_successes >= self.required_probes {
                    state.status = HealthStatus::Healthy;
                    state.circuit_opened_at = None;
                    state.probe_successes = 0;
                    tracing::info!(provider = %self.name, "circuit closed after recovery probes");
                }
            }
            HealthStatus::Healthy => {}
            _ => {
                state.status = HealthStatus::Healthy;
            }
        }
    }

    /// Record a failed exchange. Degrades status with consecutive failures
    /// and opens the circuit at the threshold.
    pub fn mark_failure(&self, response_ms: Option<u64>) {
        let mut state = self.state.lock().expect("health lock poisoned");
        state.total_requests += 1;
        if let Some(ms) = response_ms {
            self.observe_latency(&mut state, ms);
        }
        state.success_rate -= FAILURE_ALPHA * state.success_rate;
        state.error_rate = (state.error_rate + ERROR_RATE_STEP).min(1.0);
        state.consecutive_failures += 1;
        let failures = state.consecutive_failures;

        match state.status {
            HealthStatus::CircuitOpen => {
                // A failed recovery probe reopens the window from scratch.
                state.probe_successes = 0;
                state.circuit_opened_at = Some(Instant::now());
                tracing::warn!(provider = %self.name, "recovery probe failed, circuit stays open");
            }
            _ => {
                if failures >= self.failure_threshold {
                    state.status = HealthStatus::CircuitOpen;
                    state.circuit_opened_at = Some(Instant::now());
                    state.probe_successes = 0;
                    tracing::warn!(
                        provider = %self.name,
                        consecutive_failures = failures,
                        "circuit opened"
                    );
                } else if failures >= self.failure_threshold.saturating_sub(1) {
                    state.status = HealthStatus::Unhealthy;
                } else if failures >= 2 {
                    state.status = HealthStatus::Degraded;
                }
            }
        }
    }

    fn observe_latency(&self, state: &mut HealthState, response_ms: u64) {
        if state.seeded {
            state.avg_response_ms = RESPONSE_TIME_ALPHA * response_ms as f64
                + (1.0 - RESPONSE_TIME_ALPHA) * state.avg_response_ms;
        } else {
            state.avg_response_ms = response_ms as f64;
            state.seeded = true;
        }
    }

    /// True unless the circuit is open and still inside its recovery delay.
    /// Past the delay the provider is half-open and accepts probe traffic.
    pub fn can_accept_requests(&self) -> bool {
        let state = self.state.lock().expect("health lock poisoned");
        match (state.status, state.circuit_opened_at) {
            (HealthStatus::CircuitOpen, Some(opened_at)) => {
                opened_at.elapsed() >= self.recovery_delay
            }
            _ => true,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.state.lock().expect("health lock poisoned").status
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status(), HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Whether the circuit's recovery delay has elapsed (half-open window).
    pub fn recovery_due(&self) -> bool {
        let state = self.state.lock().expect("health lock poisoned");
        matches!(
            (state.status, state.circuit_opened_at),
            (HealthStatus::CircuitOpen, Some(opened)) if opened.elapsed() >= self.recovery_delay
        )
    }

    pub fn mark_probe_started(&self) -> bool {
        let started = !self.probe_in_flight.swap(true, Ordering::AcqRel);
        if started {
            let mut state = self.state.lock().expect("health lock poisoned");
            state.last_probe_at = Some(Instant::now());
        }
        started
    }

    pub fn mark_probe_finished(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
    }

    pub fn probe_due(&self, interval: Duration) -> bool {
        if self.probe_in_flight.load(Ordering::Acquire) {
            return false;
        }
        let state = self.state.lock().expect("health lock poisoned");
        state
            .last_probe_at
            .map(|at| at.elapsed() >= interval)
            .unwrap_or(true)
    }

    /// Count an admitted request against the one-minute window and the
    /// in-flight gauge. Pair with [`finish_request`].
    pub fn record_admission(&self) {
        self.roll_window();
        self.window_count.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn finish_request(&self) {
        let previous = self.inflight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "finish_request without matching admission");
    }

    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.roll_window();
        self.window_count.load(Ordering::Relaxed)
    }

    fn roll_window(&self) {
        let now = now_secs();
        let start = self.window_start_secs.load(Ordering::Relaxed);
        if now.saturating_sub(start) >= 60
            && self
                .window_start_secs
                .compare_exchange(start, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.window_count.store(0, Ordering::Relaxed);
        }
    }

    pub fn avg_response_ms(&self) -> f64 {
        self.state.lock().expect("health lock poisoned").avg_response_ms
    }

    pub fn success_rate(&self) -> f64 {
        self.state.lock().expect("health lock poisoned").success_rate
    }

    /// 0.6 weight on success rate, 0.4 on normalized latency headroom.
    pub fn performance_score(&self) -> f64 {
        let state = self.state.lock().expect("health lock poisoned");
        let normalized = ((5000.0 - state.avg_response_ms) / 4000.0).max(0.0);
        0.6 * state.success_rate + 0.4 * normalized
    }

    pub fn cost_score(&self) -> f64 {
        (1.0 - (self.cost_per_input_1k + self.cost_per_output_1k) / 20.0).max(0.0)
    }

    pub fn cost_per_output_1k(&self) -> f64 {
        self.cost_per_output_1k
    }

    pub fn cost_total_1k(&self) -> f64 {
        self.cost_per_input_1k + self.cost_per_output_1k
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock().expect("health lock poisoned");
        HealthSnapshot {
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            avg_response_ms: state.avg_response_ms,
            success_rate: state.success_rate,
            error_rate: state.error_rate,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            requests_per_minute: self.window_count.load(Ordering::Relaxed),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
