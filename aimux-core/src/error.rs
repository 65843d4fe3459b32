//! Error taxonomy for the dispatch engine.
//!
//! Every public operation returns `Result<_, GatewayError>`; transient
//! upstream failures are consumed by the failover loop and only surface when
//! all candidates are exhausted. The HTTP boundary maps these kinds onto the
//! uniform error envelope.

use thiserror::Error;

use crate::models::ApiFormat;

/// Failures produced by the wire-format translator.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Only Anthropic<->OpenAI pairs are supported
    #[error("unsupported transform: {src} -> {dst}")]
    Unsupported { src: ApiFormat, dst: ApiFormat },

    /// Structural violation in the body being translated
    #[error("transform failed: {message}")]
    Failed { message: String },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid provider registration, refused at admission
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Malformed or oversized client request
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// Translation failure on the inbound leg (client body -> provider body)
    #[error("request transform error: {0}")]
    RequestTransform(#[source] TransformError),

    /// Translation failure on the return leg (provider body -> client body)
    #[error("response transform error: {0}")]
    ResponseTransform(#[source] TransformError),

    /// No healthy and capable provider survived filtering
    #[error("no provider available: {reason}")]
    NoProvider { reason: String },

    /// An upstream provider failed; `retryable` drives the failover loop
    #[error("provider {provider} error ({status}): {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    /// Every candidate in the failover chain failed
    #[error("all providers failed after {attempts} attempts")]
    AllProvidersFailed {
        attempts: usize,
        errors: Vec<String>,
    },

    /// A provider was skipped because its circuit is open
    #[error("circuit open for provider {provider}")]
    CircuitOpen { provider: String },

    /// Streaming pipeline failure (timeout, cancellation, pool exhaustion)
    #[error("stream error: {message}")]
    Stream { message: String },

    /// The inbound request's deadline elapsed mid-dispatch
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all mapped to an opaque gateway 500 at the boundary
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Whether the failover loop should move on to the next candidate.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Provider { retryable, .. } => *retryable,
            GatewayError::Http(_) | GatewayError::CircuitOpen { .. } => true,
            _ => false,
        }
    }
}
