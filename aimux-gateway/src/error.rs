//! The uniform HTTP error envelope.
//!
//! Every failure leaving the gateway is rendered as
//! `{"error": {"type", "code", "message"}, "timestamp"}` with an appropriate
//! status. Internal errors are mapped to an opaque 500 carrying only a
//! correlation id; the details stay in the logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use aimux_core::GatewayError;

/// HTTP-facing error wrapper around the core taxonomy.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Body rejected before reaching the core (bad JSON, too large)
    #[error("invalid request body: {message}")]
    BadBody { message: String },
}

impl ApiError {
    /// (status, envelope type, SCREAMING_SNAKE code, message)
    fn parts(&self) -> (StatusCode, &'static str, &'static str, String) {
        match self {
            ApiError::BadBody { message } => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                "MALFORMED_BODY",
                message.clone(),
            ),
            ApiError::Gateway(e) => match e {
                GatewayError::Validation { .. } => (
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    "INVALID_REQUEST",
                    e.to_string(),
                ),
                GatewayError::Config { .. } => (
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    "INVALID_CONFIG",
                    e.to_string(),
                ),
                GatewayError::RequestTransform(_) => (
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    "REQUEST_TRANSFORM_FAILED",
                    e.to_string(),
                ),
                GatewayError::ResponseTransform(_) => (
                    StatusCode::BAD_GATEWAY,
                    "gateway_error",
                    "RESPONSE_TRANSFORM_FAILED",
                    e.to_string(),
                ),
                GatewayError::Serialization(_) => (
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    "MALFORMED_JSON",
                    e.to_string(),
                ),
                GatewayError::NoProvider { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "api_error",
                    "NO_PROVIDER",
                    e.to_string(),
                ),
                GatewayError::CircuitOpen { .. } => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "api_error",
                    "CIRCUIT_OPEN",
                    e.to_string(),
                ),
                GatewayError::AllProvidersFailed { .. } => (
                    StatusCode::BAD_GATEWAY,
                    "gateway_error",
                    "ALL_PROVIDERS_FAILED",
                    e.to_string(),
                ),
                GatewayError::Provider { status, .. } => (
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                    "api_error",
                    "PROVIDER_ERROR",
                    e.to_string(),
                ),
                GatewayError::Stream { .. } => (
                    StatusCode::BAD_GATEWAY,
                    "gateway_error",
                    "STREAM_ERROR",
                    e.to_string(),
                ),
                GatewayError::DeadlineExceeded => (
                    StatusCode::GATEWAY_TIMEOUT,
                    "gateway_error",
                    "DEADLINE_EXCEEDED",
                    e.to_string(),
                ),
                GatewayError::Http(_) => (
                    StatusCode::BAD_GATEWAY,
                    "gateway_error",
                    "UPSTREAM_UNREACHABLE",
                    e.to_string(),
                ),
                GatewayError::Internal { .. } => {
                    let correlation_id = uuid::Uuid::new_v4();
                    tracing::error!(%correlation_id, error = %e, "internal gateway error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "gateway_error",
                        "INTERNAL_ERROR",
                        format!("internal error, correlation id {correlation_id}"),
                    )
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message) = self.parts();
        let body = Json(json!({
            "error": {
                "type": error_type,
                "code": code,
                "message": message,
            },
            "timestamp": chrono::Utc::now().timestamp_millis(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_of(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        // The body is small and already buffered.
        let bytes = futures::executor::block_on(axum::body::to_bytes(
            response.into_body(),
            usize::MAX,
        ))
        .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn no_provider_maps_to_503_envelope() {
        let (status, body) = envelope_of(ApiError::Gateway(GatewayError::NoProvider {
            reason: "nothing healthy".into(),
        }));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["type"], "api_error");
        assert_eq!(body["error"]["code"], "NO_PROVIDER");
        assert!(body["timestamp"].is_i64());
    }

    #[test]
    fn internal_errors_stay_opaque() {
        let (status, body) = envelope_of(ApiError::Gateway(GatewayError::Internal {
            message: "secret detail".into(),
        }));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let message = body["error"]["message"].as_str().unwrap();
        assert!(!message.contains("secret detail"));
        assert!(message.contains("correlation id"));
    }

    #[test]
    fn provider_status_passes_through() {
        let (status, body) = envelope_of(ApiError::Gateway(GatewayError::Provider {
            provider: "up".into(),
            status: 429,
            message: "slow down".into(),
            retryable: true,
        }));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "PROVIDER_ERROR");
    }
}
