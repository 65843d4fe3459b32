//! HTTP request handlers for the aimux gateway API.
//!
//! Two chat surfaces (`/anthropic/v1/messages` and `/v1/chat/completions`)
//! feed the same dispatch engine; responses are translated back to the
//! client's format and tagged with `X-Aimux-Provider` and
//! `X-Aimux-Response-Time` headers. Streaming requests come back as SSE.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use aimux_core::{ApiFormat, GatewayConfig, GatewayError};

use crate::error::ApiError;
use crate::server::AppState;

const PROVIDER_HEADER: &str = "x-aimux-provider";
const RESPONSE_TIME_HEADER: &str = "x-aimux-response-time";

/// Anthropic-format chat endpoint.
pub async fn anthropic_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    chat(state, headers, uri, body, ApiFormat::Anthropic).await
}

/// OpenAI-format chat endpoint.
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    chat(state, headers, uri, body, ApiFormat::OpenAi).await
}

async fn chat(
    state: AppState,
    headers: HeaderMap,
    uri: Uri,
    body: Result<Json<Value>, JsonRejection>,
    endpoint_format: ApiFormat,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadBody {
        message: e.to_string(),
    })?;

    // The endpoint implies a format, but the detector gets the final word
    // when it is confident - clients do post OpenAI bodies at Anthropic
    // paths and vice versa.
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let detection = state.detector.detect(uri.path(), &header_map, &body);
    let client_format = match detection.format {
        ApiFormat::Unknown => endpoint_format,
        detected => detected,
    };
    tracing::debug!(
        endpoint = %uri.path(),
        format = %client_format,
        confidence = detection.confidence,
        reasoning = %detection.reasoning,
        "request classified"
    );

    let streaming = body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if streaming {
        return stream_chat(state, body, client_format).await;
    }

    let deadline = state.config.server.timeout;
    let reply = state
        .manager
        .route_request(&body, client_format, Some(deadline))
        .await?;

    if !reply.warnings.is_empty() {
        tracing::debug!(
            provider = %reply.provider,
            warnings = ?reply.warnings.iter().map(|w| &w.field).collect::<Vec<_>>(),
            "translation dropped fields"
        );
    }

    let response = Response::builder()
        .status(StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK))
        .header("content-type", "application/json")
        .header(PROVIDER_HEADER, &reply.provider)
        .header(RESPONSE_TIME_HEADER, reply.response_time_ms.to_string())
        .body(Body::from(reply.body.to_string()))
        .map_err(|e| ApiError::Gateway(GatewayError::Internal {
            message: e.to_string(),
        }))?;
    Ok(response)
}

async fn stream_chat(
    state: AppState,
    body: Value,
    client_format: ApiFormat,
) -> Result<Response, ApiError> {
    use futures::StreamExt;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    let handle = state.manager.route_stream(&body, client_format).await?;
    let provider = handle.provider.clone();

    let events = UnboundedReceiverStream::new(handle.events)
        .map(|event| Ok::<_, std::io::Error>(format!("data: {event}\n\n")));
    // OpenAI clients expect the [DONE] sentinel after the last chunk.
    let tail = if client_format == ApiFormat::OpenAi {
        vec![Ok("data: [DONE]\n\n".to_string())]
    } else {
        Vec::new()
    };
    let sse = events.chain(futures::stream::iter(tail));

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header(PROVIDER_HEADER, &provider)
        .header(RESPONSE_TIME_HEADER, handle.establish_ms.to_string())
        .body(Body::from_stream(sse))
        .map_err(|e| ApiError::Gateway(GatewayError::Internal {
            message: e.to_string(),
        }))?;
    Ok(response)
}

/// `GET /v1/models` - OpenAI list shape.
pub async fn list_models_openai(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .manager
        .list_models()
        .into_iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "owned_by": m.provider,
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

/// `GET /anthropic/v1/models` - Anthropic list shape.
pub async fn list_models_anthropic(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .manager
        .list_models()
        .into_iter()
        .map(|m| {
            json!({
                "type": "model",
                "id": m.id,
                "display_name": m.id,
            })
        })
        .collect();
    Json(json!({"data": data}))
}

/// `GET /health` - 200 when at least one provider is healthy.
pub async fn health(State(state): State<AppState>) -> Response {
    let healthy = !state.manager.healthy_providers().is_empty();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }));
    (status, body).into_response()
}

/// `GET /health/detailed` - per-provider health, counts, uptime.
pub async fn health_detailed(State(state): State<AppState>) -> Json<Value> {
    let snapshots = state.manager.health_snapshots();
    let healthy = state.manager.healthy_providers();
    let metrics = state.manager.get_metrics();
    Json(json!({
        "status": if healthy.is_empty() { "unhealthy" } else { "healthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": metrics.uptime_seconds,
        "healthy_count": healthy.len(),
        "provider_count": snapshots.len(),
        "providers": snapshots,
    }))
}

/// `GET /metrics` - aggregates plus the metrics ring snapshot.
pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.manager.get_metrics()).unwrap_or_default())
}

/// `GET /providers` - healthy/unhealthy split plus redacted configs.
pub async fn providers(State(state): State<AppState>) -> Json<Value> {
    let config = state.manager.config_snapshot();
    let configs: HashMap<String, Value> = config
        .providers
        .iter()
        .map(|(name, provider)| {
            let mut value = serde_json::to_value(provider).unwrap_or_default();
            if let Some(map) = value.as_object_mut() {
                map.insert("credential".to_string(), Value::String("***".to_string()));
            }
            (name.clone(), value)
        })
        .collect();
    Json(json!({
        "healthy": state.manager.healthy_providers(),
        "unhealthy": state.manager.unhealthy_providers(),
        "configs": configs,
    }))
}

/// `GET /config` - engine config snapshot with credentials redacted.
pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    let mut value =
        serde_json::to_value(state.manager.config_snapshot()).unwrap_or_default();
    if let Some(providers) = value.get_mut("providers").and_then(Value::as_object_mut) {
        for provider in providers.values_mut() {
            if let Some(map) = provider.as_object_mut() {
                map.insert("credential".to_string(), Value::String("***".to_string()));
            }
        }
    }
    Json(value)
}

/// `POST /config` - swap in a new engine configuration.
pub async fn update_config(
    State(state): State<AppState>,
    body: Result<Json<GatewayConfig>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(config) = body.map_err(|e| ApiError::BadBody {
        message: e.to_string(),
    })?;
    state.manager.load_config(config)?;
    Ok(Json(json!({"status": "reloaded"})))
}
