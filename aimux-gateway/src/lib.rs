//! # aimux-gateway
//!
//! HTTP boundary for the aimux multi-provider LLM gateway. Accepts
//! Anthropic- and OpenAI-shaped chat requests on their native paths,
//! dispatches them through the `aimux-core` engine (detection, translation,
//! health-aware routing, failover, streaming), and returns responses in the
//! client's original format with `X-Aimux-*` metadata headers.
//!
//! ## Endpoints
//!
//! - `POST /anthropic/v1/messages`, `POST /v1/chat/completions` - chat
//! - `GET /anthropic/v1/models`, `GET /v1/models` - aggregated model lists
//! - `GET /health`, `GET /health/detailed` - liveness and per-provider state
//! - `GET /metrics` - aggregates + request ring snapshot
//! - `GET /providers` - healthy/unhealthy split and redacted configs
//! - `GET|POST /config` - configuration snapshot / reload

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use server::create_server;

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::create_server;
    use aimux_core::{ApiFormat, ProviderConfig};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(name: &str, base_url: &str, format: ApiFormat, priority: f64) -> ProviderConfig {
        let mut config = ProviderConfig::new(name, base_url, "sk-test-0123456789abcdef", format)
            .with_models(vec!["test-model".into()]);
        config.priority_score = priority;
        config
    }

    async fn server_with(providers: Vec<ProviderConfig>) -> TestServer {
        let mut config = Config::default();
        for p in providers {
            config.gateway.providers.insert(p.name.clone(), p);
        }
        let app = create_server(config).await.unwrap();
        TestServer::new(app).unwrap()
    }

    async fn mock_openai_upstream(reply_text: &str) -> MockServer {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cmpl-1",
                "object": "chat.completion",
                "model": "test-model",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": reply_text},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 4, "completion_tokens": 3, "total_tokens": 7}
            })))
            .mount(&upstream)
            .await;
        upstream
    }

    #[tokio::test]
    async fn health_reports_unhealthy_without_providers() {
        let server = server_with(vec![]).await;
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.json::<Value>();
        assert_eq!(body["status"], "unhealthy");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn health_reports_healthy_with_a_provider() {
        let server = server_with(vec![provider(
            "main",
            "https://api.example.com",
            ApiFormat::OpenAi,
            0.0,
        )])
        .await;
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.json::<Value>()["status"], "healthy");

        let detailed = server.get("/health/detailed").await;
        let body = detailed.json::<Value>();
        assert_eq!(body["provider_count"], 1);
        assert_eq!(body["providers"]["main"]["status"], "healthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_aggregates() {
        let server = server_with(vec![]).await;
        let response = server.get("/metrics").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<Value>();
        assert_eq!(body["total_requests"], 0);
        assert!(body["routing"].is_object());
    }

    #[tokio::test]
    async fn providers_endpoint_redacts_credentials() {
        let server = server_with(vec![provider(
            "main",
            "https://api.example.com",
            ApiFormat::OpenAi,
            0.0,
        )])
        .await;
        let response = server.get("/providers").await;
        let body = response.json::<Value>();
        assert_eq!(body["healthy"][0], "main");
        assert_eq!(body["configs"]["main"]["credential"], "***");

        let config = server.get("/config").await.json::<Value>();
        assert_eq!(config["providers"]["main"]["credential"], "***");
    }

    #[tokio::test]
    async fn models_are_aggregated_in_both_shapes() {
        let server = server_with(vec![provider(
            "main",
            "https://api.example.com",
            ApiFormat::OpenAi,
            0.0,
        )])
        .await;

        let openai = server.get("/v1/models").await.json::<Value>();
        assert_eq!(openai["object"], "list");
        assert_eq!(openai["data"][0]["id"], "test-model");
        assert_eq!(openai["data"][0]["owned_by"], "main");

        let anthropic = server.get("/anthropic/v1/models").await.json::<Value>();
        assert_eq!(anthropic["data"][0]["type"], "model");
        assert_eq!(anthropic["data"][0]["id"], "test-model");
    }

    #[tokio::test]
    async fn chat_completion_round_trips_with_provider_header() {
        let upstream = mock_openai_upstream("hello from upstream").await;
        let server = server_with(vec![provider(
            "main",
            &upstream.uri(),
            ApiFormat::OpenAi,
            0.0,
        )])
        .await;

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({
                "model": "test-model",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header("x-aimux-provider"), "main");
        assert!(response.header("x-aimux-response-time").to_str().is_ok());
        let body = response.json::<Value>();
        assert_eq!(
            body["choices"][0]["message"]["content"],
            "hello from upstream"
        );
    }

    #[tokio::test]
    async fn failover_serves_from_the_second_provider() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": {"message": "boom", "type": "server_error"}
            })))
            .mount(&failing)
            .await;
        let healthy = mock_openai_upstream("rescued").await;

        let server = server_with(vec![
            provider("a", &failing.uri(), ApiFormat::OpenAi, 10.0),
            provider("b", &healthy.uri(), ApiFormat::OpenAi, 1.0),
        ])
        .await;

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({
                "model": "test-model",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header("x-aimux-provider"), "b");
        assert_eq!(
            response.json::<Value>()["choices"][0]["message"]["content"],
            "rescued"
        );

        // One failure recorded for a, one success for b.
        let metrics = server.get("/metrics").await.json::<Value>();
        assert_eq!(metrics["total_requests"], 2);
        assert_eq!(metrics["successful_requests"], 1);
    }

    #[tokio::test]
    async fn anthropic_client_is_served_by_openai_provider() {
        let upstream = mock_openai_upstream("translated hello").await;
        let server = server_with(vec![provider(
            "oai",
            &upstream.uri(),
            ApiFormat::OpenAi,
            0.0,
        )])
        .await;

        let response = server
            .post("/anthropic/v1/messages")
            .add_header("x-api-key", "sk-client-key-000000")
            .add_header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": "claude-3-sonnet",
                "system": "You are helpful",
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 32,
                "top_k": 4
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header("x-aimux-provider"), "oai");
        let body = response.json::<Value>();
        // The Anthropic client sees an Anthropic-shaped response.
        assert_eq!(body["type"], "message");
        assert_eq!(body["content"][0]["text"], "translated hello");
        assert_eq!(body["stop_reason"], "end_turn");
        assert_eq!(body["usage"]["input_tokens"], 4);
    }

    #[tokio::test]
    async fn malformed_json_yields_the_uniform_envelope() {
        let server = server_with(vec![provider(
            "main",
            "https://api.example.com",
            ApiFormat::OpenAi,
            0.0,
        )])
        .await;

        let response = server
            .post("/v1/chat/completions")
            .add_header("content-type", "application/json")
            .text("{not json")
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body = response.json::<Value>();
        assert_eq!(body["error"]["type"], "validation_error");
        assert_eq!(body["error"]["code"], "MALFORMED_BODY");
        assert!(body["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn empty_messages_is_a_validation_error() {
        let server = server_with(vec![provider(
            "main",
            "https://api.example.com",
            ApiFormat::OpenAi,
            0.0,
        )])
        .await;

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"model": "test-model", "messages": []}))
            .await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        let body = response.json::<Value>();
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn streaming_chat_returns_sse_with_done_sentinel() {
        let sse = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"str\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"eam\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&upstream)
            .await;

        let server = server_with(vec![provider(
            "main",
            &upstream.uri(),
            ApiFormat::OpenAi,
            0.0,
        )])
        .await;

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({
                "model": "test-model",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header("x-aimux-provider"), "main");
        let text = response.text();
        assert!(text.contains("\"content\":\"str\""));
        assert!(text.contains("\"content\":\"eam\""));
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn config_reload_registers_new_providers() {
        let server = server_with(vec![provider(
            "old",
            "https://api.example.com",
            ApiFormat::OpenAi,
            0.0,
        )])
        .await;

        let mut new_gateway = aimux_core::GatewayConfig::default();
        let p = provider("new", "https://api.example.org", ApiFormat::OpenAi, 0.0);
        new_gateway.providers.insert("new".into(), p);
        let response = server.post("/config").json(&new_gateway).await;
        assert_eq!(response.status_code(), StatusCode::OK);

        let providers = server.get("/providers").await.json::<Value>();
        assert_eq!(providers["healthy"][0], "new");
        assert!(providers["configs"].get("old").is_none());
    }
}
