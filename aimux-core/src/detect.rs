//! Inbound format detection.
//!
//! Classifies a request as Anthropic- or OpenAI-shaped by combining five
//! weighted signals: endpoint path, auth headers, model-name family, message
//! structure, and format-unique body fields. Detection never fails; when no
//! signal fires, or the signals tie, the result is `Unknown` with the
//! reasoning attached.

use std::collections::HashMap;

use serde_json::Value;

use crate::models::ApiFormat;

const WEIGHT_ENDPOINT: f64 = 0.4;
const WEIGHT_HEADERS: f64 = 0.3;
const WEIGHT_MODEL: f64 = 0.15;
const WEIGHT_STRUCTURE: f64 = 0.1;
const WEIGHT_BODY_FIELDS: f64 = 0.05;

/// Confidence floor for `detect_quick`, applied after normalizing by the
/// weight reachable without a body (endpoint + headers).
const QUICK_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct Detection {
    pub format: ApiFormat,
    /// Sum of the winning format's weighted scores, clamped to [0, 1].
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Default)]
struct Tally {
    anthropic: f64,
    openai: f64,
    notes: Vec<String>,
}

impl Tally {
    fn vote(&mut self, format: ApiFormat, weight: f64, note: &str) {
        match format {
            ApiFormat::Anthropic => self.anthropic += weight,
            ApiFormat::OpenAi => self.openai += weight,
            ApiFormat::Unknown => {}
        }
        self.notes.push(note.to_string());
    }
}

#[derive(Debug, Default)]
pub struct FormatDetector;

impl FormatDetector {
    pub fn new() -> Self {
        Self
    }

    /// Full detection over endpoint, headers and body.
    pub fn detect(
        &self,
        endpoint: &str,
        headers: &HashMap<String, String>,
        body: &Value,
    ) -> Detection {
        let mut tally = Tally::default();

        self.vote_endpoint(endpoint, &mut tally);
        self.vote_headers(headers, &mut tally);
        self.vote_model(body, &mut tally);
        self.vote_structure(body, &mut tally);
        self.vote_body_fields(body, &mut tally);

        let reasoning = if tally.notes.is_empty() {
            "no signal fired".to_string()
        } else {
            tally.notes.join("; ")
        };

        let (format, score) = if tally.anthropic > tally.openai {
            (ApiFormat::Anthropic, tally.anthropic)
        } else if tally.openai > tally.anthropic {
            (ApiFormat::OpenAi, tally.openai)
        } else {
            (ApiFormat::Unknown, 0.0)
        };

        Detection {
            format,
            confidence: score.clamp(0.0, 1.0),
            reasoning,
        }
    }

    /// Header/endpoint-only detection for hot paths.
    ///
    /// Without a body only 0.7 of the total weight is reachable, so the
    /// confidence is normalized against that before applying the 0.8 floor.
    pub fn detect_quick(&self, endpoint: &str, headers: &HashMap<String, String>) -> ApiFormat {
        let detection = self.detect(endpoint, headers, &Value::Null);
        let reachable = WEIGHT_ENDPOINT + WEIGHT_HEADERS;
        if detection.confidence / reachable >= QUICK_CONFIDENCE {
            detection.format
        } else {
            ApiFormat::Unknown
        }
    }

    fn vote_endpoint(&self, endpoint: &str, tally: &mut Tally) {
        let path = endpoint.to_ascii_lowercase();
        if path.contains("/anthropic") || path.ends_with("/messages") {
            tally.vote(ApiFormat::Anthropic, WEIGHT_ENDPOINT, "anthropic endpoint path");
        } else if path.contains("/chat/completions") || path.ends_with("/completions") {
            tally.vote(ApiFormat::OpenAi, WEIGHT_ENDPOINT, "openai endpoint path");
        }
    }

    fn vote_headers(&self, headers: &HashMap<String, String>, tally: &mut Tally) {
        let mut anthropic = false;
        let mut openai = false;
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if name == "x-api-key" || name == "anthropic-version" {
                anthropic = true;
            }
            if name.starts_with("openai-")
                || (name == "authorization" && value.trim_start().starts_with("Bearer "))
            {
                openai = true;
            }
        }
        match (anthropic, openai) {
            (true, true) => tally.notes.push("conflicting auth headers".to_string()),
            (true, false) => tally.vote(ApiFormat::Anthropic, WEIGHT_HEADERS, "anthropic headers"),
            (false, true) => tally.vote(ApiFormat::OpenAi, WEIGHT_HEADERS, "openai headers"),
            (false, false) => {}
        }
    }

    fn vote_model(&self, body: &Value, tally: &mut Tally) {
        let Some(model) = body.get("model").and_then(Value::as_str) else {
            return;
        };
        let model = model.to_ascii_lowercase();
        if model.starts_with("claude") {
            tally.vote(ApiFormat::Anthropic, WEIGHT_MODEL, "claude model family");
        } else if model.starts_with("gpt-")
            || model.starts_with("chatgpt")
            || model.starts_with("o1")
            || model.starts_with("o3")
            || model.contains("davinci")
        {
            tally.vote(ApiFormat::OpenAi, WEIGHT_MODEL, "openai model family");
        }
    }

    fn vote_structure(&self, body: &Value, tally: &mut Tally) {
        let Some(messages) = body.get("messages").and_then(Value::as_array) else {
            return;
        };
        let roles: Vec<&str> = messages
            .iter()
            .filter_map(|m| m.get("role").and_then(Value::as_str))
            .collect();

        let top_level_system = body.get("system").map(Value::is_string).unwrap_or(false);
        let only_user_assistant = !roles.is_empty()
            && roles.iter().all(|r| *r == "user" || *r == "assistant");
        if top_level_system && only_user_assistant {
            tally.vote(
                ApiFormat::Anthropic,
                WEIGHT_STRUCTURE,
                "top-level system with user/assistant messages",
            );
            return;
        }

        let system_in_messages = roles.iter().any(|r| *r == "system");
        let openai_fields = ["functions", "tools", "response_format", "stream"]
            .iter()
            .any(|f| body.get(*f).is_some());
        if system_in_messages || openai_fields {
            tally.vote(
                ApiFormat::OpenAi,
                WEIGHT_STRUCTURE,
                "system role in messages or openai-style fields",
            );
        }
    }

    fn vote_body_fields(&self, body: &Value, tally: &mut Tally) {
        if !body.is_object() {
            return;
        }
        if body.get("top_k").is_some() {
            tally.vote(ApiFormat::Anthropic, 2.0 * WEIGHT_BODY_FIELDS, "top_k present");
        }
        if body.get("frequency_penalty").is_some() || body.get("presence_penalty").is_some() {
            tally.vote(ApiFormat::OpenAi, 2.0 * WEIGHT_BODY_FIELDS, "penalty fields present");
        }
    }
}
