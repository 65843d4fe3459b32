//! Bidirectional Anthropic<->OpenAI translation for requests and responses.
//!
//! Translation is format-preserving: bodies stay `serde_json::Value` end to
//! end, known fields are mapped explicitly, and (when enabled) unrecognized
//! fields are copied verbatim. Declared data-loss fields (`top_k` going to
//! OpenAI, the penalty pair going to Anthropic) are dropped with a warning
//! rather than an error; warnings travel alongside the transformed body.
//!
//! The model-name table is held as an immutable `Arc` snapshot; reloads swap
//! the snapshot atomically so in-flight translations keep a consistent view.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::TransformError;
use crate::models::ApiFormat;

/// One canonical model-name pairing, consulted by direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPair {
    pub anthropic: String,
    pub openai: String,
}

/// Direction-aware model-name table. No implicit canonicalization: a name
/// missing from the table passes through untouched (with a warning).
#[derive(Debug, Clone, Default)]
pub struct ModelMap {
    pairs: Vec<ModelPair>,
}

impl ModelMap {
    pub fn new(pairs: Vec<ModelPair>) -> Self {
        Self { pairs }
    }

    pub fn to_openai(&self, anthropic_name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|p| p.anthropic == anthropic_name)
            .map(|p| p.openai.as_str())
    }

    pub fn to_anthropic(&self, openai_name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|p| p.openai == openai_name)
            .map(|p| p.anthropic.as_str())
    }
}

/// A non-fatal data-loss or mapping note produced during translation.
#[derive(Debug, Clone, Serialize)]
pub struct TransformWarning {
    pub field: String,
    pub message: String,
}

impl TransformWarning {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub type TransformOutput = (Value, Vec<TransformWarning>);

/// Request fields the Anthropic->OpenAI mapping consumes explicitly.
const ANTHROPIC_REQUEST_FIELDS: &[&str] = &[
    "model",
    "messages",
    "system",
    "max_tokens",
    "temperature",
    "top_p",
    "top_k",
    "stream",
    "stop_sequences",
];

/// Request fields the OpenAI->Anthropic mapping consumes explicitly.
const OPENAI_REQUEST_FIELDS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "temperature",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
    "stream",
    "stop",
    "user",
];

pub struct ApiTransformer {
    model_map: RwLock<Arc<ModelMap>>,
    preserve_unknown_fields: bool,
}

impl ApiTransformer {
    pub fn new(model_map: ModelMap, preserve_unknown_fields: bool) -> Self {
        Self {
            model_map: RwLock::new(Arc::new(model_map)),
            preserve_unknown_fields,
        }
    }

    /// Replace the model-name snapshot. In-flight translations keep the Arc
    /// they already cloned.
    pub fn reload_model_map(&self, model_map: ModelMap) {
        let mut guard = self.model_map.write().expect("model map lock poisoned");
        *guard = Arc::new(model_map);
    }

    fn model_map(&self) -> Arc<ModelMap> {
        self.model_map.read().expect("model map lock poisoned").clone()
    }

    /// Translate a request body between wire formats. Identity when
    /// `src == dst`; only the Anthropic<->OpenAI pairs are supported.
    pub fn transform_request(
        &self,
        body: &Value,
        src: ApiFormat,
        dst: ApiFormat,
    ) -> Result<TransformOutput, TransformError> {
        if src == dst {
            return Ok((body.clone(), Vec::new()));
        }
        match (src, dst) {
            (ApiFormat::Anthropic, ApiFormat::OpenAi) => self.request_anthropic_to_openai(body),
            (ApiFormat::OpenAi, ApiFormat::Anthropic) => self.request_openai_to_anthropic(body),
            _ => Err(TransformError::Unsupported { src, dst }),
        }
    }

    /// Translate a response body back to the client's original format.
    /// `provider` is the format the body arrived in.
    pub fn transform_response(
        &self,
        body: &Value,
        client: ApiFormat,
        provider: ApiFormat,
    ) -> Result<TransformOutput, TransformError> {
        if client == provider {
            return Ok((body.clone(), Vec::new()));
        }
        match (provider, client) {
            (ApiFormat::Anthropic, ApiFormat::OpenAi) => self.response_anthropic_to_openai(body),
            (ApiFormat::OpenAi, ApiFormat::Anthropic) => self.response_openai_to_anthropic(body),
            _ => Err(TransformError::Unsupported {
                src: provider,
                dst: client,
            }),
        }
    }

    fn request_anthropic_to_openai(&self, body: &Value) -> Result<TransformOutput, TransformError> {
        let src = as_object(body)?;
        let messages = src
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| TransformError::Failed {
                message: "request has no messages array".to_string(),
            })?;
        let mut warnings = Vec::new();
        let mut out = Map::new();

        if let Some(model) = src.get("model").and_then(Value::as_str) {
            match self.model_map().to_openai(model) {
                Some(mapped) => {
                    out.insert("model".into(), Value::String(mapped.to_string()));
                }
                None => {
                    warnings.push(TransformWarning::new(
                        "model",
                        format!("no openai mapping for '{model}', passing through"),
                    ));
                    out.insert("model".into(), Value::String(model.to_string()));
                }
            }
        }

        // Hoist the top-level system prompt into a leading system message.
        let mut out_messages = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = src.get("system") {
            let text = system_text(system);
            if !text.is_empty() {
                out_messages.push(json!({"role": "system", "content": text}));
            }
        }
        out_messages.extend(messages.iter().cloned());
        out.insert("messages".into(), Value::Array(out_messages));

        copy_fields(src, &mut out, &["max_tokens", "temperature", "top_p"]);
        if src.contains_key("top_k") {
            warnings.push(TransformWarning::new(
                "top_k",
                "dropped: openai chat completions has no top_k",
            ));
        }
        if let Some(stream) = src.get("stream") {
            out.insert("stream".into(), stream.clone());
        }
        if let Some(stop) = src.get("stop_sequences") {
            out.insert("stop".into(), stop.clone());
        }

        if self.preserve_unknown_fields {
            copy_unknown(src, &mut out, ANTHROPIC_REQUEST_FIELDS);
        }

        Ok((Value::Object(out), warnings))
    }

    fn request_openai_to_anthropic(&self, body: &Value) -> Result<TransformOutput, TransformError> {
        let src = as_object(body)?;
        let messages = src
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| TransformError::Failed {
                message: "request has no messages array".to_string(),
            })?;
        let mut warnings = Vec::new();
        let mut out = Map::new();

        if let Some(model) = src.get("model").and_then(Value::as_str) {
            match self.model_map().to_anthropic(model) {
                Some(mapped) => {
                    out.insert("model".into(), Value::String(mapped.to_string()));
                }
                None => {
                    warnings.push(TransformWarning::new(
                        "model",
                        format!("no anthropic mapping for '{model}', passing through"),
                    ));
                    out.insert("model".into(), Value::String(model.to_string()));
                }
            }
        }

        // Pull system messages out of the array and join them into the
        // top-level system prompt.
        let mut system_parts = Vec::new();
        let mut out_messages = Vec::with_capacity(messages.len());
        for message in messages {
            let is_system = message.get("role").and_then(Value::as_str) == Some("system");
            if is_system {
                if let Some(content) = message.get("content") {
                    let text = system_text(content);
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
            } else {
                out_messages.push(message.clone());
            }
        }
        if !system_parts.is_empty() {
            out.insert("system".into(), Value::String(system_parts.join("\n")));
        }
        out.insert("messages".into(), Value::Array(out_messages));

        copy_fields(src, &mut out, &["max_tokens", "temperature", "top_p"]);
        for field in ["frequency_penalty", "presence_penalty"] {
            if src.contains_key(field) {
                warnings.push(TransformWarning::new(
                    field,
                    "dropped: anthropic messages has no penalty parameters",
                ));
            }
        }
        if let Some(stream) = src.get("stream") {
            out.insert("stream".into(), stream.clone());
        }
        if let Some(stop) = src.get("stop") {
            out.insert("stop_sequences".into(), stop.clone());
        }

        if self.preserve_unknown_fields {
            copy_unknown(src, &mut out, OPENAI_REQUEST_FIELDS);
        }

        Ok((Value::Object(out), warnings))
    }

    fn response_anthropic_to_openai(
        &self,
        body: &Value,
    ) -> Result<TransformOutput, TransformError> {
        let src = as_object(body)?;
        // Error envelopes pass through untouched; the boundary re-renders them.
        if src.contains_key("error") {
            return Ok((body.clone(), Vec::new()));
        }

        let text = src
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| {
                blocks.iter().find_map(|b| {
                    (b.get("type").and_then(Value::as_str) == Some("text"))
                        .then(|| b.get("text").and_then(Value::as_str))
                        .flatten()
                })
            })
            .unwrap_or_default();

        let finish_reason = src
            .get("stop_reason")
            .and_then(Value::as_str)
            .unwrap_or("stop");

        let mut out = Map::new();
        if let Some(id) = src.get("id") {
            out.insert("id".into(), id.clone());
        }
        out.insert("object".into(), Value::String("chat.completion".into()));
        let created = src
            .get("created")
            .and_then(Value::as_u64)
            .unwrap_or_else(|| chrono::Utc::now().timestamp() as u64);
        out.insert("created".into(), json!(created));
        if let Some(model) = src.get("model") {
            out.insert("model".into(), model.clone());
        }
        out.insert(
            "choices".into(),
            json!([{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": finish_reason,
            }]),
        );

        if let Some(usage) = src.get("usage").and_then(Value::as_object) {
            let prompt = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
            let completion = usage
                .get("output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let total = usage
                .get("total_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(prompt + completion);
            out.insert(
                "usage".into(),
                json!({
                    "prompt_tokens": prompt,
                    "completion_tokens": completion,
                    "total_tokens": total,
                }),
            );
        }

        Ok((Value::Object(out), Vec::new()))
    }

    fn response_openai_to_anthropic(
        &self,
        body: &Value,
    ) -> Result<TransformOutput, TransformError> {
        let src = as_object(body)?;
        if src.contains_key("error") {
            return Ok((body.clone(), Vec::new()));
        }

        let first_choice = src
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first());
        let text = first_choice
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let stop_reason = first_choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(|reason| match reason {
                "stop" => "end_turn",
                "length" => "max_tokens",
                other => other,
            });

        let mut out = Map::new();
        if let Some(id) = src.get("id") {
            out.insert("id".into(), id.clone());
        }
        out.insert("type".into(), Value::String("message".into()));
        out.insert("role".into(), Value::String("assistant".into()));
        if let Some(model) = src.get("model") {
            out.insert("model".into(), model.clone());
        }
        out.insert(
            "content".into(),
            json!([{"type": "text", "text": text}]),
        );
        if let Some(reason) = stop_reason {
            out.insert("stop_reason".into(), Value::String(reason.to_string()));
        }

        if let Some(usage) = src.get("usage").and_then(Value::as_object) {
            let input = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
            let output = usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            out.insert(
                "usage".into(),
                json!({"input_tokens": input, "output_tokens": output}),
            );
        }

        Ok((Value::Object(out), Vec::new()))
    }
}

fn as_object(body: &Value) -> Result<&Map<String, Value>, TransformError> {
    body.as_object().ok_or_else(|| TransformError::Failed {
        message: "body is not a JSON object".to_string(),
    })
}

fn copy_fields(src: &Map<String, Value>, dst: &mut Map<String, Value>, fields: &[&str]) {
    for field in fields {
        if let Some(value) = src.get(*field) {
            dst.insert((*field).to_string(), value.clone());
        }
    }
}

fn copy_unknown(src: &Map<String, Value>, dst: &mut Map<String, Value>, known: &[&str]) {
    for (key, value) in src {
        if !known.contains(&key.as_str()) && !dst.contains_key(key) {
            dst.insert(key.clone(), value.clone());
        }
    }
}

/// Anthropic's system prompt may be a string or a list of text blocks.
fn system_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| {
                b.as_str()
                    .map(str::to_string)
                    .or_else(|| b.get("text").and_then(Value::as_str).map(str::to_string))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transformer() -> ApiTransformer {
        ApiTransformer::new(
            ModelMap::new(vec![ModelPair {
                anthropic: "claude-3-opus".into(),
                openai: "gpt-4".into(),
            }]),
            true,
        )
    }

    #[test]
    fn anthropic_request_to_openai_hoists_system_and_drops_top_k() {
        let body = json!({
            "model": "claude-3-sonnet",
            "system": "You are helpful",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 10,
            "top_k": 5
        });
        let (out, warnings) = transformer()
            .transform_request(&body, ApiFormat::Anthropic, ApiFormat::OpenAi)
            .unwrap();

        let messages = out["messages"].as_array().unwrap();
        assert_eq!(
            messages[0],
            json!({"role": "system", "content": "You are helpful"})
        );
        assert_eq!(messages[1]["role"], "user");
        assert!(out.get("top_k").is_none());
        assert_eq!(out["max_tokens"], 10);
        assert!(warnings.iter().any(|w| w.field == "top_k"));
        // Unmapped model passes through with a warning.
        assert_eq!(out["model"], "claude-3-sonnet");
        assert!(warnings.iter().any(|w| w.field == "model"));
    }

    #[test]
    fn openai_request_to_anthropic_moves_system_and_drops_penalties() {
        let body = json!({
            "model": "gpt-4",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ],
            "frequency_penalty": 0.4,
            "presence_penalty": 0.1,
            "stream": true
        });
        let (out, warnings) = transformer()
            .transform_request(&body, ApiFormat::OpenAi, ApiFormat::Anthropic)
            .unwrap();

        assert_eq!(out["model"], "claude-3-opus");
        assert_eq!(out["system"], "be brief");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert!(out.get("frequency_penalty").is_none());
        assert!(out.get("presence_penalty").is_none());
        assert_eq!(out["stream"], true);
        assert_eq!(
            warnings.iter().filter(|w| w.field.ends_with("_penalty")).count(),
            2
        );
    }

    #[test]
    fn identity_transform_is_byte_identical() {
        let body = json!({"model": "gpt-4", "messages": [], "anything": {"nested": true}});
        let (out, warnings) = transformer()
            .transform_request(&body, ApiFormat::OpenAi, ApiFormat::OpenAi)
            .unwrap();
        assert_eq!(out, body);
        assert!(warnings.is_empty());
    }

    #[test]
    fn unsupported_pair_is_rejected() {
        let err = transformer()
            .transform_request(&json!({}), ApiFormat::Unknown, ApiFormat::OpenAi)
            .unwrap_err();
        assert!(matches!(err, TransformError::Unsupported { .. }));
    }

    #[test]
    fn missing_messages_fails_structurally() {
        let err = transformer()
            .transform_request(
                &json!({"model": "claude-3"}),
                ApiFormat::Anthropic,
                ApiFormat::OpenAi,
            )
            .unwrap_err();
        assert!(matches!(err, TransformError::Failed { .. }));
    }

    #[test]
    fn openai_response_to_anthropic_maps_finish_and_usage() {
        let body = json!({
            "choices": [{"message": {"content": "hello"}, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 3, "total_tokens": 7}
        });
        let (out, _) = transformer()
            .transform_response(&body, ApiFormat::Anthropic, ApiFormat::OpenAi)
            .unwrap();

        assert_eq!(out["type"], "message");
        assert_eq!(out["content"], json!([{"type": "text", "text": "hello"}]));
        assert_eq!(out["stop_reason"], "max_tokens");
        assert_eq!(out["usage"]["input_tokens"], 4);
        assert_eq!(out["usage"]["output_tokens"], 3);
    }

    #[test]
    fn anthropic_response_to_openai_builds_choice_and_renames_usage() {
        let body = json!({
            "id": "msg_1",
            "model": "claude-3-sonnet",
            "content": [{"type": "text", "text": "hey there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 9, "output_tokens": 2}
        });
        let (out, _) = transformer()
            .transform_response(&body, ApiFormat::OpenAi, ApiFormat::Anthropic)
            .unwrap();

        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["id"], "msg_1");
        assert_eq!(out["choices"][0]["message"]["content"], "hey there");
        assert_eq!(out["choices"][0]["finish_reason"], "end_turn");
        assert_eq!(out["usage"]["prompt_tokens"], 9);
        assert_eq!(out["usage"]["completion_tokens"], 2);
        assert_eq!(out["usage"]["total_tokens"], 11);
        assert!(out["created"].is_u64());
    }

    #[test]
    fn error_envelopes_pass_through_responses() {
        let body = json!({"error": {"type": "overloaded_error", "message": "busy"}});
        let (out, _) = transformer()
            .transform_response(&body, ApiFormat::OpenAi, ApiFormat::Anthropic)
            .unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn request_round_trip_is_stable_modulo_declared_loss() {
        let original = json!({
            "model": "claude-3-opus",
            "system": "You are helpful",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64,
            "temperature": 0.5,
            "top_p": 0.9,
            "top_k": 40,
            "stream": false
        });
        let t = transformer();
        let (openai, _) = t
            .transform_request(&original, ApiFormat::Anthropic, ApiFormat::OpenAi)
            .unwrap();
        let (back, _) = t
            .transform_request(&openai, ApiFormat::OpenAi, ApiFormat::Anthropic)
            .unwrap();

        assert_eq!(back["model"], "claude-3-opus");
        assert_eq!(back["system"], "You are helpful");
        assert_eq!(back["messages"], original["messages"]);
        assert_eq!(back["max_tokens"], 64);
        assert_eq!(back["temperature"], 0.5);
        assert_eq!(back["top_p"], 0.9);
        assert_eq!(back["stream"], false);
        // top_k is the declared loss on the A->O leg.
        assert!(back.get("top_k").is_none());
    }

    #[test]
    fn unknown_fields_are_preserved_when_enabled() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "metadata_custom": {"trace": "abc"}
        });
        let (out, _) = transformer()
            .transform_request(&body, ApiFormat::OpenAi, ApiFormat::Anthropic)
            .unwrap();
        assert_eq!(out["metadata_custom"]["trace"], "abc");

        let strict = ApiTransformer::new(ModelMap::default(), false);
        let (out, _) = strict
            .transform_request(&body, ApiFormat::OpenAi, ApiFormat::Anthropic)
            .unwrap();
        assert!(out.get("metadata_custom").is_none());
    }

    #[test]
    fn model_map_reload_swaps_snapshot() {
        let t = transformer();
        t.reload_model_map(ModelMap::new(vec![ModelPair {
            anthropic: "claude-3-haiku".into(),
            openai: "gpt-4o-mini".into(),
        }]));
        let body = json!({
            "model": "claude-3-haiku",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let (out, warnings) = t
            .transform_request(&body, ApiFormat::Anthropic, ApiFormat::OpenAi)
            .unwrap();
        assert_eq!(out["model"], "gpt-4o-mini");
        assert!(warnings.is_empty());
    }
}
