//! Request analysis: derives the descriptor that drives routing.
//!
//! Classification precedence (first match wins): multimodal > thinking >
//! tools > streaming > long-context > standard. Analysis never blocks
//! dispatch; anything unparseable falls back to the default descriptor.

use serde_json::Value;

use crate::capability::{Capability, CapabilitySet};
use crate::models::ChatRequest;

/// Derived type tag for an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Standard,
    Thinking,
    Multimodal,
    Tools,
    Streaming,
    LongContext,
}

/// Summary of an inbound request used by the routing logic.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub request_type: RequestType,
    pub required_capabilities: CapabilitySet,
    /// Rough input-token estimate, always >= 1
    pub token_estimate: u64,
    pub streaming: bool,
    pub cost_sensitivity: f64,
    pub latency_sensitivity: f64,
    pub expected_response_ms: u64,
}

impl Default for RequestDescriptor {
    fn default() -> Self {
        Self {
            request_type: RequestType::Standard,
            required_capabilities: CapabilitySet::empty(),
            token_estimate: 1000,
            streaming: false,
            cost_sensitivity: 0.5,
            latency_sensitivity: 0.5,
            expected_response_ms: BASE_RESPONSE_MS,
        }
    }
}

const LONG_CONTEXT_CHARS: usize = 10_000;
const BASE_RESPONSE_MS: u64 = 1000;

/// Phrases that mark a request as wanting deliberate reasoning.
const THINKING_PATTERNS: &[&str] = &[
    "step by step",
    "explain your reasoning",
    "show your work",
    "think carefully",
    "chain of thought",
    "reason through",
];

/// Phrases hinting the model is expected to call out to tools.
const TOOL_INTENT_PATTERNS: &[&str] = &[
    "use the tool",
    "call the function",
    "search the web",
    "run the code",
];

#[derive(Debug, Default)]
pub struct RequestAnalyzer;

impl RequestAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyze a raw body, falling back to the default descriptor when the
    /// body does not parse as a chat request.
    pub fn analyze_value(&self, body: &Value) -> RequestDescriptor {
        match ChatRequest::from_value(body) {
            Some(request) => self.analyze(&request),
            None => RequestDescriptor::default(),
        }
    }

    pub fn analyze(&self, request: &ChatRequest) -> RequestDescriptor {
        let mut text = String::new();
        if let Some(system) = &request.system {
            text.push_str(system);
            text.push('\n');
        }
        let mut has_images = false;
        let mut has_tool_calls = false;
        for message in &request.messages {
            text.push_str(&message.content.as_text());
            text.push('\n');
            has_images |= message.content.has_image();
            has_tool_calls |= message.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
                || message.function_call.is_some();
        }
        let lower = text.to_lowercase();

        let wants_thinking = THINKING_PATTERNS.iter().any(|p| lower.contains(p));
        let has_tools = request.tools.as_ref().is_some_and(|t| !t.is_empty())
            || has_tool_calls
            || TOOL_INTENT_PATTERNS.iter().any(|p| lower.contains(p));
        let streaming = request.is_streaming();
        let json_mode = request
            .response_format
            .as_ref()
            .is_some_and(|f| f.format_type.starts_with("json"));
        let long_context = text.len() > LONG_CONTEXT_CHARS;

        let request_type = if has_images {
            RequestType::Multimodal
        } else if wants_thinking {
            RequestType::Thinking
        } else if has_tools {
            RequestType::Tools
        } else if streaming {
            RequestType::Streaming
        } else if long_context {
            RequestType::LongContext
        } else {
            RequestType::Standard
        };

        let mut required = CapabilitySet::empty();
        if has_images {
            required.insert(Capability::Vision);
        }
        if wants_thinking {
            required.insert(Capability::Thinking);
        }
        if has_tools {
            required.insert(Capability::Tools);
        }
        if streaming {
            required.insert(Capability::Streaming);
        }
        if json_mode {
            required.insert(Capability::JsonMode);
        }
        if has_tool_calls {
            required.insert(Capability::FunctionCalling);
        }

        let token_estimate = ((text.len() as u64) / 4).max(100);

        let multiplier = match request_type {
            RequestType::Thinking => 3.0,
            RequestType::Multimodal => 2.0,
            RequestType::LongContext => 2.5,
            _ => 1.0,
        };
        let expected_response_ms = (BASE_RESPONSE_MS as f64 * multiplier) as u64;

        let (cost_sensitivity, latency_sensitivity) = match request_type {
            RequestType::Thinking | RequestType::LongContext => (0.3, 0.4),
            RequestType::Streaming => (0.7, 0.8),
            _ => (0.5, 0.5),
        };

        RequestDescriptor {
            request_type,
            required_capabilities: required,
            token_estimate,
            streaming,
            cost_sensitivity,
            latency_sensitivity,
            expected_response_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use serde_json::json;

    fn request_with_text(text: &str) -> ChatRequest {
        ChatRequest {
            model: "claude-3-sonnet".into(),
            messages: vec![Message::user(text)],
            ..Default::default()
        }
    }

    #[test]
    fn thinking_classification() {
        let descriptor =
            RequestAnalyzer::new().analyze(&request_with_text("Please think step by step about this"));
        assert_eq!(descriptor.request_type, RequestType::Thinking);
        assert!(descriptor.required_capabilities.contains(Capability::Thinking));
        assert_eq!(descriptor.expected_response_ms, 3000);
        assert_eq!(descriptor.cost_sensitivity, 0.3);
        assert_eq!(descriptor.latency_sensitivity, 0.4);
    }

    #[test]
    fn images_win_over_thinking() {
        let body = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "think step by step about this image"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}}
            ]}]
        });
        let descriptor = RequestAnalyzer::new().analyze_value(&body);
        assert_eq!(descriptor.request_type, RequestType::Multimodal);
        assert!(descriptor.required_capabilities.contains(Capability::Vision));
        // Thinking capability still required even though the type tag is multimodal.
        assert!(descriptor.required_capabilities.contains(Capability::Thinking));
        assert_eq!(descriptor.expected_response_ms, 2000);
    }

    #[test]
    fn streaming_type_and_capability() {
        let mut request = request_with_text("hello");
        request.stream = Some(true);
        let descriptor = RequestAnalyzer::new().analyze(&request);
        assert_eq!(descriptor.request_type, RequestType::Streaming);
        assert!(descriptor.required_capabilities.contains(Capability::Streaming));
        assert_eq!(descriptor.cost_sensitivity, 0.7);
        assert_eq!(descriptor.latency_sensitivity, 0.8);
    }

    #[test]
    fn long_context_threshold() {
        let descriptor = RequestAnalyzer::new().analyze(&request_with_text(&"x".repeat(10_500)));
        assert_eq!(descriptor.request_type, RequestType::LongContext);
        assert_eq!(descriptor.expected_response_ms, 2500);
        assert!(descriptor.token_estimate >= 2600);
    }

    #[test]
    fn token_estimate_floor() {
        let descriptor = RequestAnalyzer::new().analyze(&request_with_text("hi"));
        assert_eq!(descriptor.token_estimate, 100);
        assert_eq!(descriptor.request_type, RequestType::Standard);
    }

    #[test]
    fn json_mode_capability() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "list three fruits"}],
            "response_format": {"type": "json_object"}
        });
        let descriptor = RequestAnalyzer::new().analyze_value(&body);
        assert!(descriptor.required_capabilities.contains(Capability::JsonMode));
    }

    #[test]
    fn unparseable_body_falls_back_to_default() {
        let descriptor = RequestAnalyzer::new().analyze_value(&json!("not an object"));
        assert_eq!(descriptor.request_type, RequestType::Standard);
        assert_eq!(descriptor.token_estimate, 1000);
    }
}
