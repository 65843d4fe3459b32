//! Core wire and internal types for the dispatch engine.
//!
//! Inbound bodies are handled as raw `serde_json::Value` so unknown fields
//! survive translation; `ChatRequest` is the lenient internal view used for
//! request analysis. Its fields are the union of the Anthropic and OpenAI
//! chat shapes, so a body in either format deserializes without loss of the
//! signals the analyzer cares about.

use serde::{Deserialize, Serialize};

/// Wire format of a request or response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    /// Anthropic Messages API shape (`/v1/messages`)
    Anthropic,
    /// OpenAI Chat Completions shape (`/v1/chat/completions`)
    OpenAi,
    /// Could not be classified
    Unknown,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::Anthropic => "anthropic",
            ApiFormat::OpenAi => "openai",
            ApiFormat::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: either a bare string or a list of typed parts.
///
/// Anthropic vision requests carry `{type: "image", source: …}` parts;
/// OpenAI carries `{type: "image_url", image_url: …}`. Both are kept as-is
/// so the analyzer can spot them and translation can pass them through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        source: serde_json::Value,
    },
    ImageUrl {
        image_url: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

impl MessageContent {
    /// Concatenated text of all textual parts.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(self, MessageContent::Parts(parts) if parts
            .iter()
            .any(|p| matches!(p, ContentPart::Image { .. } | ContentPart::ImageUrl { .. })))
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
            name: None,
            tool_calls: None,
            function_call: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default)]
    pub tool_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<ToolFunction>,
    // Anthropic tool definitions carry name/schema at the top level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: Option<String>,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

/// Lenient internal view of an inbound chat request.
///
/// The union of both supported wire shapes. Everything beyond `model` and
/// `messages` is optional so either format parses; unrecognized fields are
/// ignored here and preserved on the raw body instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Anthropic top-level system prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ChatRequest {
    /// Parse a raw body into the internal view, tolerating either wire shape.
    pub fn from_value(body: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(body.clone()).ok()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Token usage in neutral (Anthropic-style) naming.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    /// Extract usage counters from a provider-shaped response body.
    pub fn from_body(body: &serde_json::Value) -> Option<Self> {
        let usage = body.get("usage")?;
        let input = usage
            .get("input_tokens")
            .or_else(|| usage.get("prompt_tokens"))?
            .as_u64()? as u32;
        let output = usage
            .get("output_tokens")
            .or_else(|| usage.get("completion_tokens"))?
            .as_u64()? as u32;
        Some(Self {
            input_tokens: input,
            output_tokens: output,
        })
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A completed upstream exchange as seen by the dispatch loop.
///
/// `body` is provider-shaped JSON on success and an error payload otherwise;
/// translation back to the client's format happens after the failover loop
/// settles on a response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub success: bool,
    pub status: u16,
    pub provider: String,
    pub body: serde_json::Value,
    pub response_time_ms: u64,
    pub usage: Option<Usage>,
}

impl ProviderResponse {
    /// Whether the failover loop may continue to another candidate.
    ///
    /// Transport-level failures never reach this point (they surface as
    /// errors); of the HTTP failures, 5xx plus 408/429 are worth retrying
    /// elsewhere, any other 4xx is the client's problem.
    pub fn is_retryable_failure(&self) -> bool {
        !self.success && retryable_status(self.status)
    }
}

/// 5xx, 408 and 429 are transient from the gateway's point of view.
pub fn retryable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}
