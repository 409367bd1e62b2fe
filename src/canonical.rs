//! The translation-neutral representation every wire format funnels through.
//!
//! Requests and responses are parsed into these types at the edge, routed and
//! executed against them, and serialized back out in whichever format the
//! caller spoke. Nothing in here touches the network or knows about any
//! particular provider's JSON.

use serde::{Deserialize, Serialize};

/// The wire formats the gateway speaks on its inbound and outbound edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    Anthropic,
    OpenAi,
}

impl WireFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WireFormat::Anthropic => "anthropic",
            WireFormat::OpenAi => "openai",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anthropic" => Some(WireFormat::Anthropic),
            "openai" => Some(WireFormat::OpenAi),
            _ => None,
        }
    }
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    /// Caller-facing model identifier, before route mapping.
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolSelection>,
    pub sampling: SamplingParams,
    pub stream: bool,
    pub metadata: CallerMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub role: Role,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A typed content block. Tool arguments are carried as opaque JSON and never
/// inspected for semantics.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Text {
        text: String,
    },
    Image {
        source: ImageData,
    },
    ToolUse {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Thinking {
        text: String,
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageData {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments, passed through untouched.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolSelection {
    Auto,
    Any,
    None,
    Tool(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Vec<String>,
}

/// Correlation metadata supplied by the caller, used only for exchange
/// grouping in storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallerMetadata {
    pub user_id: Option<String>,
    pub project_id: Option<String>,
}

impl CallerMetadata {
    /// Derive the conversation correlation key.
    ///
    /// Claude Code encodes its session inside `metadata.user_id` as
    /// `user_<hash>_account_<id>_session_<id>`; the session segment is the
    /// strongest grouping signal we have. Callers without metadata share an
    /// anonymous key and rely on the idle-gap heuristic alone.
    #[must_use]
    pub fn correlation_key(&self) -> String {
        match self.user_id.as_deref() {
            Some(uid) => match uid.split_once("_session_") {
                Some((_, session)) if !session.is_empty() => format!("session:{session}"),
                _ => format!("user:{uid}"),
            },
            None => "anonymous".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalResponse {
    /// Upstream response id, normalized by the outbound translator.
    pub id: String,
    /// Model the caller asked for (echoed back in outbound payloads).
    pub model: String,
    pub blocks: Vec<Block>,
    pub stop_reason: StopReason,
    /// Upstream's verbatim reason, kept for diagnostics when the mapping was
    /// lossy (`StopReason::Error`) and echoed where the wire format allows.
    pub raw_stop_reason: Option<String>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Why generation stopped. Upstream reasons outside the fixed two-way map
/// surface as `Error` with the raw string preserved on the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    StopSequence,
    Error,
}

/// One streaming delta. Providers emit these in upstream order; the outbound
/// streaming translators turn them into the caller's framing.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalChunk {
    Start {
        id: String,
        model: String,
        input_tokens: u64,
    },
    BlockStart {
        index: usize,
        start: BlockStart,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    ToolArgumentsDelta {
        index: usize,
        partial_json: String,
    },
    BlockStop {
        index: usize,
    },
    Finish {
        stop_reason: StopReason,
        raw_stop_reason: Option<String>,
        usage: TokenUsage,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    Text,
    ToolUse { id: String, name: String },
}
