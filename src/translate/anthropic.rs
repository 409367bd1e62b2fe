//! Translate between the Anthropic Messages wire format and the canonical
//! representation, in both directions.
//!
//! All functions are pure (no I/O). Structural problems in the payload —
//! empty message lists, tool blocks on the wrong role — are rejected with a
//! `TranslationError` rather than repaired.

use super::anthropic_types::{
    ContentBlock, ErrorResponse, ImageSource, Message, MessageContent, MessagesRequest,
    MessagesResponse, Metadata, ResponseContentBlock, Role as WireRole, SystemContent, Tool,
    ToolChoice, ToolResultContent, Usage,
};
use crate::canonical::{
    Block, CallerMetadata, CanonicalMessage, CanonicalRequest, CanonicalResponse, ImageData, Role,
    SamplingParams, StopReason, TokenUsage, ToolDefinition, ToolSelection,
};
use crate::error::{GatewayError, Result};

/// Anthropic requires `max_tokens`; used when the canonical request came from
/// a format where the caller omitted it.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub fn request_to_canonical(req: &MessagesRequest) -> Result<CanonicalRequest> {
    if req.messages.is_empty() {
        return Err(GatewayError::translation(
            "messages must contain at least one entry",
        ));
    }

    let messages = req
        .messages
        .iter()
        .map(message_to_canonical)
        .collect::<Result<Vec<_>>>()?;

    let tools = req
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|t| ToolDefinition {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let tool_choice = req.tool_choice.as_ref().map(|tc| match tc {
        ToolChoice::Auto => ToolSelection::Auto,
        ToolChoice::Any => ToolSelection::Any,
        ToolChoice::None => ToolSelection::None,
        ToolChoice::Tool { name } => ToolSelection::Tool(name.clone()),
    });

    let metadata = req
        .metadata
        .as_ref()
        .map(|m| CallerMetadata {
            user_id: m.user_id.clone(),
            project_id: m.project_id.clone(),
        })
        .unwrap_or_default();

    Ok(CanonicalRequest {
        model: req.model.clone(),
        system: req.system.as_ref().map(SystemContent::as_text),
        messages,
        tools,
        tool_choice,
        sampling: SamplingParams {
            max_tokens: Some(req.max_tokens),
            temperature: req.temperature,
            top_p: req.top_p,
            stop_sequences: req.stop_sequences.clone().unwrap_or_default(),
        },
        stream: req.stream.unwrap_or(false),
        metadata,
    })
}

fn message_to_canonical(msg: &Message) -> Result<CanonicalMessage> {
    let role = match msg.role {
        WireRole::User => Role::User,
        WireRole::Assistant => Role::Assistant,
    };

    let blocks = msg
        .content
        .blocks()
        .iter()
        .map(|b| block_to_canonical(role, b))
        .collect::<Result<Vec<_>>>()?;

    Ok(CanonicalMessage { role, blocks })
}

fn block_to_canonical(role: Role, block: &ContentBlock) -> Result<Block> {
    match block {
        ContentBlock::Text { text } => Ok(Block::Text { text: text.clone() }),
        ContentBlock::Image { source } => Ok(Block::Image {
            source: match source {
                ImageSource::Base64 { media_type, data } => ImageData::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                ImageSource::Url { url } => ImageData::Url { url: url.clone() },
            },
        }),
        ContentBlock::ToolUse { id, name, input } => {
            if role != Role::Assistant {
                return Err(GatewayError::translation(
                    "tool_use blocks are only valid in assistant messages",
                ));
            }
            Ok(Block::ToolUse {
                id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            })
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            if role != Role::User {
                return Err(GatewayError::translation(
                    "tool_result blocks are only valid in user messages",
                ));
            }
            Ok(Block::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: tool_result_text(content.as_ref()),
                is_error: is_error.unwrap_or(false),
            })
        }
        ContentBlock::Thinking {
            thinking,
            signature,
        } => Ok(Block::Thinking {
            text: thinking.clone(),
            signature: signature.clone(),
        }),
    }
}

fn tool_result_text(content: Option<&ToolResultContent>) -> String {
    match content {
        Some(ToolResultContent::Text(t)) => t.clone(),
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

/// Encode a canonical request as an Anthropic wire request for the upstream
/// model `upstream_model`. Consecutive same-role canonical messages (e.g.
/// separate tool-result messages produced by the OpenAI parser) are merged,
/// since Anthropic requires alternating roles.
pub fn request_from_canonical(
    req: &CanonicalRequest,
    upstream_model: &str,
) -> Result<MessagesRequest> {
    if req.messages.is_empty() {
        return Err(GatewayError::translation(
            "messages must contain at least one entry",
        ));
    }

    let mut messages: Vec<Message> = Vec::new();
    for msg in &req.messages {
        let role = match msg.role {
            Role::User => WireRole::User,
            Role::Assistant => WireRole::Assistant,
        };
        let blocks: Vec<ContentBlock> = msg.blocks.iter().map(block_from_canonical).collect();

        match messages.last_mut() {
            Some(prev) if prev.role == role => {
                let mut merged = prev.content.blocks();
                merged.extend(blocks);
                prev.content = MessageContent::Blocks(merged);
            }
            _ => messages.push(Message {
                role,
                content: MessageContent::Blocks(blocks),
            }),
        }
    }

    let tools = if req.tools.is_empty() {
        None
    } else {
        Some(
            req.tools
                .iter()
                .map(|t| Tool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect(),
        )
    };

    let tool_choice = req.tool_choice.as_ref().map(|tc| match tc {
        ToolSelection::Auto => ToolChoice::Auto,
        ToolSelection::Any => ToolChoice::Any,
        ToolSelection::None => ToolChoice::None,
        ToolSelection::Tool(name) => ToolChoice::Tool { name: name.clone() },
    });

    let metadata = req.metadata.user_id.as_ref().map(|uid| Metadata {
        user_id: Some(uid.clone()),
        project_id: None,
        extra: Default::default(),
    });

    Ok(MessagesRequest {
        model: upstream_model.to_string(),
        max_tokens: req.sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: req.system.clone().map(SystemContent::Text),
        stream: req.stream.then_some(true),
        temperature: req.sampling.temperature,
        top_p: req.sampling.top_p,
        top_k: None,
        stop_sequences: if req.sampling.stop_sequences.is_empty() {
            None
        } else {
            Some(req.sampling.stop_sequences.clone())
        },
        tools,
        tool_choice,
        metadata,
        extra: Default::default(),
    })
}

fn block_from_canonical(block: &Block) -> ContentBlock {
    match block {
        Block::Text { text } => ContentBlock::Text { text: text.clone() },
        Block::Image { source } => ContentBlock::Image {
            source: match source {
                ImageData::Base64 { media_type, data } => ImageSource::Base64 {
                    media_type: media_type.clone(),
                    data: data.clone(),
                },
                ImageData::Url { url } => ImageSource::Url { url: url.clone() },
            },
        },
        Block::ToolUse {
            id,
            name,
            arguments,
        } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: arguments.clone(),
        },
        Block::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: Some(ToolResultContent::Text(content.clone())),
            is_error: is_error.then_some(true),
        },
        Block::Thinking { text, signature } => ContentBlock::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        },
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn response_to_canonical(resp: &MessagesResponse) -> CanonicalResponse {
    let blocks = resp
        .content
        .iter()
        .map(|b| match b {
            ResponseContentBlock::Text { text } => Block::Text { text: text.clone() },
            ResponseContentBlock::ToolUse { id, name, input } => Block::ToolUse {
                id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            },
        })
        .collect();

    let (stop_reason, raw) = match resp.stop_reason.as_deref() {
        Some(reason) => stop_reason_to_canonical(reason),
        None => (StopReason::EndTurn, None),
    };

    CanonicalResponse {
        id: resp.id.clone(),
        model: resp.model.clone(),
        blocks,
        stop_reason,
        raw_stop_reason: raw,
        usage: TokenUsage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
        },
    }
}

/// Encode a canonical response in Anthropic wire shape, echoing the model the
/// caller originally requested.
pub fn response_from_canonical(resp: &CanonicalResponse) -> MessagesResponse {
    let mut content: Vec<ResponseContentBlock> = resp
        .blocks
        .iter()
        .filter_map(|b| match b {
            Block::Text { text } => Some(ResponseContentBlock::Text { text: text.clone() }),
            Block::ToolUse {
                id,
                name,
                arguments,
            } => Some(ResponseContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: arguments.clone(),
            }),
            _ => None,
        })
        .collect();

    // Clients expect at least one content block.
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    MessagesResponse {
        id: message_id(&resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: resp.model.clone(),
        stop_reason: Some(stop_reason_from_canonical(
            resp.stop_reason,
            resp.raw_stop_reason.as_deref(),
        )),
        stop_sequence: None,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        },
    }
}

/// Normalize an upstream id into an Anthropic-looking `msg_` id.
#[must_use]
pub fn message_id(upstream_id: &str) -> String {
    if upstream_id.starts_with("msg_") {
        upstream_id.to_string()
    } else {
        format!("msg_{}", upstream_id.trim_start_matches("chatcmpl-"))
    }
}

// ---------------------------------------------------------------------------
// Stop reasons
// ---------------------------------------------------------------------------

pub fn stop_reason_to_canonical(reason: &str) -> (StopReason, Option<String>) {
    match reason {
        "end_turn" => (StopReason::EndTurn, None),
        "max_tokens" => (StopReason::MaxTokens, None),
        "tool_use" => (StopReason::ToolUse, None),
        "stop_sequence" => (StopReason::StopSequence, None),
        other => (StopReason::Error, Some(other.to_string())),
    }
}

#[must_use]
pub fn stop_reason_from_canonical(stop: StopReason, raw: Option<&str>) -> String {
    match stop {
        StopReason::EndTurn => "end_turn".to_string(),
        StopReason::MaxTokens => "max_tokens".to_string(),
        StopReason::ToolUse => "tool_use".to_string(),
        StopReason::StopSequence => "stop_sequence".to_string(),
        StopReason::Error => raw.unwrap_or("error").to_string(),
    }
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// Build an Anthropic-shaped error body for the given HTTP status, so client
/// SDKs parse it the way they parse the real API's errors.
#[must_use]
pub fn error_envelope(status: u16, message: &str) -> ErrorResponse {
    match status {
        400 => ErrorResponse::invalid_request(message),
        401 => ErrorResponse::new("authentication_error", message),
        403 => ErrorResponse::new("permission_error", message),
        404 => ErrorResponse::new("not_found_error", message),
        429 => ErrorResponse::new("rate_limit_error", message),
        529 => ErrorResponse::overloaded(message),
        _ => ErrorResponse::api_error(message),
    }
}
