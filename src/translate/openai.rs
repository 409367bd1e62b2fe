//! Translate between the OpenAI Chat Completions wire format and the
//! canonical representation, in both directions.
//!
//! The shape differences handled here, both ways:
//! - system prompt: leading `system`-role messages ↔ the canonical top-level
//!   system field (a system message after conversation turns is rejected);
//! - tool traffic: assistant `tool_calls` ↔ canonical tool_use blocks, and
//!   `tool`-role messages ↔ canonical tool_result blocks (a single canonical
//!   user message can expand into several OpenAI messages);
//! - images: base64 blocks ↔ `data:` URIs.

use chrono::Utc;

use super::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatErrorResponse, ChatFunction,
    ChatMessage, ChatTool, ChatToolCall, ChatToolCallFunction, ChatToolChoice,
    ChatToolChoiceFunction, ChatToolChoiceSpecific, ChatUsage, Choice, ChoiceMessage, ContentPart,
    ImageUrlDetail, StreamOptions,
};
use crate::canonical::{
    Block, CallerMetadata, CanonicalMessage, CanonicalRequest, CanonicalResponse, ImageData, Role,
    SamplingParams, StopReason, TokenUsage, ToolDefinition, ToolSelection,
};
use crate::error::{GatewayError, Result};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub fn request_to_canonical(req: &ChatCompletionRequest) -> Result<CanonicalRequest> {
    if req.messages.is_empty() {
        return Err(GatewayError::translation(
            "messages must contain at least one entry",
        ));
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<CanonicalMessage> = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => {
                if !messages.is_empty() {
                    return Err(GatewayError::translation(
                        "system messages must precede the conversation",
                    ));
                }
                system_parts.push(content_text(msg.content.as_ref()));
            }
            "user" => messages.push(CanonicalMessage {
                role: Role::User,
                blocks: user_blocks(msg.content.as_ref()),
            }),
            "assistant" => messages.push(assistant_to_canonical(msg)),
            "tool" => {
                let tool_use_id = msg.tool_call_id.clone().ok_or_else(|| {
                    GatewayError::translation("tool message is missing tool_call_id")
                })?;
                messages.push(CanonicalMessage {
                    role: Role::User,
                    blocks: vec![Block::ToolResult {
                        tool_use_id,
                        content: content_text(msg.content.as_ref()),
                        is_error: false,
                    }],
                });
            }
            other => {
                return Err(GatewayError::translation(format!(
                    "unknown message role '{other}'"
                )))
            }
        }
    }

    if messages.is_empty() {
        return Err(GatewayError::translation(
            "messages must contain at least one non-system entry",
        ));
    }

    let tools = req
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|t| ToolDefinition {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    parameters: t.function.parameters.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let tool_choice = match req.tool_choice.as_ref() {
        Some(ChatToolChoice::Mode(mode)) => Some(match mode.as_str() {
            "required" => ToolSelection::Any,
            "none" => ToolSelection::None,
            _ => ToolSelection::Auto,
        }),
        Some(ChatToolChoice::Specific(choice)) => {
            Some(ToolSelection::Tool(choice.function.name.clone()))
        }
        None => None,
    };

    Ok(CanonicalRequest {
        model: req.model.clone(),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        },
        messages,
        tools,
        tool_choice,
        sampling: SamplingParams {
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            stop_sequences: req.stop.clone().unwrap_or_default(),
        },
        stream: req.stream.unwrap_or(false),
        metadata: CallerMetadata {
            user_id: req.user.clone(),
            project_id: None,
        },
    })
}

fn content_text(content: Option<&ChatContent>) -> String {
    match content {
        Some(ChatContent::Text(t)) => t.clone(),
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

fn user_blocks(content: Option<&ChatContent>) -> Vec<Block> {
    match content {
        Some(ChatContent::Text(t)) => vec![Block::Text { text: t.clone() }],
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => Block::Text { text: text.clone() },
                ContentPart::ImageUrl { image_url } => Block::Image {
                    source: image_from_url(&image_url.url),
                },
            })
            .collect(),
        None => vec![Block::Text {
            text: String::new(),
        }],
    }
}

fn assistant_to_canonical(msg: &ChatMessage) -> CanonicalMessage {
    let mut blocks = Vec::new();

    let text = content_text(msg.content.as_ref());
    if !text.is_empty() {
        blocks.push(Block::Text { text });
    }

    if let Some(tool_calls) = &msg.tool_calls {
        for tc in tool_calls {
            blocks.push(Block::ToolUse {
                id: tc.id.clone(),
                name: tc.function.name.clone(),
                arguments: serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::Null),
            });
        }
    }

    CanonicalMessage {
        role: Role::Assistant,
        blocks,
    }
}

/// Encode a canonical request as an OpenAI wire request for `upstream_model`.
///
/// A canonical user message holding tool results expands into separate
/// `tool`-role messages; any remaining text/image content follows as a user
/// message. Blocks the OpenAI schema cannot carry (thinking, assistant-side
/// images) are a `TranslationError`.
pub fn request_from_canonical(
    req: &CanonicalRequest,
    upstream_model: &str,
) -> Result<ChatCompletionRequest> {
    if req.messages.is_empty() {
        return Err(GatewayError::translation(
            "messages must contain at least one entry",
        ));
    }

    let mut messages: Vec<ChatMessage> = Vec::new();

    if let Some(system) = &req.system {
        messages.push(ChatMessage::text("system", system.clone()));
    }

    for msg in &req.messages {
        match msg.role {
            Role::User => translate_user_message(&msg.blocks, &mut messages)?,
            Role::Assistant => messages.push(translate_assistant_message(&msg.blocks)?),
        }
    }

    let tools = if req.tools.is_empty() {
        None
    } else {
        Some(
            req.tools
                .iter()
                .map(|t| ChatTool {
                    tool_type: "function".to_string(),
                    function: ChatFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        )
    };

    let tool_choice = req.tool_choice.as_ref().map(|tc| match tc {
        ToolSelection::Auto => ChatToolChoice::Mode("auto".to_string()),
        ToolSelection::Any => ChatToolChoice::Mode("required".to_string()),
        ToolSelection::None => ChatToolChoice::Mode("none".to_string()),
        ToolSelection::Tool(name) => ChatToolChoice::Specific(ChatToolChoiceSpecific {
            choice_type: "function".to_string(),
            function: ChatToolChoiceFunction { name: name.clone() },
        }),
    });

    Ok(ChatCompletionRequest {
        model: upstream_model.to_string(),
        messages,
        max_tokens: req.sampling.max_tokens,
        temperature: req.sampling.temperature,
        top_p: req.sampling.top_p,
        stream: req.stream.then_some(true),
        stream_options: req.stream.then_some(StreamOptions {
            include_usage: true,
        }),
        stop: if req.sampling.stop_sequences.is_empty() {
            None
        } else {
            Some(req.sampling.stop_sequences.clone())
        },
        tools,
        tool_choice,
        user: req.metadata.user_id.clone(),
    })
}

fn translate_user_message(blocks: &[Block], out: &mut Vec<ChatMessage>) -> Result<()> {
    let mut parts: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            Block::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            Block::Image { source } => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrlDetail {
                    url: image_to_url(source),
                    detail: None,
                },
            }),
            Block::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Tool results precede any accompanying user content.
                let text = if *is_error {
                    format!("ERROR: {content}")
                } else {
                    content.clone()
                };
                out.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(ChatContent::Text(text)),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                    name: None,
                });
            }
            Block::ToolUse { .. } => {
                return Err(GatewayError::translation(
                    "tool_use blocks are only valid in assistant messages",
                ))
            }
            Block::Thinking { .. } => {
                return Err(GatewayError::translation(
                    "thinking blocks cannot be represented in the OpenAI chat format",
                ))
            }
        }
    }

    if !parts.is_empty() {
        out.push(ChatMessage {
            role: "user".to_string(),
            content: Some(collapse_parts(parts)),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        });
    } else if out.is_empty() || out.last().map(|m| m.role != "tool").unwrap_or(true) {
        // An empty user turn still has to appear in the conversation.
        out.push(ChatMessage::text("user", ""));
    }

    Ok(())
}

fn translate_assistant_message(blocks: &[Block]) -> Result<ChatMessage> {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks {
        match block {
            Block::Text { text } => text_parts.push(text),
            Block::ToolUse {
                id,
                name,
                arguments,
            } => tool_calls.push(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: serde_json::to_string(arguments).unwrap_or_default(),
                },
            }),
            Block::Thinking { .. } => {
                return Err(GatewayError::translation(
                    "thinking blocks cannot be represented in the OpenAI chat format",
                ))
            }
            Block::Image { .. } | Block::ToolResult { .. } => {
                return Err(GatewayError::translation(
                    "assistant messages may only carry text and tool_use blocks in the OpenAI chat format",
                ))
            }
        }
    }

    Ok(ChatMessage {
        role: "assistant".to_string(),
        content: if text_parts.is_empty() {
            None
        } else {
            Some(ChatContent::Text(text_parts.concat()))
        },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
        name: None,
    })
}

fn collapse_parts(parts: Vec<ContentPart>) -> ChatContent {
    if parts.len() == 1 {
        if let ContentPart::Text { text } = &parts[0] {
            return ChatContent::Text(text.clone());
        }
    }
    ChatContent::Parts(parts)
}

fn image_from_url(url: &str) -> ImageData {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return ImageData::Base64 {
                media_type: media_type.to_string(),
                data: data.to_string(),
            };
        }
    }
    ImageData::Url {
        url: url.to_string(),
    }
}

fn image_to_url(source: &ImageData) -> String {
    match source {
        ImageData::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        ImageData::Url { url } => url.clone(),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn response_to_canonical(resp: &ChatCompletionResponse) -> CanonicalResponse {
    let choice = resp.choices.first();
    let mut blocks = Vec::new();

    if let Some(c) = choice {
        // Reasoning models stream chain-of-thought separately; surface it as
        // ordinary text so no caller content is dropped.
        if let Some(reasoning) = c.message.reasoning_content.as_deref() {
            if !reasoning.is_empty() {
                blocks.push(Block::Text {
                    text: reasoning.to_string(),
                });
            }
        }
        if let Some(text) = c.message.content.as_deref() {
            if !text.is_empty() {
                blocks.push(Block::Text {
                    text: text.to_string(),
                });
            }
        }
        if let Some(tool_calls) = &c.message.tool_calls {
            for tc in tool_calls {
                blocks.push(Block::ToolUse {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: serde_json::from_str(&tc.function.arguments)
                        .unwrap_or(serde_json::Value::Null),
                });
            }
        }
    }

    let (stop_reason, raw) = match choice.and_then(|c| c.finish_reason.as_deref()) {
        Some(reason) => finish_reason_to_canonical(reason),
        None => (StopReason::EndTurn, None),
    };

    let usage = resp.usage.as_ref().map_or_else(TokenUsage::default, |u| {
        TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    });

    CanonicalResponse {
        id: resp.id.clone(),
        model: resp.model.clone(),
        blocks,
        stop_reason,
        raw_stop_reason: raw,
        usage,
    }
}

/// Encode a canonical response in OpenAI wire shape, echoing the model the
/// caller originally requested.
pub fn response_from_canonical(resp: &CanonicalResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in &resp.blocks {
        match block {
            Block::Text { text: t } => text.push_str(t),
            Block::ToolUse {
                id,
                name,
                arguments,
            } => tool_calls.push(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: serde_json::to_string(arguments).unwrap_or_default(),
                },
            }),
            _ => {}
        }
    }

    ChatCompletionResponse {
        id: completion_id(&resp.id),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: Some(text),
                reasoning_content: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: Some(finish_reason_from_canonical(
                resp.stop_reason,
                resp.raw_stop_reason.as_deref(),
            )),
        }],
        usage: Some(ChatUsage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
    }
}

/// Normalize an upstream id into an OpenAI-looking `chatcmpl-` id.
#[must_use]
pub fn completion_id(upstream_id: &str) -> String {
    if upstream_id.starts_with("chatcmpl-") {
        upstream_id.to_string()
    } else {
        format!("chatcmpl-{}", upstream_id.trim_start_matches("msg_"))
    }
}

// ---------------------------------------------------------------------------
// Finish reasons
// ---------------------------------------------------------------------------

pub fn finish_reason_to_canonical(reason: &str) -> (StopReason, Option<String>) {
    match reason {
        "stop" => (StopReason::EndTurn, None),
        "length" => (StopReason::MaxTokens, None),
        "tool_calls" | "function_call" => (StopReason::ToolUse, None),
        other => (StopReason::Error, Some(other.to_string())),
    }
}

/// Canonical → OpenAI `finish_reason`. `StopSequence` collapses to `stop`
/// (the OpenAI schema does not distinguish it); an unmapped upstream reason
/// is echoed verbatim for diagnostics.
#[must_use]
pub fn finish_reason_from_canonical(stop: StopReason, raw: Option<&str>) -> String {
    match stop {
        StopReason::EndTurn | StopReason::StopSequence => "stop".to_string(),
        StopReason::MaxTokens => "length".to_string(),
        StopReason::ToolUse => "tool_calls".to_string(),
        StopReason::Error => raw.unwrap_or("stop").to_string(),
    }
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// Build an OpenAI-shaped error body for the given HTTP status.
#[must_use]
pub fn error_envelope(status: u16, message: &str) -> ChatErrorResponse {
    let error_type = match status {
        400..=408 | 410..=428 => "invalid_request_error",
        429 => "rate_limit_error",
        _ => "api_error",
    };
    ChatErrorResponse::new(error_type, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_request() -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "hi"}
            ],
            "max_tokens": 128
        }))
        .unwrap()
    }

    #[test]
    fn test_request_round_trip_is_idempotent() {
        let wire = simple_request();
        let canonical = request_to_canonical(&wire).unwrap();
        let back = request_from_canonical(&canonical, &canonical.model).unwrap();
        let again = request_to_canonical(&back).unwrap();
        assert_eq!(canonical, again);
    }

    #[test]
    fn test_system_message_relocated() {
        let canonical = request_to_canonical(&simple_request()).unwrap();
        assert_eq!(canonical.system.as_deref(), Some("Be brief."));
        assert_eq!(canonical.messages.len(), 1);

        let back = request_from_canonical(&canonical, "gpt-4o").unwrap();
        assert_eq!(back.messages[0].role, "system");
        assert_eq!(back.messages.len(), 2);
    }

    #[test]
    fn test_late_system_message_rejected() {
        let wire: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "system", "content": "too late"}
            ]
        }))
        .unwrap();
        assert!(request_to_canonical(&wire).is_err());
    }

    #[test]
    fn test_unknown_role_rejected() {
        let wire: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "narrator", "content": "hi"}]
        }))
        .unwrap();
        let err = request_to_canonical(&wire).unwrap_err();
        assert!(err.to_string().contains("unknown message role"));
    }

    #[test]
    fn test_tool_round_trip() {
        let wire: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"London\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "raining"}
            ]
        }))
        .unwrap();

        let canonical = request_to_canonical(&wire).unwrap();
        assert_eq!(canonical.messages.len(), 3);
        assert!(matches!(
            canonical.messages[1].blocks[0],
            Block::ToolUse { .. }
        ));
        assert!(matches!(
            canonical.messages[2].blocks[0],
            Block::ToolResult { .. }
        ));

        let back = request_from_canonical(&canonical, "gpt-4o").unwrap();
        assert_eq!(back.messages[2].role, "tool");
        assert_eq!(back.messages[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_thinking_block_fails_loud() {
        let canonical = CanonicalRequest {
            model: "m".to_string(),
            system: None,
            messages: vec![CanonicalMessage {
                role: Role::Assistant,
                blocks: vec![Block::Thinking {
                    text: "hmm".to_string(),
                    signature: None,
                }],
            }],
            tools: Vec::new(),
            tool_choice: None,
            sampling: SamplingParams::default(),
            stream: false,
            metadata: CallerMetadata::default(),
        };
        let err = request_from_canonical(&canonical, "m").unwrap_err();
        assert!(matches!(err, GatewayError::Translation { .. }));
    }

    #[test]
    fn test_data_uri_round_trip() {
        let img = image_from_url("data:image/png;base64,aGVsbG8=");
        assert_eq!(
            img,
            ImageData::Base64 {
                media_type: "image/png".to_string(),
                data: "aGVsbG8=".to_string()
            }
        );
        assert_eq!(image_to_url(&img), "data:image/png;base64,aGVsbG8=");
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(finish_reason_to_canonical("stop").0, StopReason::EndTurn);
        assert_eq!(finish_reason_to_canonical("length").0, StopReason::MaxTokens);
        assert_eq!(
            finish_reason_to_canonical("tool_calls").0,
            StopReason::ToolUse
        );

        let (stop, raw) = finish_reason_to_canonical("content_filter");
        assert_eq!(stop, StopReason::Error);
        assert_eq!(raw.as_deref(), Some("content_filter"));

        assert_eq!(
            finish_reason_from_canonical(StopReason::ToolUse, None),
            "tool_calls"
        );
        assert_eq!(
            finish_reason_from_canonical(StopReason::StopSequence, None),
            "stop"
        );
    }

    #[test]
    fn test_response_translation() {
        let resp: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-abc",
            "object": "chat.completion",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13}
        }))
        .unwrap();

        let canonical = response_to_canonical(&resp);
        assert_eq!(canonical.stop_reason, StopReason::EndTurn);
        assert_eq!(canonical.usage.input_tokens, 10);
        assert_eq!(canonical.usage.output_tokens, 3);
        assert_eq!(canonical.blocks.len(), 1);
    }
}
