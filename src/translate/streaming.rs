//! Streaming translation state machines.
//!
//! The two wire protocols segment streams differently: OpenAI emits flat
//! incremental deltas terminated by `[DONE]`, Anthropic emits typed
//! content-block start/delta/stop events. Translation therefore runs through
//! the canonical chunk sequence with an explicit state machine on each side:
//!
//! - readers ([`OpenAiChunkReader`], [`AnthropicEventReader`]) turn one
//!   upstream chunk/event into zero-or-more [`CanonicalChunk`]s;
//! - writers ([`AnthropicEventWriter`], [`OpenAiChunkWriter`]) turn one
//!   canonical chunk into zero-or-more outbound frames;
//! - [`ChunkAssembler`] folds a canonical chunk sequence back into a
//!   [`CanonicalResponse`] so streamed exchanges can be recorded like unary
//!   ones.
//!
//! Chunks are translated strictly in arrival order; nothing here buffers
//! beyond the state needed for the mapping itself.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;

use super::anthropic::{self, stop_reason_from_canonical, stop_reason_to_canonical};
use super::anthropic_types::{
    Delta, DeltaUsage, MessageDeltaBody, MessagesResponse, ResponseContentBlock, StreamEvent,
    Usage,
};
use super::openai::{self, finish_reason_from_canonical, finish_reason_to_canonical};
use super::openai_types::{
    ChatCompletionChunk, ChatUsage, ChunkChoice, ChunkDelta, ChunkToolCall, ChunkToolCallFunction,
};
use crate::canonical::{
    Block, BlockStart, CanonicalChunk, CanonicalResponse, StopReason, TokenUsage,
};
use crate::error::{GatewayError, Result};

// ---------------------------------------------------------------------------
// Upstream OpenAI chunks -> canonical
// ---------------------------------------------------------------------------

/// Translates an OpenAI chunk stream into canonical chunks.
///
/// The terminal `Finish` is deferred to [`OpenAiChunkReader::finish`] because
/// with `stream_options.include_usage` the usage arrives in a trailing chunk
/// after the one carrying `finish_reason`.
#[derive(Debug)]
pub struct OpenAiChunkReader {
    started: bool,
    finished: bool,
    in_text_block: bool,
    next_index: usize,
    /// OpenAI tool-call index -> canonical block index.
    tool_blocks: HashMap<u64, usize>,
    pending_stop: Option<(StopReason, Option<String>)>,
    usage: TokenUsage,
}

impl Default for OpenAiChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiChunkReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: false,
            finished: false,
            in_text_block: false,
            next_index: 0,
            tool_blocks: HashMap::new(),
            pending_stop: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<CanonicalChunk> {
        if self.finished {
            return Vec::new();
        }

        let mut out = Vec::new();

        if let Some(usage) = &chunk.usage {
            self.usage.input_tokens = usage.prompt_tokens;
            self.usage.output_tokens = usage.completion_tokens;
        }

        if !self.started {
            out.push(CanonicalChunk::Start {
                id: chunk.id.clone(),
                model: chunk.model.clone(),
                input_tokens: 0,
            });
            self.started = true;
        }

        let Some(choice) = chunk.choices.first() else {
            return out;
        };

        // Reasoning models stream chain-of-thought in `reasoning_content`;
        // both land in the same text block so no content is dropped.
        let content = choice
            .delta
            .content
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| {
                choice
                    .delta
                    .reasoning_content
                    .as_deref()
                    .filter(|s| !s.is_empty())
            });

        if let Some(text) = content {
            if !self.in_text_block {
                out.push(CanonicalChunk::BlockStart {
                    index: self.next_index,
                    start: BlockStart::Text,
                });
                self.in_text_block = true;
            }
            out.push(CanonicalChunk::TextDelta {
                index: self.next_index,
                text: text.to_string(),
            });
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for tc in tool_calls {
                if let Some(id) = &tc.id {
                    // A fresh tool call: close the text block and open a new
                    // tool_use block.
                    if self.in_text_block {
                        out.push(CanonicalChunk::BlockStop {
                            index: self.next_index,
                        });
                        self.next_index += 1;
                        self.in_text_block = false;
                    }
                    let name = tc
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    out.push(CanonicalChunk::BlockStart {
                        index: self.next_index,
                        start: BlockStart::ToolUse {
                            id: id.clone(),
                            name,
                        },
                    });
                    self.tool_blocks.insert(tc.index, self.next_index);
                    self.next_index += 1;
                }

                if let Some(args) = tc
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.as_deref())
                    .filter(|a| !a.is_empty())
                {
                    let index = self
                        .tool_blocks
                        .get(&tc.index)
                        .copied()
                        .unwrap_or(self.next_index.saturating_sub(1));
                    out.push(CanonicalChunk::ToolArgumentsDelta {
                        index,
                        partial_json: args.to_string(),
                    });
                }
            }
        }

        if let Some(reason) = &choice.finish_reason {
            out.extend(self.close_open_blocks());
            self.pending_stop = Some(finish_reason_to_canonical(reason));
        }

        out
    }

    /// Flush the terminal events. Call on `[DONE]` or when the upstream
    /// stream ends.
    pub fn finish(&mut self) -> Vec<CanonicalChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut out = Vec::new();
        if !self.started {
            out.push(CanonicalChunk::Start {
                id: String::new(),
                model: String::new(),
                input_tokens: 0,
            });
        }
        out.extend(self.close_open_blocks());

        let (stop_reason, raw) = self
            .pending_stop
            .take()
            .unwrap_or((StopReason::EndTurn, None));
        out.push(CanonicalChunk::Finish {
            stop_reason,
            raw_stop_reason: raw,
            usage: self.usage,
        });
        out
    }

    fn close_open_blocks(&mut self) -> Vec<CanonicalChunk> {
        let mut out = Vec::new();
        if self.in_text_block {
            out.push(CanonicalChunk::BlockStop {
                index: self.next_index,
            });
            self.next_index += 1;
            self.in_text_block = false;
        }
        let mut open_tools: Vec<usize> = std::mem::take(&mut self.tool_blocks)
            .into_values()
            .collect();
        open_tools.sort_unstable();
        for index in open_tools {
            out.push(CanonicalChunk::BlockStop { index });
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Upstream Anthropic SSE events -> canonical
// ---------------------------------------------------------------------------

/// Translates Anthropic SSE events into canonical chunks. Anthropic's
/// protocol is already block-structured, so this is mostly a relabeling; the
/// state tracks usage and whether the terminal event arrived.
#[derive(Debug, Default)]
pub struct AnthropicEventReader {
    input_tokens: u64,
    finished: bool,
}

impl AnthropicEventReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the upstream signalled a clean end of message. A stream that
    /// ends before this is truncated.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn process_event(&mut self, event: &StreamEvent) -> Result<Vec<CanonicalChunk>> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
                Ok(vec![CanonicalChunk::Start {
                    id: message.id.clone(),
                    model: message.model.clone(),
                    input_tokens: message.usage.input_tokens,
                }])
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let start = match content_block {
                    ResponseContentBlock::Text { .. } => BlockStart::Text,
                    ResponseContentBlock::ToolUse { id, name, .. } => BlockStart::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                    },
                };
                Ok(vec![CanonicalChunk::BlockStart {
                    index: *index,
                    start,
                }])
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => Ok(vec![CanonicalChunk::TextDelta {
                    index: *index,
                    text: text.clone(),
                }]),
                Delta::InputJsonDelta { partial_json } => {
                    Ok(vec![CanonicalChunk::ToolArgumentsDelta {
                        index: *index,
                        partial_json: partial_json.clone(),
                    }])
                }
                // Thinking output is not forwarded; the gateway never enables it upstream.
                Delta::ThinkingDelta { .. } => Ok(Vec::new()),
            },
            StreamEvent::ContentBlockStop { index } => {
                Ok(vec![CanonicalChunk::BlockStop { index: *index }])
            }
            StreamEvent::MessageDelta { delta, usage } => {
                self.finished = true;
                let (stop_reason, raw) = match delta.stop_reason.as_deref() {
                    Some(reason) => stop_reason_to_canonical(reason),
                    None => (StopReason::EndTurn, None),
                };
                Ok(vec![CanonicalChunk::Finish {
                    stop_reason,
                    raw_stop_reason: raw,
                    usage: TokenUsage {
                        input_tokens: self.input_tokens,
                        output_tokens: usage.output_tokens,
                    },
                }])
            }
            StreamEvent::MessageStop | StreamEvent::Ping => Ok(Vec::new()),
            StreamEvent::Error { error } => Err(GatewayError::truncated_stream(format!(
                "upstream error event: {}",
                error.message
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical -> Anthropic SSE events
// ---------------------------------------------------------------------------

/// Renders canonical chunks as Anthropic SSE events for a caller speaking the
/// Messages API. The `message_start` echoes the model the caller requested,
/// not the upstream one.
#[derive(Debug)]
pub struct AnthropicEventWriter {
    model: String,
}

impl AnthropicEventWriter {
    #[must_use]
    pub fn new(requested_model: &str) -> Self {
        Self {
            model: requested_model.to_string(),
        }
    }

    pub fn process(&mut self, chunk: &CanonicalChunk) -> Vec<StreamEvent> {
        match chunk {
            CanonicalChunk::Start {
                id, input_tokens, ..
            } => {
                let id = if id.is_empty() {
                    format!("msg_{}", uuid::Uuid::new_v4().simple())
                } else {
                    anthropic::message_id(id)
                };
                vec![
                    StreamEvent::MessageStart {
                        message: MessagesResponse {
                            id,
                            response_type: "message".to_string(),
                            role: "assistant".to_string(),
                            content: Vec::new(),
                            model: self.model.clone(),
                            stop_reason: None,
                            stop_sequence: None,
                            usage: Usage {
                                input_tokens: *input_tokens,
                                output_tokens: 0,
                                cache_creation_input_tokens: None,
                                cache_read_input_tokens: None,
                            },
                        },
                    },
                    StreamEvent::Ping,
                ]
            }
            CanonicalChunk::BlockStart { index, start } => {
                let content_block = match start {
                    BlockStart::Text => ResponseContentBlock::Text {
                        text: String::new(),
                    },
                    BlockStart::ToolUse { id, name } => ResponseContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                };
                vec![StreamEvent::ContentBlockStart {
                    index: *index,
                    content_block,
                }]
            }
            CanonicalChunk::TextDelta { index, text } => vec![StreamEvent::ContentBlockDelta {
                index: *index,
                delta: Delta::TextDelta { text: text.clone() },
            }],
            CanonicalChunk::ToolArgumentsDelta {
                index,
                partial_json,
            } => vec![StreamEvent::ContentBlockDelta {
                index: *index,
                delta: Delta::InputJsonDelta {
                    partial_json: partial_json.clone(),
                },
            }],
            CanonicalChunk::BlockStop { index } => {
                vec![StreamEvent::ContentBlockStop { index: *index }]
            }
            CanonicalChunk::Finish {
                stop_reason,
                raw_stop_reason,
                usage,
            } => vec![
                StreamEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: Some(stop_reason_from_canonical(
                            *stop_reason,
                            raw_stop_reason.as_deref(),
                        )),
                        stop_sequence: None,
                    },
                    usage: DeltaUsage {
                        output_tokens: usage.output_tokens,
                    },
                },
                StreamEvent::MessageStop,
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Canonical -> OpenAI chunks
// ---------------------------------------------------------------------------

/// Renders canonical chunks as OpenAI streaming chunks for a caller speaking
/// the Chat Completions API. The caller appends the `[DONE]` sentinel.
#[derive(Debug)]
pub struct OpenAiChunkWriter {
    id: String,
    model: String,
    created: i64,
    /// Canonical block index -> OpenAI tool-call index.
    tool_indices: HashMap<usize, u64>,
    next_tool_index: u64,
}

impl OpenAiChunkWriter {
    #[must_use]
    pub fn new(requested_model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: requested_model.to_string(),
            created: Utc::now().timestamp(),
            tool_indices: HashMap::new(),
            next_tool_index: 0,
        }
    }

    pub fn process(&mut self, chunk: &CanonicalChunk) -> Vec<ChatCompletionChunk> {
        match chunk {
            CanonicalChunk::Start { id, .. } => {
                if !id.is_empty() {
                    self.id = openai::completion_id(id);
                }
                vec![self.delta_chunk(ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(String::new()),
                    reasoning_content: None,
                    tool_calls: None,
                })]
            }
            CanonicalChunk::BlockStart { index, start } => match start {
                BlockStart::Text => Vec::new(),
                BlockStart::ToolUse { id, name } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indices.insert(*index, tool_index);
                    vec![self.delta_chunk(ChunkDelta {
                        role: None,
                        content: None,
                        reasoning_content: None,
                        tool_calls: Some(vec![ChunkToolCall {
                            index: tool_index,
                            id: Some(id.clone()),
                            call_type: Some("function".to_string()),
                            function: Some(ChunkToolCallFunction {
                                name: Some(name.clone()),
                                arguments: Some(String::new()),
                            }),
                        }]),
                    })]
                }
            },
            CanonicalChunk::TextDelta { text, .. } => vec![self.delta_chunk(ChunkDelta {
                role: None,
                content: Some(text.clone()),
                reasoning_content: None,
                tool_calls: None,
            })],
            CanonicalChunk::ToolArgumentsDelta {
                index,
                partial_json,
            } => {
                let tool_index = self.tool_indices.get(index).copied().unwrap_or(0);
                vec![self.delta_chunk(ChunkDelta {
                    role: None,
                    content: None,
                    reasoning_content: None,
                    tool_calls: Some(vec![ChunkToolCall {
                        index: tool_index,
                        id: None,
                        call_type: None,
                        function: Some(ChunkToolCallFunction {
                            name: None,
                            arguments: Some(partial_json.clone()),
                        }),
                    }]),
                })]
            }
            CanonicalChunk::BlockStop { .. } => Vec::new(),
            CanonicalChunk::Finish {
                stop_reason,
                raw_stop_reason,
                usage,
            } => {
                let mut finish = self.delta_chunk(ChunkDelta::default());
                finish.choices[0].finish_reason = Some(finish_reason_from_canonical(
                    *stop_reason,
                    raw_stop_reason.as_deref(),
                ));
                // Usage rides a trailing chunk with no choices, matching
                // `stream_options.include_usage` behavior.
                let mut usage_chunk = self.base_chunk();
                usage_chunk.usage = Some(ChatUsage {
                    prompt_tokens: usage.input_tokens,
                    completion_tokens: usage.output_tokens,
                    total_tokens: usage.input_tokens + usage.output_tokens,
                });
                vec![finish, usage_chunk]
            }
        }
    }

    fn base_chunk(&self) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: Vec::new(),
            usage: None,
        }
    }

    fn delta_chunk(&self, delta: ChunkDelta) -> ChatCompletionChunk {
        let mut chunk = self.base_chunk();
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta,
            finish_reason: None,
        });
        chunk
    }
}

// ---------------------------------------------------------------------------
// Canonical chunk sequence -> CanonicalResponse
// ---------------------------------------------------------------------------

/// Folds a canonical chunk sequence back into a [`CanonicalResponse`] so
/// streamed exchanges are recorded with the same shape as unary ones.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    id: String,
    model: String,
    blocks: BTreeMap<usize, BlockAccumulator>,
    stop_reason: Option<StopReason>,
    raw_stop_reason: Option<String>,
    usage: TokenUsage,
}

#[derive(Debug)]
enum BlockAccumulator {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        arguments: String,
    },
}

impl ChunkAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the terminal chunk has been observed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.stop_reason.is_some()
    }

    pub fn push(&mut self, chunk: &CanonicalChunk) {
        match chunk {
            CanonicalChunk::Start {
                id,
                model,
                input_tokens,
            } => {
                self.id = id.clone();
                self.model = model.clone();
                self.usage.input_tokens = *input_tokens;
            }
            CanonicalChunk::BlockStart { index, start } => {
                let acc = match start {
                    BlockStart::Text => BlockAccumulator::Text(String::new()),
                    BlockStart::ToolUse { id, name } => BlockAccumulator::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                    },
                };
                self.blocks.insert(*index, acc);
            }
            CanonicalChunk::TextDelta { index, text } => {
                if let Some(BlockAccumulator::Text(buf)) = self.blocks.get_mut(index) {
                    buf.push_str(text);
                }
            }
            CanonicalChunk::ToolArgumentsDelta {
                index,
                partial_json,
            } => {
                if let Some(BlockAccumulator::ToolUse { arguments, .. }) =
                    self.blocks.get_mut(index)
                {
                    arguments.push_str(partial_json);
                }
            }
            CanonicalChunk::BlockStop { .. } => {}
            CanonicalChunk::Finish {
                stop_reason,
                raw_stop_reason,
                usage,
            } => {
                self.stop_reason = Some(*stop_reason);
                self.raw_stop_reason = raw_stop_reason.clone();
                if usage.input_tokens > 0 {
                    self.usage.input_tokens = usage.input_tokens;
                }
                self.usage.output_tokens = usage.output_tokens;
            }
        }
    }

    #[must_use]
    pub fn into_response(self) -> CanonicalResponse {
        let blocks = self
            .blocks
            .into_values()
            .map(|acc| match acc {
                BlockAccumulator::Text(text) => Block::Text { text },
                BlockAccumulator::ToolUse {
                    id,
                    name,
                    arguments,
                } => Block::ToolUse {
                    id,
                    name,
                    arguments: serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null),
                },
            })
            .collect();

        CanonicalResponse {
            id: self.id,
            model: self.model,
            blocks,
            stop_reason: self.stop_reason.unwrap_or(StopReason::Error),
            raw_stop_reason: self.raw_stop_reason,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_chunk(content: &str, finish: Option<&str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: Some(content.to_string()),
                    reasoning_content: None,
                    tool_calls: None,
                },
                finish_reason: finish.map(String::from),
            }],
            usage: None,
        }
    }

    fn tool_chunk(id: Option<&str>, name: Option<&str>, args: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: None,
                    reasoning_content: None,
                    tool_calls: Some(vec![ChunkToolCall {
                        index: 0,
                        id: id.map(String::from),
                        call_type: id.map(|_| "function".to_string()),
                        function: Some(ChunkToolCallFunction {
                            name: name.map(String::from),
                            arguments: Some(args.to_string()),
                        }),
                    }]),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    #[test]
    fn test_openai_reader_text_stream() {
        let mut reader = OpenAiChunkReader::new();

        let chunks = reader.process_chunk(&text_chunk("Hello", None));
        assert!(matches!(chunks[0], CanonicalChunk::Start { .. }));
        assert!(matches!(
            chunks[1],
            CanonicalChunk::BlockStart {
                index: 0,
                start: BlockStart::Text
            }
        ));
        assert!(matches!(chunks[2], CanonicalChunk::TextDelta { .. }));

        let chunks = reader.process_chunk(&text_chunk(" world", None));
        assert_eq!(chunks.len(), 1);

        let chunks = reader.process_chunk(&text_chunk("", Some("stop")));
        assert!(matches!(chunks[0], CanonicalChunk::BlockStop { index: 0 }));

        let finale = reader.finish();
        assert_eq!(finale.len(), 1);
        assert!(matches!(
            finale[0],
            CanonicalChunk::Finish {
                stop_reason: StopReason::EndTurn,
                ..
            }
        ));
    }

    #[test]
    fn test_openai_reader_usage_after_finish_reason() {
        let mut reader = OpenAiChunkReader::new();
        reader.process_chunk(&text_chunk("hi", Some("stop")));

        // Trailing usage-only chunk, as sent with include_usage.
        let mut usage_chunk = text_chunk("", None);
        usage_chunk.choices.clear();
        usage_chunk.usage = Some(ChatUsage {
            prompt_tokens: 7,
            completion_tokens: 2,
            total_tokens: 9,
        });
        reader.process_chunk(&usage_chunk);

        match reader.finish().pop().unwrap() {
            CanonicalChunk::Finish { usage, .. } => {
                assert_eq!(usage.input_tokens, 7);
                assert_eq!(usage.output_tokens, 2);
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn test_openai_reader_tool_call_stream() {
        let mut reader = OpenAiChunkReader::new();
        reader.process_chunk(&text_chunk("Checking...", None));

        let chunks = reader.process_chunk(&tool_chunk(Some("call_1"), Some("search"), "{\"q\""));
        // Closes text block 0, opens tool block 1, streams arguments.
        assert!(matches!(chunks[0], CanonicalChunk::BlockStop { index: 0 }));
        assert!(matches!(
            chunks[1],
            CanonicalChunk::BlockStart {
                index: 1,
                start: BlockStart::ToolUse { .. }
            }
        ));
        assert!(matches!(
            chunks[2],
            CanonicalChunk::ToolArgumentsDelta { index: 1, .. }
        ));

        let chunks = reader.process_chunk(&tool_chunk(None, None, ":\"x\"}"));
        assert!(matches!(
            chunks[0],
            CanonicalChunk::ToolArgumentsDelta { index: 1, .. }
        ));
    }

    #[test]
    fn test_anthropic_reader_full_sequence() {
        let mut reader = AnthropicEventReader::new();

        let events: Vec<StreamEvent> = vec![
            serde_json::from_value(serde_json::json!({
                "type": "message_start",
                "message": {
                    "id": "msg_1", "type": "message", "role": "assistant",
                    "content": [], "model": "claude-3-haiku",
                    "stop_reason": null, "stop_sequence": null,
                    "usage": {"input_tokens": 12, "output_tokens": 0}
                }
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "type": "content_block_start", "index": 0,
                "content_block": {"type": "text", "text": ""}
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "Hi"}
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "type": "content_block_stop", "index": 0
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": 3}
            }))
            .unwrap(),
            StreamEvent::MessageStop,
        ];

        let mut canonical = Vec::new();
        for event in &events {
            canonical.extend(reader.process_event(event).unwrap());
        }

        assert!(reader.is_finished());
        assert!(matches!(canonical[0], CanonicalChunk::Start { input_tokens: 12, .. }));
        match canonical.last().unwrap() {
            CanonicalChunk::Finish {
                stop_reason, usage, ..
            } => {
                assert_eq!(*stop_reason, StopReason::EndTurn);
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 3);
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn test_anthropic_reader_error_event_truncates() {
        let mut reader = AnthropicEventReader::new();
        let event: StreamEvent = serde_json::from_value(serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "overloaded"}
        }))
        .unwrap();
        let err = reader.process_event(&event).unwrap_err();
        assert!(matches!(err, GatewayError::TruncatedStream { .. }));
    }

    #[test]
    fn test_anthropic_writer_echoes_requested_model() {
        let mut writer = AnthropicEventWriter::new("claude-3-haiku");
        let events = writer.process(&CanonicalChunk::Start {
            id: "chatcmpl-9".to_string(),
            model: "gpt-4o".to_string(),
            input_tokens: 5,
        });
        assert_eq!(events.len(), 2); // message_start + ping
        match &events[0] {
            StreamEvent::MessageStart { message } => {
                assert_eq!(message.model, "claude-3-haiku");
                assert!(message.id.starts_with("msg_"));
            }
            other => panic!("expected message_start, got {other:?}"),
        }
    }

    #[test]
    fn test_openai_chunks_through_to_anthropic_events() {
        // Full pipeline a translated stream takes: OpenAI upstream chunks ->
        // canonical -> Anthropic SSE events for the caller.
        let mut reader = OpenAiChunkReader::new();
        let mut writer = AnthropicEventWriter::new("claude-3-haiku");

        let mut events = Vec::new();
        for chunk in [
            text_chunk("Hello", None),
            text_chunk(" there", None),
            text_chunk("", Some("stop")),
        ] {
            for c in reader.process_chunk(&chunk) {
                events.extend(writer.process(&c));
            }
        }
        for c in reader.finish() {
            events.extend(writer.process(&c));
        }

        let names: Vec<&str> = events.iter().map(StreamEvent::event_name).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn test_openai_writer_tool_call() {
        let mut writer = OpenAiChunkWriter::new("gpt-4o");
        writer.process(&CanonicalChunk::Start {
            id: "msg_1".to_string(),
            model: "claude-3-haiku".to_string(),
            input_tokens: 0,
        });

        let chunks = writer.process(&CanonicalChunk::BlockStart {
            index: 1,
            start: BlockStart::ToolUse {
                id: "toolu_1".to_string(),
                name: "search".to_string(),
            },
        });
        let tc = chunks[0].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(tc[0].index, 0);
        assert_eq!(tc[0].id.as_deref(), Some("toolu_1"));

        let chunks = writer.process(&CanonicalChunk::ToolArgumentsDelta {
            index: 1,
            partial_json: "{\"q\":1}".to_string(),
        });
        let tc = chunks[0].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(tc[0].index, 0);

        let chunks = writer.process(&CanonicalChunk::Finish {
            stop_reason: StopReason::ToolUse,
            raw_stop_reason: None,
            usage: TokenUsage {
                input_tokens: 4,
                output_tokens: 9,
            },
        });
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
        assert!(chunks[1].choices.is_empty());
        assert_eq!(chunks[1].usage.as_ref().unwrap().total_tokens, 13);
    }

    #[test]
    fn test_assembler_rebuilds_response() {
        let mut assembler = ChunkAssembler::new();
        for chunk in [
            CanonicalChunk::Start {
                id: "msg_1".to_string(),
                model: "claude-3-haiku".to_string(),
                input_tokens: 10,
            },
            CanonicalChunk::BlockStart {
                index: 0,
                start: BlockStart::Text,
            },
            CanonicalChunk::TextDelta {
                index: 0,
                text: "Hel".to_string(),
            },
            CanonicalChunk::TextDelta {
                index: 0,
                text: "lo".to_string(),
            },
            CanonicalChunk::BlockStart {
                index: 1,
                start: BlockStart::ToolUse {
                    id: "t1".to_string(),
                    name: "f".to_string(),
                },
            },
            CanonicalChunk::ToolArgumentsDelta {
                index: 1,
                partial_json: "{\"a\":".to_string(),
            },
            CanonicalChunk::ToolArgumentsDelta {
                index: 1,
                partial_json: "2}".to_string(),
            },
            CanonicalChunk::Finish {
                stop_reason: StopReason::ToolUse,
                raw_stop_reason: None,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
            },
        ] {
            assembler.push(&chunk);
        }

        assert!(assembler.is_complete());
        let resp = assembler.into_response();
        assert_eq!(resp.blocks.len(), 2);
        assert_eq!(
            resp.blocks[0],
            Block::Text {
                text: "Hello".to_string()
            }
        );
        match &resp.blocks[1] {
            Block::ToolUse { arguments, .. } => assert_eq!(arguments["a"], 2),
            other => panic!("expected tool_use, got {other:?}"),
        }
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.usage.output_tokens, 5);
    }

    #[test]
    fn test_assembler_incomplete_stream_marks_error() {
        let mut assembler = ChunkAssembler::new();
        assembler.push(&CanonicalChunk::Start {
            id: "msg_1".to_string(),
            model: "m".to_string(),
            input_tokens: 0,
        });
        assert!(!assembler.is_complete());
        assert_eq!(assembler.into_response().stop_reason, StopReason::Error);
    }
}
