//! Bidirectional translation between wire formats and the canonical
//! representation.
//!
//! All translation is pure (no I/O): per-format request/response mapping in
//! [`anthropic`] and [`openai`], streaming state machines in [`streaming`],
//! and the format-dispatched entry points below that the gateway handlers
//! call.

pub mod anthropic;
pub mod anthropic_types;
pub mod openai;
pub mod openai_types;
pub mod streaming;

use crate::canonical::{CanonicalRequest, CanonicalResponse, WireFormat};
use crate::error::{GatewayError, Result};

/// Parse an inbound payload in the given wire format into a canonical
/// request. Malformed JSON and structural violations both surface as
/// `TranslationError`s.
pub fn request_to_canonical(format: WireFormat, payload: &[u8]) -> Result<CanonicalRequest> {
    match format {
        WireFormat::Anthropic => {
            let wire: anthropic_types::MessagesRequest = serde_json::from_slice(payload)
                .map_err(|e| GatewayError::translation(format!("invalid request body: {e}")))?;
            anthropic::request_to_canonical(&wire)
        }
        WireFormat::OpenAi => {
            let wire: openai_types::ChatCompletionRequest = serde_json::from_slice(payload)
                .map_err(|e| GatewayError::translation(format!("invalid request body: {e}")))?;
            openai::request_to_canonical(&wire)
        }
    }
}

/// Serialize a canonical response in the given wire format.
pub fn response_from_canonical(
    format: WireFormat,
    resp: &CanonicalResponse,
) -> Result<serde_json::Value> {
    let value = match format {
        WireFormat::Anthropic => serde_json::to_value(anthropic::response_from_canonical(resp))?,
        WireFormat::OpenAi => serde_json::to_value(openai::response_from_canonical(resp))?,
    };
    Ok(value)
}

/// Build the error envelope the caller's SDK expects for its wire format.
#[must_use]
pub fn error_body(format: WireFormat, status: u16, message: &str) -> serde_json::Value {
    match format {
        WireFormat::Anthropic => {
            serde_json::to_value(anthropic::error_envelope(status, message))
                .unwrap_or_else(|_| serde_json::json!({}))
        }
        WireFormat::OpenAi => serde_json::to_value(openai::error_envelope(status, message))
            .unwrap_or_else(|_| serde_json::json!({})),
    }
}
