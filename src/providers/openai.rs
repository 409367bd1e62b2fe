//! Provider for OpenAI-compatible Chat Completions upstreams.
//!
//! Also covers the OpenAI-compatible hosts (OpenRouter, Fireworks, Together,
//! Groq, DeepSeek, ...) — point `base_url` at them and the wire format is
//! identical.

use async_stream::stream;
use eventsource_stream::Eventsource;
use futures::StreamExt;

use super::{truncate, CallPolicy, ChunkStream, ModelInfo, Provider};
use crate::canonical::{CanonicalRequest, CanonicalResponse};
use crate::config::ProviderSettings;
use crate::error::{GatewayError, Result};
use crate::translate::openai::{request_from_canonical, response_to_canonical};
use crate::translate::openai_types::{
    ChatCompletionChunk, ChatCompletionResponse, ChatErrorResponse, StreamOptions,
};
use crate::translate::streaming::OpenAiChunkReader;

pub struct OpenAiProvider {
    name: String,
    base_url: String,
    api_key: String,
    policy: CallPolicy,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(name: &str, settings: &ProviderSettings) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            base_url: settings.effective_base_url(),
            api_key: settings.resolve_api_key()?,
            policy: CallPolicy {
                max_retries: settings.max_retries,
                timeout: settings.timeout(),
            },
            client: super::http_client()?,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn post(&self, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        self.client
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
    }

    async fn error_from_response(&self, response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ChatErrorResponse>(&body) {
            Ok(err) => err.error.message,
            Err(_) => format!("upstream returned status {status}: {}", truncate(&body, 300)),
        };
        GatewayError::provider_status(status, message)
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> CallPolicy {
        self.policy
    }

    async fn send(&self, model: &str, req: &CanonicalRequest) -> Result<CanonicalResponse> {
        let mut wire = request_from_canonical(req, model)?;
        wire.stream = None;
        wire.stream_options = None;

        tracing::debug!(provider = %self.name, model, "POST /chat/completions");

        let response = self
            .post(&wire)
            .send()
            .await
            .map_err(|e| GatewayError::provider(format!("request failed: {e}")))?;

        if response.status().is_client_error() || response.status().is_server_error() {
            return Err(self.error_from_response(response).await);
        }

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::provider(format!("failed to read response body: {e}")))?;
        let wire_resp: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            GatewayError::provider(format!(
                "failed to parse upstream response: {e}. Body: {}",
                truncate(&body, 300)
            ))
        })?;

        Ok(response_to_canonical(&wire_resp))
    }

    async fn stream(&self, model: &str, req: &CanonicalRequest) -> Result<ChunkStream> {
        let mut wire = request_from_canonical(req, model)?;
        wire.stream = Some(true);
        wire.stream_options = Some(StreamOptions {
            include_usage: true,
        });

        tracing::debug!(provider = %self.name, model, "POST /chat/completions (streaming)");

        let response = self
            .post(&wire)
            .send()
            .await
            .map_err(|e| GatewayError::provider(format!("streaming request failed: {e}")))?;

        if response.status().is_client_error() || response.status().is_server_error() {
            return Err(self.error_from_response(response).await);
        }

        let mut events = response.bytes_stream().eventsource();

        Ok(Box::pin(stream! {
            let mut reader = OpenAiChunkReader::new();

            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data.trim() == "[DONE]" {
                            break;
                        }
                        let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
                            Ok(c) => c,
                            Err(e) => {
                                tracing::debug!("skipping unparseable chunk: {e}");
                                continue;
                            }
                        };
                        for c in reader.process_chunk(&chunk) {
                            yield Ok(c);
                        }
                    }
                    Err(e) => {
                        yield Err(GatewayError::truncated_stream(format!(
                            "upstream stream failed: {e}"
                        )));
                        return;
                    }
                }
            }

            // Flush terminal chunks whether or not [DONE] arrived.
            for c in reader.finish() {
                yield Ok(c);
            }
        }))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| GatewayError::provider(format!("failed to fetch models: {e}")))?;

        if response.status().is_client_error() || response.status().is_server_error() {
            return Err(self.error_from_response(response).await);
        }

        #[derive(serde::Deserialize)]
        struct ModelsResponse {
            data: Vec<ModelEntry>,
        }
        #[derive(serde::Deserialize)]
        struct ModelEntry {
            id: String,
            owned_by: Option<String>,
        }

        let parsed: ModelsResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::provider(format!("failed to parse models response: {e}")))?;

        Ok(parsed
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                owned_by: m.owned_by.unwrap_or_else(|| self.name.clone()),
            })
            .collect())
    }
}
