//! Provider for the Anthropic Messages API.

use async_stream::stream;
use eventsource_stream::Eventsource;
use futures::StreamExt;

use super::{truncate, CallPolicy, ChunkStream, ModelInfo, Provider};
use crate::canonical::{CanonicalRequest, CanonicalResponse};
use crate::config::ProviderSettings;
use crate::error::{GatewayError, Result};
use crate::translate::anthropic::{request_from_canonical, response_to_canonical};
use crate::translate::anthropic_types::{ErrorResponse, MessagesResponse, StreamEvent};
use crate::translate::streaming::AnthropicEventReader;

const DEFAULT_API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    api_version: String,
    policy: CallPolicy,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(name: &str, settings: &ProviderSettings) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            base_url: settings.effective_base_url(),
            api_key: settings.resolve_api_key()?,
            api_version: settings
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            policy: CallPolicy {
                max_retries: settings.max_retries,
                timeout: settings.timeout(),
            },
            client: super::http_client()?,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn post(&self, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        self.client
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("Content-Type", "application/json")
            .json(body)
    }

    async fn error_from_response(&self, response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => err.error.message,
            Err(_) => format!("upstream returned status {status}: {}", truncate(&body, 300)),
        };
        GatewayError::provider_status(status, message)
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> CallPolicy {
        self.policy
    }

    async fn send(&self, model: &str, req: &CanonicalRequest) -> Result<CanonicalResponse> {
        let mut wire = request_from_canonical(req, model)?;
        wire.stream = None;

        tracing::debug!(provider = %self.name, model, "POST /v1/messages");

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
        let wire_resp: MessagesResponse = serde_json::from_str(&body).map_err(|e| {
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

        tracing::debug!(provider = %self.name, model, "POST /v1/messages (streaming)");

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
            let mut reader = AnthropicEventReader::new();
            let mut failed = false;

            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        let parsed: StreamEvent = match serde_json::from_str(&event.data) {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::debug!(event = %event.event, "skipping unparseable event: {e}");
                                continue;
                            }
                        };
                        match reader.process_event(&parsed) {
                            Ok(chunks) => {
                                for chunk in chunks {
                                    yield Ok(chunk);
                                }
                            }
                            Err(e) => {
                                failed = true;
                                yield Err(e);
                                break;
                            }
                        }
                        if reader.is_finished() {
                            break;
                        }
                    }
                    Err(e) => {
                        failed = true;
                        yield Err(GatewayError::truncated_stream(format!(
                            "upstream stream failed: {e}"
                        )));
                        break;
                    }
                }
            }

            if !failed && !reader.is_finished() {
                yield Err(GatewayError::truncated_stream(
                    "upstream ended before the message completed",
                ));
            }
        }))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/v1/models", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
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
                owned_by: self.name.clone(),
            })
            .collect())
    }
}
