//! Upstream provider implementations.
//!
//! A [`Provider`] owns its configuration and HTTP client and is the only
//! place that knows the shape of an upstream's URLs, authentication and
//! version headers. Everything crosses this boundary in canonical form.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

use crate::canonical::{CanonicalChunk, CanonicalRequest, CanonicalResponse};
use crate::config::{ProviderKind, ProviderSettings};
use crate::error::Result;

/// A lazy canonical chunk sequence. The network call is issued by the
/// provider method that produced it; dropping the stream cancels the
/// underlying upstream connection. Not resumable: a stream can only be
/// restarted from scratch.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<CanonicalChunk>> + Send>>;

/// Retry/timeout discipline the router applies to calls against this
/// provider.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
}

/// One entry of a provider's model catalog.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub owned_by: String,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// The configured provider name (registry key), not the kind.
    fn name(&self) -> &str;

    fn policy(&self) -> CallPolicy;

    /// One unary completion against `model`.
    async fn send(&self, model: &str, req: &CanonicalRequest) -> Result<CanonicalResponse>;

    /// One streaming completion against `model`. Returns once upstream
    /// response headers arrive; chunks are read lazily from the returned
    /// stream.
    async fn stream(&self, model: &str, req: &CanonicalRequest) -> Result<ChunkStream>;

    /// The provider's model catalog, queried upstream.
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

/// Construct the provider implementation for one configured entry. Resolves
/// the credential eagerly so a missing key aborts startup instead of failing
/// the first request.
pub fn build(name: &str, settings: &ProviderSettings) -> Result<Arc<dyn Provider>> {
    Ok(match settings.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(name, settings)?),
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(name, settings)?),
    })
}

/// Shared reqwest client settings. Per-attempt deadlines are enforced by the
/// router, so the client itself only bounds connection establishment —
/// a whole-request timeout would kill long-lived streams.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?)
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
