//! Model routing and upstream call execution.
//!
//! The router owns the static model→provider mapping and the retry, backoff
//! and timeout discipline around provider calls. The provider registry is an
//! explicit immutable object handed in at construction, so tests can swap in
//! stub providers and run in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::canonical::{CanonicalRequest, CanonicalResponse};
use crate::config::{GatewayConfig, RouteEntry};
use crate::error::{GatewayError, Result};
use crate::providers::{ChunkStream, ModelInfo, Provider};

/// Immutable name → provider map, built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured provider. A provider that cannot be
    /// constructed (e.g. missing credential) fails startup.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (name, settings) in &config.providers {
            registry.insert(name.clone(), crate::providers::build(name, settings)?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: String, provider: Arc<dyn Provider>) {
        self.providers.insert(name, provider);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Provider>)> {
        self.providers.iter()
    }
}

/// The (provider, upstream model) pair selected for a request. Computed once
/// per request and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub provider: String,
    pub upstream_model: String,
}

pub struct ModelRouter {
    registry: ProviderRegistry,
    routes: HashMap<String, RouteEntry>,
    default_provider: String,
}

impl ModelRouter {
    #[must_use]
    pub fn new(
        registry: ProviderRegistry,
        routes: HashMap<String, RouteEntry>,
        default_provider: String,
    ) -> Self {
        Self {
            registry,
            routes,
            default_provider,
        }
    }

    pub fn from_config(config: &GatewayConfig, registry: ProviderRegistry) -> Self {
        Self::new(
            registry,
            config.routes.clone(),
            config.default_provider.clone(),
        )
    }

    /// Pure route lookup: mapped models go to their configured target,
    /// everything else falls through to the default provider with the id
    /// unchanged.
    #[must_use]
    pub fn route(&self, model: &str) -> RouteDecision {
        match self.routes.get(model) {
            Some(entry) => RouteDecision {
                provider: entry.provider.clone(),
                upstream_model: entry.model.clone(),
            },
            None => RouteDecision {
                provider: self.default_provider.clone(),
                upstream_model: model.to_string(),
            },
        }
    }

    fn provider_for(&self, decision: &RouteDecision) -> Result<Arc<dyn Provider>> {
        self.registry.get(&decision.provider).ok_or_else(|| {
            GatewayError::config(format!(
                "route targets unknown provider '{}'",
                decision.provider
            ))
        })
    }

    /// Execute a unary request with per-attempt timeout and retry on
    /// transient failures.
    pub async fn execute(&self, req: &CanonicalRequest) -> Result<CanonicalResponse> {
        let decision = self.route(&req.model);
        let provider = self.provider_for(&decision)?;
        let policy = provider.policy();

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(
                policy.timeout,
                provider.send(&decision.upstream_model, req),
            )
            .await;

            let err = match outcome {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(e)) => e,
                Err(_) => GatewayError::Timeout {
                    seconds: policy.timeout.as_secs(),
                },
            };

            attempt += 1;
            if attempt >= policy.max_retries.max(1) || !err.is_transient() {
                return Err(err);
            }

            let delay = backoff_delay(attempt - 1);
            tracing::warn!(
                provider = %decision.provider,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient upstream failure, retrying: {err}"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Execute a streaming request. Retry wraps only stream establishment;
    /// once the first byte has been read the stream is never restarted — a
    /// mid-stream failure reaches the caller as a truncated-stream error.
    pub async fn execute_stream(&self, req: &CanonicalRequest) -> Result<ChunkStream> {
        let decision = self.route(&req.model);
        let provider = self.provider_for(&decision)?;
        let policy = provider.policy();

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(
                policy.timeout,
                provider.stream(&decision.upstream_model, req),
            )
            .await;

            let err = match outcome {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => e,
                Err(_) => GatewayError::Timeout {
                    seconds: policy.timeout.as_secs(),
                },
            };

            attempt += 1;
            if attempt >= policy.max_retries.max(1) || !err.is_transient() {
                return Err(err);
            }

            let delay = backoff_delay(attempt - 1);
            tracing::warn!(
                provider = %decision.provider,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "stream establishment failed, retrying: {err}"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// The merged model catalog for `/v1/models`: every routed caller-facing
    /// id plus whatever the providers report upstream. A provider whose
    /// catalog query fails is logged and skipped rather than failing the
    /// whole listing.
    pub async fn catalog(&self) -> Vec<ModelInfo> {
        let mut models: Vec<ModelInfo> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for (model, entry) in &self.routes {
            if seen.insert(model.clone()) {
                models.push(ModelInfo {
                    id: model.clone(),
                    owned_by: entry.provider.clone(),
                });
            }
        }

        for (name, provider) in self.registry.iter() {
            match provider.list_models().await {
                Ok(list) => {
                    for m in list {
                        if seen.insert(m.id.clone()) {
                            models.push(m);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(provider = %name, "failed to fetch model catalog: {e}");
                }
            }
        }

        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }
}

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 8_000;

/// Exponential backoff with jitter: the delay for attempt `n` is drawn from
/// the upper half of `[0, min(base * 2^n, cap)]`.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(6));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(capped / 2 + jitter)
}
