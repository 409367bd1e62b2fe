use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Provider used for model ids with no route entry; the id is passed
    /// through to it unchanged.
    pub default_provider: String,
    pub providers: HashMap<String, ProviderSettings>,
    /// Caller-facing model id -> (provider, upstream model).
    #[serde(default)]
    pub routes: HashMap<String, RouteEntry>,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Upstream API version header, where the provider uses one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
}

impl ProviderKind {
    #[must_use]
    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
        }
    }

    #[must_use]
    pub fn default_api_key_env(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::OpenAi => "OPENAI_API_KEY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Exchanges with the same correlation key separated by more than this
    /// gap start a new conversation.
    #[serde(default = "default_idle_gap_secs")]
    pub idle_gap_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            idle_gap_secs: default_idle_gap_secs(),
        }
    }
}

fn default_port() -> u16 {
    4100
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_db_path() -> PathBuf {
    PathBuf::from("llm-gateway.db")
}

fn default_idle_gap_secs() -> u64 {
    1800
}

impl ProviderSettings {
    /// Resolve the effective base URL (config override or kind default).
    #[must_use]
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.kind.default_base_url().to_string())
    }

    /// Resolve the API key from the configured environment variable.
    pub fn resolve_api_key(&self) -> Result<String> {
        let env_var = self
            .api_key_env
            .as_deref()
            .unwrap_or_else(|| self.kind.default_api_key_env());
        std::env::var(env_var).map_err(|_| {
            GatewayError::config(format!(
                "Environment variable '{env_var}' not set. Set it with your provider API key."
            ))
        })
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(GatewayError::config(format!(
            "No config file found. Searched: {}. Create one from config.example.toml",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    /// Check referential integrity: the default provider and every route
    /// target must name a configured provider.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(GatewayError::config("at least one provider must be configured"));
        }

        if !self.providers.contains_key(&self.default_provider) {
            return Err(GatewayError::config(format!(
                "default_provider '{}' is not a configured provider. Configured: {}",
                self.default_provider,
                self.provider_names().join(", ")
            )));
        }

        for (model, route) in &self.routes {
            if !self.providers.contains_key(&route.provider) {
                return Err(GatewayError::config(format!(
                    "route '{}' targets unknown provider '{}'",
                    model, route.provider
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn idle_gap(&self) -> Duration {
        Duration::from_secs(self.storage.idle_gap_secs)
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("llm-gateway.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = home_dir() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("llm-gateway")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("llm-gateway").join("config.toml"));
        }
        if let Some(home) = home_dir() {
            paths.push(home.join(".config").join("llm-gateway").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = home_dir() {
        paths.push(home.join(".llm-gateway.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
