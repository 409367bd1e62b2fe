//! Error types for the gateway.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Caller payload cannot be expressed in the target wire format.
    /// Always a client-facing 400, never retried.
    #[error("Translation error: {message}")]
    Translation { message: String },

    /// Upstream transport failure or non-2xx response. `status` is `None`
    /// for network-level failures that never produced a response.
    #[error("Provider error: {message}")]
    Provider {
        message: String,
        status: Option<u16>,
    },

    #[error("Upstream call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The upstream stream failed after the first byte. Not retryable:
    /// restarting would risk duplicating partial output already delivered.
    #[error("Stream truncated: {message}")]
    TruncatedStream { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            status: None,
        }
    }

    pub fn provider_status(status: u16, msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            status: Some(status),
        }
    }

    pub fn truncated_stream(msg: impl Into<String>) -> Self {
        Self::TruncatedStream {
            message: msg.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
        }
    }

    /// Whether the router may retry the attempt. Transient: network-level
    /// failures, timeouts, upstream 5xx and 429. Everything else — including
    /// every translation error — propagates immediately.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Provider { status, .. } => match status {
                None => true,
                Some(429) => true,
                Some(s) => *s >= 500,
            },
            GatewayError::Timeout { .. } => true,
            GatewayError::Http(_) => true,
            _ => false,
        }
    }

    /// The HTTP status the gateway surfaces for this error.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Translation { .. } => 400,
            GatewayError::Provider { status, .. } => status.unwrap_or(502),
            GatewayError::Timeout { .. } => 504,
            GatewayError::TruncatedStream { .. } => 502,
            GatewayError::Config { .. } => 500,
            GatewayError::Storage { .. } => 500,
            _ => 502,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::provider("connection reset").is_transient());
        assert!(GatewayError::provider_status(500, "boom").is_transient());
        assert!(GatewayError::provider_status(429, "slow down").is_transient());
        assert!(GatewayError::Timeout { seconds: 30 }.is_transient());

        assert!(!GatewayError::provider_status(400, "bad request").is_transient());
        assert!(!GatewayError::provider_status(404, "no such model").is_transient());
        assert!(!GatewayError::translation("empty messages").is_transient());
        assert!(!GatewayError::truncated_stream("mid-stream EOF").is_transient());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(GatewayError::translation("x").http_status(), 400);
        assert_eq!(GatewayError::provider("x").http_status(), 502);
        assert_eq!(GatewayError::provider_status(429, "x").http_status(), 429);
        assert_eq!(GatewayError::Timeout { seconds: 1 }.http_status(), 504);
    }
}
