//! Provider abstraction layer for the upstream LLM backends
//!
//! This module defines a common trait for the providers CodeGate forwards to
//! (vLLM, OpenAI, Anthropic, Ollama, LM Studio). Each provider decides how
//! its URLs are built and which client headers are passed through; sending
//! and error classification are shared.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Error types for provider operations
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Upstream unreachable: {0}")]
    Unreachable(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ProviderError {
    /// Status code returned to the client for this error
    pub fn status_code(&self) -> u16 {
        match self {
            ProviderError::Authentication(_) => 401,
            ProviderError::RateLimit(_) => 429,
            ProviderError::BadRequest(_) => 400,
            ProviderError::ApiError { status, .. } => *status,
            ProviderError::Unreachable(_) | ProviderError::Unexpected(_) => 502,
        }
    }

    fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => ProviderError::Authentication(body),
            429 => ProviderError::RateLimit(body),
            400 => ProviderError::BadRequest(body),
            _ => ProviderError::ApiError {
                status,
                message: body,
            },
        }
    }
}

/// A request ready to be sent upstream
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path below the provider prefix, without a leading slash
    pub path: String,
    pub query: Option<String>,
    /// Headers received from the client
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

/// Trait for LLM API providers
#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Get the provider name
    fn provider_name(&self) -> &str {
        self.provider_type().as_str()
    }

    /// Upstream base URL
    fn base_url(&self) -> &str;

    fn client(&self) -> &Client;

    /// Full upstream URL for a path below the provider prefix
    fn endpoint_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }

    /// Headers passed from the client to the upstream
    fn auth_headers(&self, incoming: &HeaderMap) -> HeaderMap;

    /// Whether a request without a `stream` field streams its response
    fn streams_by_default(&self) -> bool {
        false
    }

    /// Send a request and return the raw upstream response
    ///
    /// Non-success statuses are turned into `ProviderError`s with the
    /// upstream body as the message.
    async fn send(&self, request: UpstreamRequest) -> Result<reqwest::Response, ProviderError> {
        let mut url = self.endpoint_url(&request.path);
        if let Some(ref query) = request.query {
            url.push('?');
            url.push_str(query);
        }

        debug!(provider = self.provider_name(), %url, "Forwarding request upstream");

        let mut builder = self
            .client()
            .request(request.method, &url)
            .headers(self.auth_headers(&request.headers));

        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ProviderError::Unreachable(e.to_string())
            } else {
                ProviderError::Unexpected(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::from_status(status.as_u16(), error_text));
        }

        Ok(response)
    }
}

/// Copy the named headers from the client request when present
pub fn copy_headers(incoming: &HeaderMap, names: &[&str]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in names {
        if let Some(value) = incoming.get(*name) {
            if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.insert(header_name, value.clone());
            }
        }
    }
    headers
}

/// Insert a header unless the client already sent one
pub fn insert_default_header(headers: &mut HeaderMap, name: &'static str, value: &'static str) {
    if !headers.contains_key(name) {
        headers.insert(name, HeaderValue::from_static(value));
    }
}

/// Prefix `v1/` for OpenAI compatible servers whose base URL has no version
pub fn with_v1_prefix(path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.starts_with("v1/") || path == "v1" {
        path.to_string()
    } else {
        format!("v1/{}", path)
    }
}

/// Supported provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderType {
    Vllm,
    OpenAI,
    Anthropic,
    Ollama,
    LmStudio,
}

impl ProviderType {
    pub const ALL: [ProviderType; 5] = [
        ProviderType::Vllm,
        ProviderType::OpenAI,
        ProviderType::Anthropic,
        ProviderType::Ollama,
        ProviderType::LmStudio,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "vllm" => Some(ProviderType::Vllm),
            "openai" => Some(ProviderType::OpenAI),
            "anthropic" => Some(ProviderType::Anthropic),
            "ollama" => Some(ProviderType::Ollama),
            "lm_studio" | "lm-studio" | "lmstudio" => Some(ProviderType::LmStudio),
            _ => None,
        }
    }

    /// Name used in URLs, config keys and stored records
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Vllm => "vllm",
            ProviderType::OpenAI => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Ollama => "ollama",
            ProviderType::LmStudio => "lm_studio",
        }
    }

    /// Name used in `CODEGATE_PROVIDER_<NAME>_URL`
    pub fn env_name(&self) -> &'static str {
        match self {
            ProviderType::Vllm => "VLLM",
            ProviderType::OpenAI => "OPENAI",
            ProviderType::Anthropic => "ANTHROPIC",
            ProviderType::Ollama => "OLLAMA",
            ProviderType::LmStudio => "LM_STUDIO",
        }
    }

    pub fn default_url(&self) -> &'static str {
        match self {
            ProviderType::Vllm => "http://localhost:8000",
            ProviderType::OpenAI => "https://api.openai.com/v1",
            ProviderType::Anthropic => "https://api.anthropic.com/v1",
            ProviderType::Ollama => "http://localhost:11434",
            ProviderType::LmStudio => "http://localhost:1234",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
