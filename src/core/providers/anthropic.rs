//! Anthropic provider implementation

use crate::core::constants::{DEFAULT_ANTHROPIC_VERSION, header};
use crate::core::provider::{Provider, ProviderType, copy_headers, insert_default_header};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;

/// Anthropic provider; authenticates with the client's `x-api-key`
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> &Client {
        &self.client
    }

    fn auth_headers(&self, incoming: &HeaderMap) -> HeaderMap {
        let mut headers = copy_headers(
            incoming,
            &[
                header::X_API_KEY,
                header::ANTHROPIC_VERSION,
                header::ANTHROPIC_BETA,
            ],
        );
        insert_default_header(
            &mut headers,
            header::ANTHROPIC_VERSION,
            DEFAULT_ANTHROPIC_VERSION,
        );
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_defaults_api_version() {
        let provider = AnthropicProvider::new(Client::new(), "https://api.anthropic.com/v1".into());
        let mut incoming = HeaderMap::new();
        incoming.insert("x-api-key", HeaderValue::from_static("sk-ant-123"));

        let headers = provider.auth_headers(&incoming);
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-123");
        assert_eq!(headers.get("anthropic-version").unwrap(), DEFAULT_ANTHROPIC_VERSION);
    }

    #[test]
    fn test_keeps_client_api_version() {
        let provider = AnthropicProvider::new(Client::new(), "https://api.anthropic.com/v1".into());
        let mut incoming = HeaderMap::new();
        incoming.insert("anthropic-version", HeaderValue::from_static("2024-01-01"));

        let headers = provider.auth_headers(&incoming);
        assert_eq!(headers.get("anthropic-version").unwrap(), "2024-01-01");
        assert_eq!(
            provider.endpoint_url("/messages"),
            "https://api.anthropic.com/v1/messages"
        );
    }
}
