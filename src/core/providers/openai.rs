//! OpenAI provider implementation

use crate::core::constants::header;
use crate::core::provider::{Provider, ProviderType, copy_headers};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;

/// OpenAI provider; the client's bearer token is passed through
pub struct OpenAIProvider {
    client: Client,
    base_url: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider
    ///
    /// # Arguments
    ///
    /// * `client` - Shared HTTP client
    /// * `base_url` - OpenAI API base URL including the version, e.g. `https://api.openai.com/v1`
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAI
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> &Client {
        &self.client
    }

    fn auth_headers(&self, incoming: &HeaderMap) -> HeaderMap {
        copy_headers(
            incoming,
            &[header::AUTHORIZATION, header::OPENAI_ORGANIZATION],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_endpoint_url() {
        let provider = OpenAIProvider::new(Client::new(), "https://api.openai.com/v1".into());
        assert_eq!(
            provider.endpoint_url("chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_passes_bearer_token() {
        let provider = OpenAIProvider::new(Client::new(), "https://api.openai.com/v1".into());
        let mut incoming = HeaderMap::new();
        incoming.insert("authorization", HeaderValue::from_static("Bearer sk-abc"));
        incoming.insert("x-api-key", HeaderValue::from_static("not-for-openai"));

        let headers = provider.auth_headers(&incoming);
        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-abc");
        assert!(headers.get("x-api-key").is_none());
    }
}
