//! vLLM provider implementation
//!
//! vLLM serves an OpenAI compatible API below `/v1`. The configured base URL
//! carries no version, so requests are prefixed here.

use crate::core::constants::header;
use crate::core::provider::{Provider, ProviderType, copy_headers, with_v1_prefix};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;

pub struct VllmProvider {
    client: Client,
    base_url: String,
}

impl VllmProvider {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl Provider for VllmProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Vllm
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> &Client {
        &self.client
    }

    fn endpoint_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, with_v1_prefix(path))
    }

    fn auth_headers(&self, incoming: &HeaderMap) -> HeaderMap {
        copy_headers(incoming, &[header::AUTHORIZATION])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_adds_version() {
        let provider = VllmProvider::new(Client::new(), "http://localhost:8000".into());
        assert_eq!(
            provider.endpoint_url("chat/completions"),
            "http://localhost:8000/v1/chat/completions"
        );
        assert_eq!(
            provider.endpoint_url("v1/completions"),
            "http://localhost:8000/v1/completions"
        );
    }
}
