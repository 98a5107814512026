//! Ollama provider implementation
//!
//! Ollama's native API lives below `/api` and streams newline delimited JSON
//! unless the request sets `"stream": false`.

use crate::core::provider::{Provider, ProviderType};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;

pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Ollama
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> &Client {
        &self.client
    }

    fn auth_headers(&self, _incoming: &HeaderMap) -> HeaderMap {
        HeaderMap::new()
    }

    fn streams_by_default(&self) -> bool {
        true
    }
}
