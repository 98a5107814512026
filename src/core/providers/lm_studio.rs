//! LM Studio provider implementation

use crate::core::constants::header;
use crate::core::provider::{Provider, ProviderType, copy_headers, with_v1_prefix};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::HeaderMap;

/// LM Studio's local server speaks the OpenAI API below `/v1`
pub struct LmStudioProvider {
    client: Client,
    base_url: String,
}

impl LmStudioProvider {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl Provider for LmStudioProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::LmStudio
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
