//! Provider implementations

pub mod anthropic;
pub mod lm_studio;
pub mod ollama;
pub mod openai;
pub mod vllm;

pub use anthropic::AnthropicProvider;
pub use lm_studio::LmStudioProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;
pub use vllm::VllmProvider;

use crate::core::config::Config;
use crate::core::provider::{Provider, ProviderType};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Upstream request timeout; local models can take a while to answer
const UPSTREAM_TIMEOUT_SECS: u64 = 300;

/// Registry of configured providers keyed by type
pub type ProviderRegistry = HashMap<ProviderType, Arc<dyn Provider>>;

/// Create one provider per backend, sharing a single HTTP client
pub fn build_registry(config: &Config) -> anyhow::Result<ProviderRegistry> {
    let client = Client::builder()
        .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
        .build()?;

    let mut registry: ProviderRegistry = HashMap::new();
    for provider_type in ProviderType::ALL {
        let base_url = config.provider_url(provider_type);
        let client = client.clone();
        let provider: Arc<dyn Provider> = match provider_type {
            ProviderType::Vllm => Arc::new(VllmProvider::new(client, base_url)),
            ProviderType::OpenAI => Arc::new(OpenAIProvider::new(client, base_url)),
            ProviderType::Anthropic => Arc::new(AnthropicProvider::new(client, base_url)),
            ProviderType::Ollama => Arc::new(OllamaProvider::new(client, base_url)),
            ProviderType::LmStudio => Arc::new(LmStudioProvider::new(client, base_url)),
        };
        registry.insert(provider_type, provider);
    }
    Ok(registry)
}
