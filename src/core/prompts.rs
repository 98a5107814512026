//! System prompt templates
//!
//! Prompts are loaded from a YAML mapping of prompt name to prompt text. The
//! order of the file is preserved so `show-prompts` prints them as written.

use crate::core::config::ConfigurationError;
use serde_yaml::Value;
use std::fs;
use std::path::Path;

/// Prompts shipped with the binary
const DEFAULT_PROMPTS: &str = include_str!("../../prompts/default.yaml");

/// Name of the prompt injected after PII redaction
pub const PII_REDACTED: &str = "pii_redacted";

/// Ordered collection of named system prompts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptConfig {
    prompts: Vec<(String, String)>,
}

impl PromptConfig {
    /// Prompts compiled into the binary from `prompts/default.yaml`
    pub fn defaults() -> Self {
        match Self::from_yaml_str(DEFAULT_PROMPTS) {
            Ok(prompts) => prompts,
            Err(e) => {
                tracing::warn!("Failed to load default prompts: {}", e);
                Self::default()
            }
        }
    }

    /// Load prompts from a YAML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is not valid YAML, or does
    /// not contain a mapping of string names to string prompts.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigurationError::Prompts(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigurationError> {
        let value: Value = serde_yaml::from_str(content)
            .map_err(|e| ConfigurationError::Prompts(format!("failed to parse YAML: {}", e)))?;
        Self::from_yaml_value(&value)
    }

    /// Build from an already parsed YAML mapping (inline `prompts:` in a config file)
    pub fn from_yaml_value(value: &Value) -> Result<Self, ConfigurationError> {
        let mapping = value.as_mapping().ok_or_else(|| {
            ConfigurationError::Prompts("prompts file must contain a YAML dictionary".to_string())
        })?;

        let mut prompts = Vec::with_capacity(mapping.len());
        for (key, text) in mapping {
            let name = key.as_str().ok_or_else(|| {
                ConfigurationError::Prompts(format!("prompt name {:?} is not a string", key))
            })?;
            let text = text.as_str().ok_or_else(|| {
                ConfigurationError::Prompts(format!("prompt '{}' must be a string", name))
            })?;
            prompts.push((name.to_string(), text.to_string()));
        }

        Ok(Self { prompts })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.prompts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, text)| text.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.prompts.iter().map(|(n, t)| (n.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Text printed by `codegate show-prompts`
    pub fn render_listing(&self) -> String {
        let rule = "-".repeat(40);
        let mut out = String::from("Loaded prompts:\n");
        out.push_str(&rule);
        out.push('\n');
        for (name, text) in self.iter() {
            out.push_str(&format!("\n{}:\n{}\n{}\n", name, text, rule));
        }
        out
    }
}
