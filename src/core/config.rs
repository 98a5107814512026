//! Application configuration management
//!
//! Configuration is resolved from four layers, highest priority first:
//!
//! 1. command-line flags
//! 2. `CODEGATE_*` environment variables
//! 3. the YAML config file given with `--config`
//! 4. built-in defaults (including the prompts compiled into the binary)
//!
//! All values are validated while resolving so the application fails fast
//! if misconfigured.

use crate::core::certs::CertPaths;
use crate::core::logging::{LogFormat, LogLevel};
use crate::core::prompts::PromptConfig;
use crate::core::provider::ProviderType;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Default API server port
pub const DEFAULT_PORT: u16 = 8989;

/// Default intercepting proxy port
pub const DEFAULT_PROXY_PORT: u16 = 8990;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_MODEL_BASE_PATH: &str = "./codegate_volume/models";
const DEFAULT_EMBEDDING_MODEL: &str = "all-minilm-L6-v2-q5_k_m.gguf";
const DEFAULT_CERTS_DIR: &str = "./codegate_volume/certs";
const DEFAULT_CA_CERT: &str = "ca.crt";
const DEFAULT_CA_KEY: &str = "ca.key";
const DEFAULT_SERVER_CERT: &str = "server.crt";
const DEFAULT_SERVER_KEY: &str = "server.key";
const DEFAULT_DB_PATH: &str = "./codegate_volume/db/codegate.db";

/// Environment variable names
pub mod env {
    pub const PORT: &str = "CODEGATE_APP_PORT";
    pub const PROXY_PORT: &str = "CODEGATE_PROXY_PORT";
    pub const HOST: &str = "CODEGATE_APP_HOST";
    pub const LOG_LEVEL: &str = "CODEGATE_APP_LOG_LEVEL";
    pub const LOG_FORMAT: &str = "CODEGATE_LOG_FORMAT";
    pub const PROMPTS_FILE: &str = "CODEGATE_PROMPTS_FILE";
    pub const MODEL_BASE_PATH: &str = "CODEGATE_MODEL_BASE_PATH";
    pub const EMBEDDING_MODEL: &str = "CODEGATE_EMBEDDING_MODEL";
    pub const CERTS_DIR: &str = "CODEGATE_CERTS_DIR";
    pub const CA_CERT: &str = "CODEGATE_CA_CERT";
    pub const CA_KEY: &str = "CODEGATE_CA_KEY";
    pub const SERVER_CERT: &str = "CODEGATE_SERVER_CERT";
    pub const SERVER_KEY: &str = "CODEGATE_SERVER_KEY";
    pub const DB_PATH: &str = "CODEGATE_DB_PATH";

    /// `CODEGATE_PROVIDER_<NAME>_URL`
    pub fn provider_url(env_name: &str) -> String {
        format!("CODEGATE_PROVIDER_{}_URL", env_name)
    }
}

/// Errors raised while resolving configuration
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Port must be between 1 and 65535")]
    InvalidPort,

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}")]
    InvalidLogFormat(String),

    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config file: {0}")]
    Parse(String),

    #[error("Invalid prompts: {0}")]
    Prompts(String),

    #[error("Invalid environment variable {name}: {message}")]
    Environment { name: String, message: String },
}

/// Validate a port number coming from any layer
pub fn validate_port(port: i64) -> Result<u16, ConfigurationError> {
    if (1..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err(ConfigurationError::InvalidPort)
    }
}

/// Shape of the YAML config file; every key is optional
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    port: Option<i64>,
    #[serde(default)]
    proxy_port: Option<i64>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    log_format: Option<String>,
    #[serde(default)]
    prompts: Option<serde_yaml::Value>,
    #[serde(default)]
    model_base_path: Option<String>,
    #[serde(default)]
    embedding_model: Option<String>,
    #[serde(default)]
    certs_dir: Option<PathBuf>,
    #[serde(default)]
    ca_cert: Option<String>,
    #[serde(default)]
    ca_key: Option<String>,
    #[serde(default)]
    server_cert: Option<String>,
    #[serde(default)]
    server_key: Option<String>,
    #[serde(default)]
    db_path: Option<PathBuf>,
    #[serde(default)]
    provider_urls: HashMap<String, String>,
}

/// Values given on the command line; `None` means "not given"
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub proxy_port: Option<u16>,
    pub host: Option<String>,
    pub log_level: Option<LogLevel>,
    pub log_format: Option<LogFormat>,
    pub prompts_path: Option<PathBuf>,
    pub provider_urls: BTreeMap<ProviderType, String>,
    pub model_base_path: Option<String>,
    pub embedding_model: Option<String>,
    pub certs_dir: Option<PathBuf>,
    pub ca_cert: Option<String>,
    pub ca_key: Option<String>,
    pub server_cert: Option<String>,
    pub server_key: Option<String>,
    pub db_path: Option<PathBuf>,
}

/// Resolved application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server port
    pub port: u16,

    /// Intercepting proxy port
    pub proxy_port: u16,

    /// Address both listeners bind to
    pub host: String,

    pub log_level: LogLevel,
    pub log_format: LogFormat,

    /// System prompt templates
    pub prompts: PromptConfig,

    /// Upstream base URL per provider
    pub provider_urls: BTreeMap<ProviderType, String>,

    /// Directory holding local model files
    pub model_base_path: String,

    /// Model file used for embeddings
    pub embedding_model: String,

    /// Certificate directory and file names
    pub certs_dir: PathBuf,
    pub ca_cert: String,
    pub ca_key: String,
    pub server_cert: String,
    pub server_key: String,

    /// SQLite database file
    pub db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            proxy_port: DEFAULT_PROXY_PORT,
            host: DEFAULT_HOST.to_string(),
            log_level: LogLevel::Info,
            log_format: LogFormat::Json,
            prompts: PromptConfig::defaults(),
            provider_urls: ProviderType::ALL
                .iter()
                .map(|p| (*p, p.default_url().to_string()))
                .collect(),
            model_base_path: DEFAULT_MODEL_BASE_PATH.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            certs_dir: PathBuf::from(DEFAULT_CERTS_DIR),
            ca_cert: DEFAULT_CA_CERT.to_string(),
            ca_key: DEFAULT_CA_KEY.to_string(),
            server_cert: DEFAULT_SERVER_CERT.to_string(),
            server_key: DEFAULT_SERVER_KEY.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

impl Config {
    /// Resolve configuration using the process environment
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The config file cannot be read, is not YAML, or is not a mapping
    /// - A prompts file cannot be loaded
    /// - Any port, log level or log format value is invalid
    pub fn load(
        config_path: Option<&Path>,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigurationError> {
        Self::load_with_env(config_path, overrides, |name| std::env::var(name).ok())
    }

    /// Resolve configuration with an explicit environment lookup
    pub fn load_with_env<F>(
        config_path: Option<&Path>,
        overrides: &ConfigOverrides,
        env_lookup: F,
    ) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env(env_lookup)?;
        config.apply_overrides(overrides)?;

        Ok(config)
    }

    /// Load configuration from a YAML file on top of the defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Read(format!("{}: {}", path.display(), e)))?;

        let value: serde_yaml::Value = serde_yaml::from_str(&content)
            .map_err(|e| ConfigurationError::Parse(e.to_string()))?;

        if !value.is_mapping() {
            return Err(ConfigurationError::Parse(
                "config file must contain a YAML dictionary".to_string(),
            ));
        }

        let file: FileConfig =
            serde_yaml::from_value(value).map_err(|e| ConfigurationError::Parse(e.to_string()))?;

        let mut config = Self::default();

        if let Some(port) = file.port {
            config.port = validate_port(port)?;
        }
        if let Some(port) = file.proxy_port {
            config.proxy_port = validate_port(port)?;
        }
        if let Some(host) = file.host {
            config.host = host;
        }
        if let Some(level) = file.log_level {
            config.log_level = level.parse().map_err(ConfigurationError::InvalidLogLevel)?;
        }
        if let Some(format) = file.log_format {
            config.log_format = format.parse().map_err(ConfigurationError::InvalidLogFormat)?;
        }

        match file.prompts {
            Some(serde_yaml::Value::String(prompts_path)) => {
                let mut prompts_path = PathBuf::from(prompts_path);
                if prompts_path.is_relative() {
                    if let Some(parent) = path.parent() {
                        prompts_path = parent.join(prompts_path);
                    }
                }
                config.prompts = PromptConfig::from_file(&prompts_path)?;
            }
            Some(inline) => {
                config.prompts = PromptConfig::from_yaml_value(&inline)?;
            }
            None => {}
        }

        for (name, url) in file.provider_urls {
            match ProviderType::from_str(&name) {
                Some(provider) => {
                    config.provider_urls.insert(provider, url);
                }
                None => warn!(provider = %name, "Ignoring unknown provider in config file"),
            }
        }

        if let Some(v) = file.model_base_path {
            config.model_base_path = v;
        }
        if let Some(v) = file.embedding_model {
            config.embedding_model = v;
        }
        if let Some(v) = file.certs_dir {
            config.certs_dir = v;
        }
        if let Some(v) = file.ca_cert {
            config.ca_cert = v;
        }
        if let Some(v) = file.ca_key {
            config.ca_key = v;
        }
        if let Some(v) = file.server_cert {
            config.server_cert = v;
        }
        if let Some(v) = file.server_key {
            config.server_key = v;
        }
        if let Some(v) = file.db_path {
            config.db_path = v;
        }

        Ok(config)
    }

    fn apply_env<F>(&mut self, env_lookup: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_port = |name: &str, raw: String| -> Result<u16, ConfigurationError> {
            let port: i64 = raw.trim().parse().map_err(|_| ConfigurationError::Environment {
                name: name.to_string(),
                message: format!("'{}' is not an integer", raw),
            })?;
            validate_port(port)
        };

        if let Some(raw) = env_lookup(env::PORT) {
            self.port = parse_port(env::PORT, raw)?;
        }
        if let Some(raw) = env_lookup(env::PROXY_PORT) {
            self.proxy_port = parse_port(env::PROXY_PORT, raw)?;
        }
        if let Some(host) = env_lookup(env::HOST) {
            self.host = host;
        }
        if let Some(raw) = env_lookup(env::LOG_LEVEL) {
            self.log_level = raw.parse().map_err(ConfigurationError::InvalidLogLevel)?;
        }
        if let Some(raw) = env_lookup(env::LOG_FORMAT) {
            self.log_format = raw.parse().map_err(ConfigurationError::InvalidLogFormat)?;
        }
        if let Some(path) = env_lookup(env::PROMPTS_FILE) {
            self.prompts = PromptConfig::from_file(path)?;
        }
        if let Some(v) = env_lookup(env::MODEL_BASE_PATH) {
            self.model_base_path = v;
        }
        if let Some(v) = env_lookup(env::EMBEDDING_MODEL) {
            self.embedding_model = v;
        }
        if let Some(v) = env_lookup(env::CERTS_DIR) {
            self.certs_dir = PathBuf::from(v);
        }
        if let Some(v) = env_lookup(env::CA_CERT) {
            self.ca_cert = v;
        }
        if let Some(v) = env_lookup(env::CA_KEY) {
            self.ca_key = v;
        }
        if let Some(v) = env_lookup(env::SERVER_CERT) {
            self.server_cert = v;
        }
        if let Some(v) = env_lookup(env::SERVER_KEY) {
            self.server_key = v;
        }
        if let Some(v) = env_lookup(env::DB_PATH) {
            self.db_path = PathBuf::from(v);
        }

        for provider in ProviderType::ALL {
            if let Some(url) = env_lookup(&env::provider_url(provider.env_name())) {
                self.provider_urls.insert(provider, url);
            }
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<(), ConfigurationError> {
        if let Some(port) = overrides.port {
            self.port = validate_port(port.into())?;
        }
        if let Some(port) = overrides.proxy_port {
            self.proxy_port = validate_port(port.into())?;
        }
        if let Some(ref host) = overrides.host {
            self.host = host.clone();
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if let Some(format) = overrides.log_format {
            self.log_format = format;
        }
        if let Some(ref path) = overrides.prompts_path {
            self.prompts = PromptConfig::from_file(path)?;
        }
        for (provider, url) in &overrides.provider_urls {
            self.provider_urls.insert(*provider, url.clone());
        }
        if let Some(ref v) = overrides.model_base_path {
            self.model_base_path = v.clone();
        }
        if let Some(ref v) = overrides.embedding_model {
            self.embedding_model = v.clone();
        }
        if let Some(ref v) = overrides.certs_dir {
            self.certs_dir = v.clone();
        }
        if let Some(ref v) = overrides.ca_cert {
            self.ca_cert = v.clone();
        }
        if let Some(ref v) = overrides.ca_key {
            self.ca_key = v.clone();
        }
        if let Some(ref v) = overrides.server_cert {
            self.server_cert = v.clone();
        }
        if let Some(ref v) = overrides.server_key {
            self.server_key = v.clone();
        }
        if let Some(ref v) = overrides.db_path {
            self.db_path = v.clone();
        }
        Ok(())
    }

    /// Upstream base URL for a provider, without a trailing slash
    pub fn provider_url(&self, provider: ProviderType) -> String {
        self.provider_urls
            .get(&provider)
            .map(String::as_str)
            .unwrap_or_else(|| provider.default_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// Certificate file locations
    pub fn cert_paths(&self) -> CertPaths {
        CertPaths {
            dir: self.certs_dir.clone(),
            ca_cert: self.ca_cert.clone(),
            ca_key: self.ca_key.clone(),
            server_cert: self.server_cert.clone(),
            server_key: self.server_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn create_test_config(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", body).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::load_with_env(None, &ConfigOverrides::default(), no_env).unwrap();
        assert_eq!(config.port, 8989);
        assert_eq!(config.proxy_port, 8990);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.provider_url(ProviderType::Ollama), "http://localhost:11434");
        assert_eq!(config.provider_url(ProviderType::OpenAI), "https://api.openai.com/v1");
        assert!(config.prompts.get("pii_redacted").is_some());
    }

    #[test]
    fn test_load_config_file() {
        let file = create_test_config(
            r#"
port: 9000
host: 0.0.0.0
log_level: debug
log_format: text
provider_urls:
  openai: https://example.com/v1
  lm_studio: http://lmstudio:1234
prompts:
  custom: Be terse.
"#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.provider_url(ProviderType::OpenAI), "https://example.com/v1");
        assert_eq!(config.provider_url(ProviderType::LmStudio), "http://lmstudio:1234");
        assert_eq!(config.provider_url(ProviderType::Vllm), "http://localhost:8000");
        assert_eq!(config.prompts.get("custom"), Some("Be terse."));
    }

    #[test]
    fn test_config_prompts_path_is_relative_to_config() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("my-prompts.yaml"), "hello: world\n").unwrap();
        let config_path = dir.path().join("config.yaml");
        fs::write(&config_path, "prompts: my-prompts.yaml\n").unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.prompts.get("hello"), Some("world"));
        assert_eq!(config.prompts.len(), 1);
    }

    #[test]
    fn test_config_file_rejects_malformed_yaml() {
        let file = create_test_config("port: [8989\n");
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigurationError::Parse(_)));
    }

    #[test]
    fn test_config_file_rejects_non_mapping() {
        let file = create_test_config("just a string\n");
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("dictionary"));
    }

    #[test]
    fn test_config_file_rejects_bad_values() {
        let file = create_test_config("port: 70000\n");
        assert!(matches!(
            Config::from_file(file.path()).unwrap_err(),
            ConfigurationError::InvalidPort
        ));

        let file = create_test_config("log_level: chatty\n");
        assert!(matches!(
            Config::from_file(file.path()).unwrap_err(),
            ConfigurationError::InvalidLogLevel(_)
        ));
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let err = Config::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigurationError::Read(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = create_test_config("port: 9000\nhost: filehost\n");
        let lookup = env_from(&[
            (env::PORT, "9100"),
            (env::LOG_LEVEL, "error"),
            ("CODEGATE_PROVIDER_OLLAMA_URL", "http://ollama:11434"),
        ]);
        let config =
            Config::load_with_env(Some(file.path()), &ConfigOverrides::default(), lookup).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.host, "filehost");
        assert_eq!(config.log_level, LogLevel::Error);
        assert_eq!(config.provider_url(ProviderType::Ollama), "http://ollama:11434");
    }

    #[test]
    fn test_cli_overrides_env_and_file() {
        let file = create_test_config("port: 9000\nlog_format: text\n");
        let lookup = env_from(&[(env::PORT, "9100"), (env::HOST, "envhost")]);
        let mut overrides = ConfigOverrides {
            port: Some(9200),
            log_format: Some(LogFormat::Json),
            ..Default::default()
        };
        overrides
            .provider_urls
            .insert(ProviderType::Anthropic, "http://anthropic.local/".to_string());

        let config = Config::load_with_env(Some(file.path()), &overrides, lookup).unwrap();
        assert_eq!(config.port, 9200);
        assert_eq!(config.host, "envhost");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.provider_url(ProviderType::Anthropic), "http://anthropic.local");
    }

    #[test]
    fn test_invalid_env_port() {
        let lookup = env_from(&[(env::PORT, "not-a-port")]);
        let err = Config::load_with_env(None, &ConfigOverrides::default(), lookup).unwrap_err();
        assert!(matches!(err, ConfigurationError::Environment { .. }));

        let lookup = env_from(&[(env::PROXY_PORT, "0")]);
        let err = Config::load_with_env(None, &ConfigOverrides::default(), lookup).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidPort));
    }

    #[test]
    fn test_cli_port_zero_rejected() {
        let overrides = ConfigOverrides {
            port: Some(0),
            ..Default::default()
        };
        let err = Config::load_with_env(None, &overrides, no_env).unwrap_err();
        assert_eq!(err.to_string(), "Port must be between 1 and 65535");
    }

    #[test]
    fn test_validate_port_bounds() {
        assert!(validate_port(1).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
        assert!(validate_port(-1).is_err());
    }
}
