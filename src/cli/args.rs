//! CLI argument definitions.
//!
//! Uses clap derive macros for type-safe argument parsing.

use crate::core::config::{ConfigOverrides, validate_port};
use crate::core::logging::{LogFormat, LogLevel};
use crate::core::provider::ProviderType;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// CodeGate - a local privacy gateway for AI coding assistants
#[derive(Parser, Debug)]
#[command(name = "codegate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the API server and the intercepting proxy
    Serve(ServeArgs),

    /// Print the loaded system prompts
    ShowPrompts(ShowPromptsArgs),

    /// Generate the CA and server certificates
    GenerateCerts(GenerateCertsArgs),

    /// Replace the database with a backup
    RestoreBackup(RestoreBackupArgs),
}

/// Arguments for the serve command
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Port for the API server
    #[arg(long, value_parser = parse_port)]
    pub port: Option<u16>,

    /// Port for the intercepting proxy
    #[arg(long, value_parser = parse_port)]
    pub proxy_port: Option<u16>,

    /// Address both listeners bind to
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long, value_enum, ignore_case = true)]
    pub log_level: Option<LogLevel>,

    #[arg(long, value_enum, ignore_case = true)]
    pub log_format: Option<LogFormat>,

    /// YAML configuration file
    #[arg(long, value_parser = parse_existing_file)]
    pub config: Option<PathBuf>,

    /// YAML file with system prompts
    #[arg(long, value_parser = parse_existing_file)]
    pub prompts: Option<PathBuf>,

    #[arg(long)]
    pub vllm_url: Option<String>,

    #[arg(long)]
    pub openai_url: Option<String>,

    #[arg(long)]
    pub anthropic_url: Option<String>,

    #[arg(long)]
    pub ollama_url: Option<String>,

    #[arg(long)]
    pub lm_studio_url: Option<String>,

    /// Directory holding local model files
    #[arg(long)]
    pub model_base_path: Option<String>,

    #[arg(long)]
    pub embedding_model: Option<String>,

    /// Directory for CA and server certificates
    #[arg(long)]
    pub certs_dir: Option<PathBuf>,

    #[arg(long)]
    pub ca_cert: Option<String>,

    #[arg(long)]
    pub ca_key: Option<String>,

    #[arg(long)]
    pub server_cert: Option<String>,

    #[arg(long)]
    pub server_key: Option<String>,

    /// SQLite database file
    #[arg(long)]
    pub db_path: Option<PathBuf>,
}

impl ServeArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        let provider_urls = [
            (ProviderType::Vllm, &self.vllm_url),
            (ProviderType::OpenAI, &self.openai_url),
            (ProviderType::Anthropic, &self.anthropic_url),
            (ProviderType::Ollama, &self.ollama_url),
            (ProviderType::LmStudio, &self.lm_studio_url),
        ]
        .into_iter()
        .filter_map(|(provider, url)| url.clone().map(|url| (provider, url)))
        .collect();

        ConfigOverrides {
            port: self.port,
            proxy_port: self.proxy_port,
            host: self.host.clone(),
            log_level: self.log_level,
            log_format: self.log_format,
            prompts_path: self.prompts.clone(),
            provider_urls,
            model_base_path: self.model_base_path.clone(),
            embedding_model: self.embedding_model.clone(),
            certs_dir: self.certs_dir.clone(),
            ca_cert: self.ca_cert.clone(),
            ca_key: self.ca_key.clone(),
            server_cert: self.server_cert.clone(),
            server_key: self.server_key.clone(),
            db_path: self.db_path.clone(),
        }
    }
}

/// Arguments for the show-prompts command
#[derive(Args, Debug)]
pub struct ShowPromptsArgs {
    /// YAML file with system prompts
    #[arg(long, value_parser = parse_existing_file)]
    pub prompts: Option<PathBuf>,
}

/// Arguments for the generate-certs command
#[derive(Args, Debug)]
pub struct GenerateCertsArgs {
    /// Directory to write certificates to
    #[arg(long)]
    pub certs_out_dir: Option<PathBuf>,

    #[arg(long)]
    pub ca_cert_name: Option<String>,

    #[arg(long)]
    pub ca_key_name: Option<String>,

    #[arg(long)]
    pub server_cert_name: Option<String>,

    #[arg(long)]
    pub server_key_name: Option<String>,

    /// Remove existing certificates and generate new ones
    #[arg(long)]
    pub force_certs: bool,

    #[arg(long, value_enum, ignore_case = true)]
    pub log_level: Option<LogLevel>,

    #[arg(long, value_enum, ignore_case = true)]
    pub log_format: Option<LogFormat>,
}

impl GenerateCertsArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            log_level: self.log_level,
            log_format: self.log_format,
            certs_dir: self.certs_out_dir.clone(),
            ca_cert: self.ca_cert_name.clone(),
            ca_key: self.ca_key_name.clone(),
            server_cert: self.server_cert_name.clone(),
            server_key: self.server_key_name.clone(),
            ..ConfigOverrides::default()
        }
    }
}

/// Arguments for the restore-backup command
#[derive(Args, Debug)]
pub struct RestoreBackupArgs {
    /// Directory holding the backup
    #[arg(long)]
    pub backup_path: PathBuf,

    /// File name of the backup inside the directory
    #[arg(long)]
    pub backup_name: String,
}

/// Parse a port number, rejecting anything outside 1..=65535
pub fn parse_port(value: &str) -> Result<u16, String> {
    let port: i64 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a valid port number", value))?;
    validate_port(port).map_err(|e| e.to_string())
}

pub fn parse_existing_file(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("File '{}' does not exist", value))
    }
}
