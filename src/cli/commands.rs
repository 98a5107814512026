//! Command handlers
//!
//! Each handler resolves the configuration it needs and does its work;
//! errors are returned to `main` for reporting.

use super::args::{Commands, GenerateCertsArgs, RestoreBackupArgs, ServeArgs, ShowPromptsArgs};
use crate::core::certs::CertificateAuthority;
use crate::core::config::{Config, ConfigOverrides};
use crate::core::logging::init_logging;
use crate::db;
use crate::server;
use anyhow::Context;
use tracing::info;

pub const NEW_CERTIFICATES: &str = "New Certificates generated successfully.";
pub const EXISTING_CERTIFICATES: &str = "Existing Certificates are already present.";

/// Run the selected command
pub async fn execute(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve(args) => serve(args).await,
        Commands::ShowPrompts(args) => show_prompts(args),
        Commands::GenerateCerts(args) => generate_certs(args),
        Commands::RestoreBackup(args) => restore_backup(args),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = Config::load(args.config.as_deref(), &args.overrides())?;
    init_logging(config.log_level, config.log_format);
    log_settings(&config);

    info!("Checking certificates and creating CA if needed");
    let services = server::build_services(config)?;
    println!("{}", certificate_message(services.certs_existed));

    server::run(services).await
}

fn log_settings(config: &Config) {
    let provider_urls: Vec<String> = config
        .provider_urls
        .iter()
        .map(|(provider, url)| format!("{}={}", provider.as_str(), url))
        .collect();

    info!(
        host = %config.host,
        port = config.port,
        proxy_port = config.proxy_port,
        log_level = %config.log_level,
        log_format = %config.log_format,
        prompts_loaded = config.prompts.len(),
        provider_urls = %provider_urls.join(","),
        model_base_path = %config.model_base_path,
        embedding_model = %config.embedding_model,
        certs_dir = %config.certs_dir.display(),
        db_path = %config.db_path.display(),
        "Starting server"
    );
}

fn show_prompts(args: ShowPromptsArgs) -> anyhow::Result<()> {
    let overrides = ConfigOverrides {
        prompts_path: args.prompts,
        ..ConfigOverrides::default()
    };
    let config = Config::load(None, &overrides)?;
    print!("{}", config.prompts.render_listing());
    Ok(())
}

fn generate_certs(args: GenerateCertsArgs) -> anyhow::Result<()> {
    let config = Config::load(None, &args.overrides())?;
    init_logging(config.log_level, config.log_format);

    let message = ensure_certificates(&config, args.force_certs)?;
    println!("{}", message);
    Ok(())
}

/// Make sure certificates exist, regenerating them when `force` is set
pub fn ensure_certificates(config: &Config, force: bool) -> anyhow::Result<&'static str> {
    let ca = CertificateAuthority::new(config.cert_paths());
    if force {
        info!(dir = %config.certs_dir.display(), "Removing existing certificates");
        ca.remove_certificates()
            .context("Failed to remove existing certificates")?;
    }

    info!("Checking certificates and creating certs if needed");
    let existed = ca
        .check_and_ensure_certificates()
        .context("Failed to generate certificates")?;
    Ok(certificate_message(existed))
}

fn certificate_message(existed: bool) -> &'static str {
    if existed {
        EXISTING_CERTIFICATES
    } else {
        NEW_CERTIFICATES
    }
}

fn restore_backup(args: RestoreBackupArgs) -> anyhow::Result<()> {
    let config = Config::load(None, &ConfigOverrides::default())?;
    db::restore_backup(&args.backup_path, &args.backup_name, &config.db_path)
        .context("Failed to restore backup")?;
    println!(
        "Successfully restored the backup '{}' from {}.",
        args.backup_name,
        args.backup_path.display()
    );
    Ok(())
}
