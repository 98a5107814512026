//! Server lifecycle
//!
//! Opens storage, makes sure certificates exist, then runs the API server
//! and the intercepting proxy side by side until a shutdown signal arrives.

use crate::api::endpoints::{AppState, create_router};
use crate::core::certs::CertificateAuthority;
use crate::core::config::Config;
use crate::core::providers::build_registry;
use crate::db::Database;
use crate::models::db::Settings;
use crate::pipeline::PipelineFactory;
use crate::proxy::ProxyServer;
use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Everything `serve` needs, built from the resolved configuration
pub struct Services {
    pub state: AppState,
    pub ca: Arc<CertificateAuthority>,
    /// Whether the certificates were already on disk
    pub certs_existed: bool,
}

/// Open the database, record this run and load the certificate authority
pub fn build_services(config: Config) -> anyhow::Result<Services> {
    let db = Database::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    let instance_id = db.init_instance().context("Failed to initialize instance")?;
    let session_id = db
        .init_session_if_not_exists()
        .context("Failed to initialize session")?;
    db.upsert_settings(&Settings {
        id: instance_id.clone(),
        ip: Some(config.host.clone()),
        port: Some(config.port),
        llm_model: None,
        system_prompt: None,
        other_settings: Some(json!({"proxy_port": config.proxy_port}).to_string()),
    })
    .context("Failed to store settings")?;
    info!(%instance_id, %session_id, "Database ready");

    let ca = Arc::new(CertificateAuthority::new(config.cert_paths()));
    let certs_existed = ca
        .check_and_ensure_certificates()
        .context("Failed to prepare certificates")?;

    let providers = build_registry(&config).context("Failed to build provider clients")?;
    let pipelines = PipelineFactory::new(&config.prompts);

    let state = AppState {
        config: Arc::new(config),
        db: Arc::new(db),
        providers: Arc::new(providers),
        pipelines: Arc::new(pipelines),
    };

    Ok(Services {
        state,
        ca,
        certs_existed,
    })
}

/// Run the API server and the proxy until ctrl-c or SIGTERM
pub async fn run(services: Services) -> anyhow::Result<()> {
    let Services { state, ca, .. } = services;
    let config = state.config.clone();

    let api_addr = format!("{}:{}", config.host, config.port);
    let api_listener = TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", api_addr))?;

    let proxy_addr = format!("{}:{}", config.host, config.proxy_port);
    let proxy_listener = TcpListener::bind(&proxy_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", proxy_addr))?;

    let proxy = Arc::new(ProxyServer::new(ca, state.pipelines.clone(), state.db.clone())?);
    let router = create_router(state);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    info!("API server listening on http://{}", api_addr);
    info!("Proxy listening on https://{}", proxy_addr);

    let api = {
        let token = shutdown.clone();
        async move {
            let wait = token.clone();
            let result = axum::serve(api_listener, router)
                .with_graceful_shutdown(async move { wait.cancelled().await })
                .await;
            token.cancel();
            result
        }
    };
    let proxy = {
        let token = shutdown.clone();
        async move {
            let result = proxy.run(proxy_listener, token.clone()).await;
            token.cancel();
            result
        }
    };

    let (api_result, proxy_result) = tokio::join!(api, proxy);
    api_result.context("API server error")?;
    proxy_result.context("Proxy server error")?;

    info!("Shutdown complete");
    Ok(())
}

/// Cancel `token` on ctrl-c or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.db_path = dir.path().join("db").join("codegate.db");
        config.certs_dir = dir.path().join("certs");
        config
    }

    #[test]
    fn test_build_services_prepares_storage_and_certs() {
        let dir = TempDir::new().unwrap();

        let services = build_services(test_config(&dir)).unwrap();
        assert!(!services.certs_existed);
        assert!(dir.path().join("certs").join("ca.crt").exists());
        assert!(dir.path().join("db").join("codegate.db").exists());
        let settings = services.state.db.get_settings().unwrap().unwrap();
        assert_eq!(settings.port, Some(8989));
        drop(services);

        let services = build_services(test_config(&dir)).unwrap();
        assert!(services.certs_existed);
    }

    #[tokio::test]
    async fn test_proxy_failure_stops_api_server() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config.proxy_port = 0;

        let services = build_services(config).unwrap();
        // Without the server certificate the proxy cannot start, which must
        // bring the API server down with it.
        std::fs::remove_file(dir.path().join("certs").join("server.crt")).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(10), run(services))
            .await
            .expect("servers should stop");
        assert!(result.is_err());
    }
}
