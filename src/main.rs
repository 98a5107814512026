//! CodeGate - local privacy gateway for AI coding assistants
//!
//! Sits between coding assistants and their LLM providers: requests are
//! forwarded through a pipeline that keeps PII from leaving the machine,
//! traffic is recorded locally for the dashboard, and an intercepting proxy
//! covers clients that cannot be pointed at a custom base URL.

mod api;
mod cli;
mod core;
mod dashboard;
mod db;
mod models;
mod pipeline;
mod proxy;
mod server;

use crate::cli::Cli;
use crate::core::config::ConfigurationError;
use clap::Parser;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    // clap prints its own errors and exits with status 2
    let cli = Cli::parse();

    if let Err(e) = cli::commands::execute(cli.command).await {
        match e.downcast_ref::<ConfigurationError>() {
            Some(config_error) => eprintln!("Configuration error: {}", config_error),
            None => {
                tracing::error!(error = %format!("{:#}", e), "Command failed");
                eprintln!("Error: {:#}", e);
            }
        }
        std::process::exit(1);
    }
}
