//! CLI module - Command-line interface for CodeGate.
//!
//! Provides commands for:
//! - `serve` - Run the API server and the intercepting proxy
//! - `show-prompts` - Print the loaded system prompts
//! - `generate-certs` - Create the CA and server certificates
//! - `restore-backup` - Replace the database with a backup

pub mod args;
pub mod commands;

pub use args::{Cli, Commands};
