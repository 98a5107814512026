//! Core application modules
//!
//! This module contains configuration, certificates, constants, logging,
//! prompts and the upstream providers.

pub mod certs;
pub mod config;
pub mod constants;
pub mod logging;
pub mod prompts;
pub mod provider;
pub mod providers;
