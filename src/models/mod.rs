//! Data models
//!
//! Stored database rows and the dashboard views built from them.

pub mod dashboard;
pub mod db;
