//! Shared string constants
//!
//! Message roles, content part types and header names used by the pipeline,
//! the forwarding API and the intercepting proxy.

/// Message role constants
pub mod role {
    /// User role identifier
    pub const USER: &str = "user";

    /// Assistant role identifier
    pub const ASSISTANT: &str = "assistant";

    /// System role identifier
    pub const SYSTEM: &str = "system";
}

/// Content part type constants
pub mod content {
    /// Text content type
    pub const TEXT: &str = "text";
}

/// Header names
pub mod header {
    pub const AUTHORIZATION: &str = "authorization";
    pub const X_API_KEY: &str = "x-api-key";
    pub const ANTHROPIC_VERSION: &str = "anthropic-version";
    pub const ANTHROPIC_BETA: &str = "anthropic-beta";
    pub const OPENAI_ORGANIZATION: &str = "openai-organization";
    pub const X_REQUEST_ID: &str = "x-request-id";
}

/// Alert trigger categories stored with each alert
pub mod severity {
    pub const INFO: &str = "info";
    pub const CRITICAL: &str = "critical";
}

/// Provider name recorded for traffic seen by the intercepting proxy
pub const COPILOT_PROVIDER: &str = "github-copilot";

/// Anthropic API version sent when the client does not pick one
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
