//! Stored record types
//!
//! Rows of the SQLite tables as the database layer reads and writes them.
//! Requests and outputs are kept as the raw JSON text seen by the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A request sent through the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: Option<String>,
    /// Request body as forwarded upstream (already redacted)
    pub request: String,
    /// `chat` or `fim`
    #[serde(rename = "type")]
    pub prompt_type: String,
}

/// A response to a stored prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub id: String,
    pub prompt_id: String,
    pub timestamp: DateTime<Utc>,
    /// Response JSON; a JSON array of chunks for streamed responses
    pub output: String,
}

/// Something a pipeline step flagged while processing a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub prompt_id: String,
    pub output_id: Option<String>,
    pub code_snippet: Option<String>,
    pub trigger_string: Option<String>,
    pub trigger_type: String,
    pub trigger_category: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub id: String,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub llm_model: Option<String>,
    pub system_prompt: Option<String>,
    pub other_settings: Option<String>,
}

/// A prompt joined with its latest output, if any
#[derive(Debug, Clone, PartialEq)]
pub struct PromptWithOutput {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: Option<String>,
    pub request: String,
    pub prompt_type: String,
    pub output_id: Option<String>,
    pub output: Option<String>,
    pub output_timestamp: Option<DateTime<Utc>>,
}

/// A prompt with every output and alert recorded for it, newest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptDetail {
    pub prompt: Prompt,
    pub outputs: Vec<Output>,
    pub alerts: Vec<Alert>,
}

/// An alert together with the prompt and output it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct AlertWithPrompt {
    pub alert: Alert,
    pub prompt: PromptWithOutput,
}
