//! Request and response processing pipelines
//!
//! Requests pass through an [`InputPipeline`] of [`PipelineStep`]s before they
//! are forwarded upstream. Responses pass through an
//! [`output::OutputPipeline`] chunk by chunk on the way back. Both sides share
//! a [`PipelineContext`] for one exchange.

pub mod output;
pub mod pii;
pub mod sensitive;
pub mod stream;

use crate::core::constants::{content, role};
use crate::core::prompts::{PII_REDACTED, PromptConfig};
use crate::models::db::Alert;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use output::OutputPipeline;
use pii::{PiiAnalyzer, PiiDetail, PiiRedactionNotifier, PiiRedactionStep, PiiUnredactionStep};
use sensitive::SensitiveDataManager;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Where a request carries its system prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMessageStyle {
    /// A `{"role": "system"}` entry in `messages`
    Message,
    /// A top-level `system` field (Anthropic)
    TopLevel,
}

/// An alert raised by a step, stored once the prompt has an id
#[derive(Debug, Clone)]
pub struct AlertRaised {
    pub step: String,
    pub trigger_string: Option<String>,
    pub code_snippet: Option<String>,
    pub category: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// What the PII step removed from the request
#[derive(Debug, Clone, Default)]
pub struct RedactionMetadata {
    pub count: usize,
    pub details: Vec<PiiDetail>,
    /// Redacted text around the PII in the last user message
    pub snippet: String,
}

/// State shared by all steps of one exchange
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub session_id: String,
    pub system_style: SystemMessageStyle,
    pub alerts: Vec<AlertRaised>,
    pub redaction: RedactionMetadata,
}

impl PipelineContext {
    pub fn new(system_style: SystemMessageStyle) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            system_style,
            alerts: Vec::new(),
            redaction: RedactionMetadata::default(),
        }
    }

    pub fn add_alert(
        &mut self,
        step: &str,
        trigger_string: Option<String>,
        code_snippet: Option<String>,
        category: &'static str,
    ) {
        self.alerts.push(AlertRaised {
            step: step.to_string(),
            trigger_string,
            code_snippet,
            category,
            timestamp: Utc::now(),
        });
    }

    /// Alerts as database rows for a stored prompt
    pub fn alerts_for_prompt(&self, prompt_id: &str) -> Vec<Alert> {
        self.alerts
            .iter()
            .map(|alert| Alert {
                id: Uuid::new_v4().to_string(),
                prompt_id: prompt_id.to_string(),
                output_id: None,
                code_snippet: alert.code_snippet.clone(),
                trigger_string: alert.trigger_string.clone(),
                trigger_type: alert.step.clone(),
                trigger_category: Some(alert.category.to_string()),
                timestamp: alert.timestamp,
            })
            .collect()
    }
}

/// A single transformation applied to a request body
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, request: Value, context: &mut PipelineContext) -> Value;
}

/// Ordered list of request steps
pub struct InputPipeline {
    steps: Vec<Arc<dyn PipelineStep>>,
}

impl InputPipeline {
    pub fn new(steps: Vec<Arc<dyn PipelineStep>>) -> Self {
        Self { steps }
    }

    pub async fn run(&self, mut request: Value, context: &mut PipelineContext) -> Value {
        for step in &self.steps {
            debug!(step = step.name(), session_id = %context.session_id, "Running pipeline step");
            request = step.process(request, context).await;
        }
        request
    }
}

/// Builds the input and output pipelines for each exchange
///
/// Owns the pieces that outlive a single request: the PII analyzer and the
/// sensitive data store.
pub struct PipelineFactory {
    sensitive: Arc<SensitiveDataManager>,
    analyzer: Arc<PiiAnalyzer>,
    pii_prompt: String,
}

impl PipelineFactory {
    pub fn new(prompts: &PromptConfig) -> Self {
        Self {
            sensitive: Arc::new(SensitiveDataManager::new()),
            analyzer: Arc::new(PiiAnalyzer::new()),
            pii_prompt: prompts.get(PII_REDACTED).unwrap_or_default().to_string(),
        }
    }

    pub fn sensitive(&self) -> &Arc<SensitiveDataManager> {
        &self.sensitive
    }

    pub fn create_input_pipeline(&self) -> InputPipeline {
        InputPipeline::new(vec![Arc::new(PiiRedactionStep::new(
            self.analyzer.clone(),
            self.sensitive.clone(),
            self.pii_prompt.clone(),
        ))])
    }

    pub fn create_output_pipeline(&self) -> OutputPipeline {
        OutputPipeline::new(vec![
            Box::new(PiiUnredactionStep::new(self.sensitive.clone())),
            Box::new(PiiRedactionNotifier),
        ])
    }

    /// Drop everything stored for a finished exchange
    pub fn finish(&self, context: &PipelineContext) {
        self.sensitive.cleanup_session(&context.session_id);
        debug!(
            session_id = %context.session_id,
            active_sessions = self.sensitive.session_count(),
            "Finished pipeline session"
        );
    }
}

/// Add `text` to the request's system prompt, creating one if needed
///
/// An existing system prompt is extended, never replaced, and text already
/// present is not added twice.
pub fn add_or_update_system_message(request: &mut Value, text: &str, style: SystemMessageStyle) {
    if text.is_empty() {
        return;
    }
    let Some(obj) = request.as_object_mut() else {
        return;
    };

    match style {
        SystemMessageStyle::TopLevel => match obj.get_mut("system") {
            Some(Value::String(existing)) => append_text(existing, text),
            Some(Value::Array(blocks)) => {
                if !blocks_contain(blocks, text) {
                    blocks.push(json!({"type": content::TEXT, "text": text}));
                }
            }
            _ => {
                obj.insert("system".to_string(), Value::String(text.to_string()));
            }
        },
        SystemMessageStyle::Message => {
            let messages = obj
                .entry("messages")
                .or_insert_with(|| Value::Array(Vec::new()));
            let Some(messages) = messages.as_array_mut() else {
                return;
            };

            let system = messages
                .iter_mut()
                .find(|m| m.get("role").and_then(Value::as_str) == Some(role::SYSTEM));

            match system.and_then(|m| m.get_mut("content")) {
                Some(Value::String(existing)) => append_text(existing, text),
                Some(Value::Array(parts)) => {
                    if !blocks_contain(parts, text) {
                        parts.push(json!({"type": content::TEXT, "text": text}));
                    }
                }
                _ => {
                    messages.insert(0, json!({"role": role::SYSTEM, "content": text}));
                }
            }
        }
    }
}

fn append_text(existing: &mut String, text: &str) {
    if existing.contains(text) {
        return;
    }
    if !existing.is_empty() {
        existing.push_str("\n\n");
    }
    existing.push_str(text);
}

fn blocks_contain(blocks: &[Value], text: &str) -> bool {
    blocks
        .iter()
        .any(|b| b.get("text").and_then(Value::as_str) == Some(text))
}
