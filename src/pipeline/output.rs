//! Response side of the pipeline
//!
//! Output steps see each decoded response chunk (a JSON value) and may
//! rewrite it, hold it back, or emit extra chunks around it.

use super::PipelineContext;
use crate::core::constants::role;
use serde_json::{Value, json};
use tracing::trace;

/// Places a text delta can live in a chunk, by provider format
///
/// OpenAI chat, Anthropic messages, Ollama chat, Ollama generate and
/// OpenAI-style legacy completions, in that order.
const TEXT_POINTERS: [&str; 5] = [
    "/choices/0/delta/content",
    "/delta/text",
    "/message/content",
    "/response",
    "/choices/0/text",
];

/// Pointer to the chunk's text delta, if it has one
pub fn text_pointer(chunk: &Value) -> Option<&'static str> {
    TEXT_POINTERS
        .iter()
        .copied()
        .find(|ptr| chunk.pointer(ptr).is_some_and(Value::is_string))
}

pub fn chunk_text(chunk: &Value) -> Option<&str> {
    text_pointer(chunk).and_then(|ptr| chunk.pointer(ptr)).and_then(Value::as_str)
}

pub fn set_chunk_text(chunk: &mut Value, pointer: &str, text: String) {
    if let Some(slot) = chunk.pointer_mut(pointer) {
        *slot = Value::String(text);
    }
}

/// Whether this chunk opens the assistant's reply
pub fn has_role(chunk: &Value) -> bool {
    chunk
        .pointer("/choices/0/delta/role")
        .is_some_and(Value::is_string)
        || (chunk.get("done").is_some()
            && chunk.pointer("/message/role").is_some_and(Value::is_string))
}

/// A chunk shaped like `template` carrying only `text`
///
/// Returns `None` for formats where an extra text chunk cannot be inserted
/// at this point of the stream.
pub fn text_chunk_like(template: &Value, text: &str) -> Option<Value> {
    if template.pointer("/choices/0/delta").is_some() {
        let mut chunk = template.clone();
        chunk["choices"] = json!([{
            "index": 0,
            "delta": {"role": role::ASSISTANT, "content": text},
            "finish_reason": null,
        }]);
        return Some(chunk);
    }
    if template.get("done").is_some() && template.get("message").is_some() {
        let mut chunk = template.clone();
        chunk["message"] = json!({"role": role::ASSISTANT, "content": text});
        chunk["done"] = Value::Bool(false);
        return Some(chunk);
    }
    None
}

/// State kept across the chunks of one response
#[derive(Debug, Default)]
pub struct OutputContext {
    /// Text held back because it may be the start of a placeholder
    pub prefix_buffer: String,
}

pub trait OutputPipelineStep: Send + Sync {
    fn name(&self) -> &str;

    fn process_chunk(
        &self,
        chunk: Value,
        context: &mut OutputContext,
        input: &mut PipelineContext,
    ) -> Vec<Value>;
}

/// Output steps plus the state they share for one response
pub struct OutputPipeline {
    steps: Vec<Box<dyn OutputPipelineStep>>,
    context: OutputContext,
    last_chunk: Option<Value>,
}

impl OutputPipeline {
    pub fn new(steps: Vec<Box<dyn OutputPipelineStep>>) -> Self {
        Self {
            steps,
            context: OutputContext::default(),
            last_chunk: None,
        }
    }

    /// Run one chunk through every step; may yield zero or more chunks
    pub fn process_chunk(&mut self, chunk: Value, input: &mut PipelineContext) -> Vec<Value> {
        if text_pointer(&chunk).is_some() {
            self.last_chunk = Some(chunk.clone());
        }

        let mut chunks = vec![chunk];
        for step in &self.steps {
            let mut next = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                let produced = step.process_chunk(chunk, &mut self.context, input);
                if produced.is_empty() {
                    trace!(step = step.name(), session_id = %input.session_id, "Chunk held back");
                }
                next.extend(produced);
            }
            chunks = next;
        }
        chunks
    }

    /// Emit whatever text is still buffered once the upstream is done
    pub fn flush(&mut self) -> Option<Value> {
        if self.context.prefix_buffer.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.context.prefix_buffer);
        let mut chunk = self.last_chunk.clone()?;
        let pointer = text_pointer(&chunk)?;
        set_chunk_text(&mut chunk, pointer, text);
        Some(chunk)
    }
}
