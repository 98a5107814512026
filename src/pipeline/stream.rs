//! Streaming response plumbing
//!
//! Splits an upstream byte stream into records (Server-Sent Events or
//! newline-delimited JSON), runs each decoded chunk through the output
//! pipeline and re-encodes the result in the same framing.

use super::PipelineContext;
use super::output::{OutputPipeline, text_pointer};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

/// How records are delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `data: {...}` events separated by blank lines
    Sse,
    /// One JSON document per line (Ollama)
    NdJson,
}

/// Accumulates bytes until whole records are available
#[derive(Debug)]
pub struct RecordBuffer {
    framing: Framing,
    buf: Vec<u8>,
}

impl RecordBuffer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        // CR only ever appears in line endings; JSON escapes it inside strings
        self.buf.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
    }

    /// Next complete record without its delimiter
    pub fn next_record(&mut self) -> Option<String> {
        let delimiter: &[u8] = match self.framing {
            Framing::Sse => b"\n\n",
            Framing::NdJson => b"\n",
        };
        let pos = self
            .buf
            .windows(delimiter.len())
            .position(|w| w == delimiter)?;
        let record: Vec<u8> = self.buf.drain(..pos + delimiter.len()).take(pos).collect();
        Some(String::from_utf8_lossy(&record).into_owned())
    }

    /// Whatever is left once the upstream has closed
    pub fn take_rest(&mut self) -> Option<String> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// One parsed Server-Sent Event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn parse(record: &str) -> Self {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        for line in record.lines() {
            if let Some(value) = line.strip_prefix("data:") {
                data.push(value.strip_prefix(' ').unwrap_or(value));
            } else if let Some(value) = line.strip_prefix("event:") {
                event = Some(value.trim().to_string());
            }
        }
        Self {
            event,
            data: data.join("\n"),
        }
    }

    pub fn encode(event: Option<&str>, data: &str) -> String {
        match event {
            Some(name) => format!("event: {}\ndata: {}\n\n", name, data),
            None => format!("data: {}\n\n", data),
        }
    }
}

/// Applies the output pipeline record by record
pub struct StreamProcessor {
    framing: Framing,
    pipeline: OutputPipeline,
    context: PipelineContext,
    /// Upstream chunks as received, for storage
    recorded: Vec<Value>,
    last_text_event: Option<String>,
}

impl StreamProcessor {
    pub fn new(framing: Framing, pipeline: OutputPipeline, context: PipelineContext) -> Self {
        Self {
            framing,
            pipeline,
            context,
            recorded: Vec::new(),
            last_text_event: None,
        }
    }

    pub fn handle_record(&mut self, record: &str) -> Vec<String> {
        match self.framing {
            Framing::Sse => self.handle_sse(record),
            Framing::NdJson => self.handle_ndjson(record),
        }
    }

    fn handle_sse(&mut self, record: &str) -> Vec<String> {
        let event = SseEvent::parse(record);
        if event.data.is_empty() {
            return vec![format!("{}\n\n", record)];
        }

        let Ok(chunk) = serde_json::from_str::<Value>(&event.data) else {
            // `[DONE]` and anything else we cannot decode
            let mut out = self.flush();
            out.push(format!("{}\n\n", record));
            return out;
        };

        let has_text = text_pointer(&chunk).is_some();
        let mut out = if has_text { Vec::new() } else { self.flush() };
        if has_text {
            self.last_text_event = event.event.clone();
        }

        self.recorded.push(chunk.clone());
        for processed in self.pipeline.process_chunk(chunk, &mut self.context) {
            out.push(SseEvent::encode(event.event.as_deref(), &processed.to_string()));
        }
        out
    }

    fn handle_ndjson(&mut self, record: &str) -> Vec<String> {
        let line = record.trim();
        if line.is_empty() {
            return Vec::new();
        }

        let Ok(chunk) = serde_json::from_str::<Value>(line) else {
            debug!("Passing through undecodable stream line");
            return vec![format!("{}\n", line)];
        };

        let mut out = if text_pointer(&chunk).is_some() {
            Vec::new()
        } else {
            self.flush()
        };

        self.recorded.push(chunk.clone());
        for processed in self.pipeline.process_chunk(chunk, &mut self.context) {
            out.push(format!("{}\n", processed));
        }
        out
    }

    /// Emit text the pipeline is still holding
    fn flush(&mut self) -> Vec<String> {
        let Some(chunk) = self.pipeline.flush() else {
            return Vec::new();
        };
        vec![match self.framing {
            Framing::Sse => SseEvent::encode(self.last_text_event.as_deref(), &chunk.to_string()),
            Framing::NdJson => format!("{}\n", chunk),
        }]
    }

    /// Final output plus the recorded chunks and the context
    pub fn finish(mut self) -> (Vec<String>, Vec<Value>, PipelineContext) {
        let out = self.flush();
        (out, self.recorded, self.context)
    }
}

/// Hands the recorded chunks and the context to the completion callback
/// exactly once: when the stream ends or when it is dropped early.
struct Completion<F>
where
    F: FnOnce(Vec<Value>, PipelineContext),
{
    processor: Option<StreamProcessor>,
    on_complete: Option<F>,
}

impl<F> Completion<F>
where
    F: FnOnce(Vec<Value>, PipelineContext),
{
    fn new(processor: StreamProcessor, on_complete: F) -> Self {
        Self {
            processor: Some(processor),
            on_complete: Some(on_complete),
        }
    }

    fn handle_record(&mut self, record: &str) -> Vec<String> {
        match self.processor.as_mut() {
            Some(processor) => processor.handle_record(record),
            None => Vec::new(),
        }
    }

    /// Run the callback and return whatever output was still held back
    fn complete(&mut self) -> Vec<String> {
        let Some(processor) = self.processor.take() else {
            return Vec::new();
        };
        let (out, recorded, context) = processor.finish();
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(recorded, context);
        }
        out
    }
}

impl<F> Drop for Completion<F>
where
    F: FnOnce(Vec<Value>, PipelineContext),
{
    fn drop(&mut self) {
        if self.processor.is_some() {
            debug!("Stream dropped before the upstream finished");
            self.complete();
        }
    }
}

/// Run an upstream byte stream through the output pipeline
///
/// `on_complete` receives the upstream chunks and the pipeline context once
/// the upstream has finished (or failed), or when the returned stream is
/// dropped before that because the client went away.
pub fn process_stream<S, E, F>(
    upstream: S,
    processor: StreamProcessor,
    on_complete: F,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send,
    F: FnOnce(Vec<Value>, PipelineContext) + Send + 'static,
{
    let mut buffer = RecordBuffer::new(processor.framing);
    // Built before the first poll so an unpolled stream still completes on drop
    let mut completion = Completion::new(processor, on_complete);

    async_stream::stream! {
        let mut upstream = upstream;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(bytes) => buffer.push(&bytes),
                Err(e) => {
                    warn!(error = %e, "Upstream stream failed");
                    break;
                }
            }
            while let Some(record) = buffer.next_record() {
                for out in completion.handle_record(&record) {
                    yield Ok(Bytes::from(out));
                }
            }
        }

        if let Some(rest) = buffer.take_rest() {
            for out in completion.handle_record(&rest) {
                yield Ok(Bytes::from(out));
            }
        }

        for chunk in completion.complete() {
            yield Ok(Bytes::from(chunk));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SystemMessageStyle;
    use crate::pipeline::pii::PiiUnredactionStep;
    use crate::pipeline::sensitive::{SensitiveData, SensitiveDataManager};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_record_buffer_sse() {
        let mut buffer = RecordBuffer::new(Framing::Sse);
        buffer.push(b"data: {\"a\":1}\r\n\r\ndata: {\"b\"");
        assert_eq!(buffer.next_record().as_deref(), Some("data: {\"a\":1}"));
        assert!(buffer.next_record().is_none());
        buffer.push(b":2}\n\n");
        assert_eq!(buffer.next_record().as_deref(), Some("data: {\"b\":2}"));
        assert!(buffer.take_rest().is_none());
    }

    #[test]
    fn test_record_buffer_ndjson_rest() {
        let mut buffer = RecordBuffer::new(Framing::NdJson);
        buffer.push(b"{\"a\":1}\n{\"b\":2}");
        assert_eq!(buffer.next_record().as_deref(), Some("{\"a\":1}"));
        assert!(buffer.next_record().is_none());
        assert_eq!(buffer.take_rest().as_deref(), Some("{\"b\":2}"));
    }

    #[test]
    fn test_sse_event_parse() {
        let event = SseEvent::parse("event: content_block_delta\ndata: {\"x\":1}");
        assert_eq!(event.event.as_deref(), Some("content_block_delta"));
        assert_eq!(event.data, "{\"x\":1}");
        assert_eq!(SseEvent::encode(None, "[DONE]"), "data: [DONE]\n\n");
    }

    fn unredacting_processor(framing: Framing) -> (StreamProcessor, String) {
        let manager = Arc::new(SensitiveDataManager::new());
        let context = PipelineContext::new(SystemMessageStyle::Message);
        let marker = manager.store(
            &context.session_id,
            SensitiveData {
                original: "10.0.0.7".to_string(),
                service: "pii".to_string(),
                kind: "IP_ADDRESS".to_string(),
            },
        );
        let pipeline = OutputPipeline::new(vec![Box::new(PiiUnredactionStep::new(manager))]);
        (StreamProcessor::new(framing, pipeline, context), marker)
    }

    #[tokio::test]
    async fn test_process_stream_sse() {
        let (processor, marker) = unredacting_processor(Framing::Sse);
        let (head, tail) = marker.split_at(5);
        let body = format!(
            "data: {}\n\ndata: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
            json!({"id": "c1", "choices": [{"delta": {"role": "assistant", "content": format!("host {}", head)}}]}),
            json!({"id": "c1", "choices": [{"delta": {"content": tail}}]}),
            json!({"id": "c1", "choices": [{"delta": {}, "finish_reason": "stop"}]}),
        );
        // Split mid-record to exercise buffering
        let (a, b) = body.split_at(body.len() / 2);
        let upstream = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from(a.to_string())),
            Ok(Bytes::from(b.to_string())),
        ]);

        let stored = Arc::new(Mutex::new(Vec::new()));
        let sink = stored.clone();
        let out: Vec<Bytes> = process_stream(upstream, processor, move |chunks, _| {
            *sink.lock().unwrap() = chunks;
        })
        .map(|r| r.unwrap())
        .collect()
        .await;

        let text: String = out.iter().map(|b| String::from_utf8_lossy(b).into_owned()).collect();
        let mut content = String::new();
        for record in text.split("\n\n").filter(|r| !r.is_empty()) {
            let data = SseEvent::parse(record).data;
            if let Ok(v) = serde_json::from_str::<Value>(&data) {
                if let Some(s) = v.pointer("/choices/0/delta/content").and_then(Value::as_str) {
                    content.push_str(s);
                }
            }
        }
        assert_eq!(content, "host 10.0.0.7");
        assert!(text.ends_with("data: [DONE]\n\n"));
        assert_eq!(stored.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_process_stream_ndjson() {
        let (processor, marker) = unredacting_processor(Framing::NdJson);
        let body = format!(
            "{}\n{}\n",
            json!({"message": {"role": "assistant", "content": format!("ip {}", marker)}, "done": false}),
            json!({"message": {"role": "assistant", "content": ""}, "done": true}),
        );
        let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body))]);

        let out: Vec<Bytes> = process_stream(upstream, processor, |_, _| {})
            .map(|r| r.unwrap())
            .collect()
            .await;

        let first: Value = serde_json::from_slice(out[0].trim_ascii()).unwrap();
        assert_eq!(first["message"]["content"], "ip 10.0.0.7");
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_client_disconnect_still_completes() {
        let manager = Arc::new(SensitiveDataManager::new());
        let context = PipelineContext::new(SystemMessageStyle::Message);
        let session_id = context.session_id.clone();
        manager.store(
            &session_id,
            SensitiveData {
                original: "10.0.0.7".to_string(),
                service: "pii".to_string(),
                kind: "IP_ADDRESS".to_string(),
            },
        );
        let pipeline = OutputPipeline::new(vec![Box::new(PiiUnredactionStep::new(manager.clone()))]);
        let processor = StreamProcessor::new(Framing::Sse, pipeline, context);

        let first = format!(
            "data: {}\n\n",
            json!({"id": "c1", "choices": [{"delta": {"role": "assistant"}}]})
        );
        // The upstream never finishes on its own
        let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(first))])
            .chain(futures::stream::pending());

        let stored = Arc::new(Mutex::new(None));
        let sink = stored.clone();
        let cleanup = manager.clone();
        let mut stream = Box::pin(process_stream(upstream, processor, move |chunks, context| {
            cleanup.cleanup_session(&context.session_id);
            *sink.lock().unwrap() = Some(chunks.len());
        }));

        assert!(stream.next().await.is_some());
        assert!(stored.lock().unwrap().is_none());
        drop(stream);

        assert_eq!(*stored.lock().unwrap(), Some(1));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_runs_once() {
        let (processor, _) = unredacting_processor(Framing::NdJson);
        let upstream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from("{\"done\":true}\n"))]);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();

        let mut stream = Box::pin(process_stream(upstream, processor, move |_, _| {
            *counter.lock().unwrap() += 1;
        }));
        while stream.next().await.is_some() {}
        drop(stream);

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_unpolled_stream_completes_on_drop() {
        let (processor, _) = unredacting_processor(Framing::Sse);
        let upstream = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();

        let stream = process_stream(upstream, processor, move |chunks, _| {
            assert!(chunks.is_empty());
            *flag.lock().unwrap() = true;
        });
        drop(stream);

        assert!(*called.lock().unwrap());
    }

    #[test]
    fn test_sse_passthrough_of_comments() {
        let (mut processor, _) = unredacting_processor(Framing::Sse);
        assert_eq!(processor.handle_record(": keep-alive"), vec![": keep-alive\n\n"]);
    }
}
