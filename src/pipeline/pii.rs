//! PII detection, redaction and restoration
//!
//! [`PiiRedactionStep`] swaps personal data in outgoing messages for
//! `#<uuid>#` placeholders. On the way back [`PiiUnredactionStep`] puts the
//! original values back into the streamed text, and [`PiiRedactionNotifier`]
//! tells the user what was protected.

use super::output::{
    OutputContext, OutputPipelineStep, chunk_text, has_role, set_chunk_text, text_chunk_like,
    text_pointer,
};
use super::sensitive::{SensitiveData, SensitiveDataManager};
use super::{PipelineContext, PipelineStep, add_or_update_system_message};
use crate::core::constants::{content, role, severity};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

const STEP_NAME: &str = "codegate-pii";

/// Dashboard search linked from the redaction notice
const NOTICE_LINK: &str = "http://localhost:9090/?search=codegate-pii";

static PLACEHOLDER_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("valid regex")
});

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"#[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}#")
        .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiiEntity {
    EmailAddress,
    PhoneNumber,
    UsSsn,
    CreditCard,
    IpAddress,
    IbanCode,
}

impl PiiEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiEntity::EmailAddress => "EMAIL_ADDRESS",
            PiiEntity::PhoneNumber => "PHONE_NUMBER",
            PiiEntity::UsSsn => "US_SSN",
            PiiEntity::CreditCard => "CREDIT_CARD",
            PiiEntity::IpAddress => "IP_ADDRESS",
            PiiEntity::IbanCode => "IBAN_CODE",
        }
    }

    /// Lowercase name with spaces, e.g. `email address`
    pub fn readable(&self) -> String {
        self.as_str().to_lowercase().replace('_', " ")
    }
}

/// One detected span, in byte offsets of the analyzed text
#[derive(Debug, Clone, PartialEq)]
pub struct PiiMatch {
    pub entity: PiiEntity,
    pub start: usize,
    pub end: usize,
    pub score: f32,
}

/// A redaction performed on a request
#[derive(Debug, Clone, PartialEq)]
pub struct PiiDetail {
    pub entity: PiiEntity,
    pub score: f32,
    pub placeholder: String,
}

struct Detector {
    entity: PiiEntity,
    regex: Regex,
    score: f32,
    validate: fn(&str) -> bool,
}

/// Regex based PII detector
pub struct PiiAnalyzer {
    detectors: Vec<Detector>,
}

impl Default for PiiAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiAnalyzer {
    pub fn new() -> Self {
        let specs: [(PiiEntity, &str, f32, fn(&str) -> bool); 6] = [
            (
                PiiEntity::EmailAddress,
                r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
                1.0,
                accept,
            ),
            (
                PiiEntity::CreditCard,
                r"\b(?:\d[ -]?){12,18}\d\b",
                1.0,
                luhn_valid,
            ),
            (
                PiiEntity::IbanCode,
                r"\b[A-Z]{2}\d{2}(?: ?[A-Z0-9]{4}){2,7}(?: ?[A-Z0-9]{1,3})?\b",
                1.0,
                iban_valid,
            ),
            (
                PiiEntity::UsSsn,
                r"\b\d{3}-\d{2}-\d{4}\b",
                0.85,
                ssn_valid,
            ),
            (
                PiiEntity::PhoneNumber,
                r"(?:\+1[-.\s]?)?(?:\(\d{3}\)\s?|\b\d{3}[-.\s])\d{3}[-.\s]\d{4}\b",
                0.75,
                accept,
            ),
            (
                PiiEntity::IpAddress,
                r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b",
                0.6,
                ip_reportable,
            ),
        ];

        let detectors = specs
            .into_iter()
            .filter_map(|(entity, pattern, score, validate)| match Regex::new(pattern) {
                Ok(regex) => Some(Detector {
                    entity,
                    regex,
                    score,
                    validate,
                }),
                Err(e) => {
                    warn!(entity = entity.as_str(), error = %e, "Skipping PII detector");
                    None
                }
            })
            .collect();

        Self { detectors }
    }

    /// Non-overlapping matches in text order
    ///
    /// When matches overlap, the one starting first wins, then the longer one,
    /// then the higher score.
    pub fn analyze(&self, text: &str) -> Vec<PiiMatch> {
        let mut matches: Vec<PiiMatch> = self
            .detectors
            .iter()
            .flat_map(|detector| {
                detector
                    .regex
                    .find_iter(text)
                    .filter(|m| (detector.validate)(m.as_str()))
                    .map(|m| PiiMatch {
                        entity: detector.entity,
                        start: m.start(),
                        end: m.end(),
                        score: detector.score,
                    })
            })
            .collect();

        matches.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then((b.end - b.start).cmp(&(a.end - a.start)))
                .then(b.score.total_cmp(&a.score))
        });

        let mut kept: Vec<PiiMatch> = Vec::with_capacity(matches.len());
        for m in matches {
            if kept.last().is_none_or(|last| m.start >= last.end) {
                kept.push(m);
            }
        }
        kept
    }
}

fn accept(_: &str) -> bool {
    true
}

fn luhn_valid(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

fn iban_valid(candidate: &str) -> bool {
    let compact: String = candidate.chars().filter(|c| !c.is_whitespace()).collect();
    if !(15..=34).contains(&compact.len()) {
        return false;
    }
    let (head, tail) = compact.split_at(4);
    let mut remainder: u32 = 0;
    for c in tail.chars().chain(head.chars()) {
        let value = match c.to_digit(36) {
            Some(v) => v,
            None => return false,
        };
        let width = if value >= 10 { 100 } else { 10 };
        remainder = (remainder * width + value) % 97;
    }
    remainder == 1
}

fn ssn_valid(candidate: &str) -> bool {
    let mut parts = candidate.split('-');
    let (Some(area), Some(group), Some(serial)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    area != "000" && area != "666" && !area.starts_with('9') && group != "00" && serial != "0000"
}

/// Loopback and unspecified addresses are not personal data
fn ip_reportable(candidate: &str) -> bool {
    !(candidate.starts_with("127.") || candidate == "0.0.0.0")
}

/// Checks whether `buffer` could still grow into a UUID
pub fn can_be_uuid(buffer: &str) -> bool {
    const HYPHENS: [usize; 4] = [8, 13, 18, 23];
    if buffer.len() > 36 {
        return false;
    }
    buffer.chars().enumerate().all(|(i, c)| {
        if HYPHENS.contains(&i) {
            c == '-'
        } else {
            c.is_ascii_digit() || matches!(c, 'a'..='f' | 'A'..='F')
        }
    })
}

/// Replace every placeholder of a session in `text` with its original value
pub fn restore_pii(manager: &SensitiveDataManager, session_id: &str, text: &str) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            manager
                .get_original_value(session_id, &caps[0])
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// [`restore_pii`] applied to every string inside a JSON value
pub fn restore_pii_json(manager: &SensitiveDataManager, session_id: &str, value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains('#') {
                *s = restore_pii(manager, session_id, s);
            }
        }
        Value::Array(items) => {
            for item in items {
                restore_pii_json(manager, session_id, item);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                restore_pii_json(manager, session_id, item);
            }
        }
        _ => {}
    }
}

/// Input step replacing PII with placeholders
pub struct PiiRedactionStep {
    analyzer: Arc<PiiAnalyzer>,
    sensitive: Arc<SensitiveDataManager>,
    system_prompt: String,
}

impl PiiRedactionStep {
    pub fn new(
        analyzer: Arc<PiiAnalyzer>,
        sensitive: Arc<SensitiveDataManager>,
        system_prompt: String,
    ) -> Self {
        Self {
            analyzer,
            sensitive,
            system_prompt,
        }
    }

    /// Redact one text; returns the new text and the placeholder spans in it
    fn redact_text(
        &self,
        text: &str,
        context: &mut PipelineContext,
    ) -> Option<(String, Vec<(usize, usize)>)> {
        let matches = self.analyzer.analyze(text);
        if matches.is_empty() {
            return None;
        }

        let mut redacted = String::with_capacity(text.len());
        let mut spans = Vec::with_capacity(matches.len());
        let mut cursor = 0;
        for m in &matches {
            redacted.push_str(&text[cursor..m.start]);
            let placeholder = self.sensitive.store(
                &context.session_id,
                SensitiveData {
                    original: text[m.start..m.end].to_string(),
                    service: "pii".to_string(),
                    kind: m.entity.as_str().to_string(),
                },
            );
            info!(
                pii_type = m.entity.as_str(),
                score = m.score,
                value_length = m.end - m.start,
                session_id = %context.session_id,
                "PII detected and mapped"
            );
            spans.push((redacted.len(), redacted.len() + placeholder.len()));
            redacted.push_str(&placeholder);
            context.redaction.details.push(PiiDetail {
                entity: m.entity,
                score: m.score,
                placeholder,
            });
            cursor = m.end;
        }
        redacted.push_str(&text[cursor..]);

        context.redaction.count += matches.len();

        let mut types: Vec<&str> = Vec::new();
        for m in &matches {
            if !types.contains(&m.entity.as_str()) {
                types.push(m.entity.as_str());
            }
        }
        let notify = format!(
            "**PII Detected** 🔒\n- Total PII Found: {}\n- Types Found: {}\n",
            matches.len(),
            types.join(", ")
        );
        context.add_alert(STEP_NAME, Some(notify), None, severity::CRITICAL);

        Some((redacted, spans))
    }

    fn redact_content(&self, content_value: &mut Value, is_user: bool, context: &mut PipelineContext) {
        match content_value {
            Value::String(text) => {
                if let Some((redacted, spans)) = self.redact_text(text, context) {
                    if is_user {
                        context.redaction.snippet = snippet(&redacted, &spans);
                    }
                    *text = redacted;
                }
            }
            Value::Array(parts) => {
                for part in parts.iter_mut() {
                    if part.get("type").and_then(Value::as_str) != Some(content::TEXT) {
                        continue;
                    }
                    if let Some(Value::String(text)) = part.get_mut("text") {
                        if let Some((redacted, spans)) = self.redact_text(text, context) {
                            if is_user {
                                context.redaction.snippet = snippet(&redacted, &spans);
                            }
                            *text = redacted;
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

/// Text from the first placeholder through the last
fn snippet(text: &str, spans: &[(usize, usize)]) -> String {
    match (spans.first(), spans.last()) {
        (Some(first), Some(last)) => text[first.0..last.1].to_string(),
        _ => String::new(),
    }
}

#[async_trait]
impl PipelineStep for PiiRedactionStep {
    fn name(&self) -> &str {
        STEP_NAME
    }

    async fn process(&self, mut request: Value, context: &mut PipelineContext) -> Value {
        let before = context.redaction.count;

        if let Some(messages) = request.get_mut("messages").and_then(Value::as_array_mut) {
            for message in messages.iter_mut() {
                let is_user = message.get("role").and_then(Value::as_str) == Some(role::USER);
                if let Some(content_value) = message.get_mut("content") {
                    self.redact_content(content_value, is_user, context);
                }
            }
        }

        if let Some(prompt) = request.get_mut("prompt") {
            self.redact_content(prompt, true, context);
        }

        let found = context.redaction.count - before;
        info!(total = found, session_id = %context.session_id, "PII redaction complete");

        if found > 0 && request.get("messages").is_some() {
            add_or_update_system_message(&mut request, &self.system_prompt, context.system_style);
        }
        debug!(snippet = %context.redaction.snippet, "Redacted text");

        request
    }
}

/// Output step restoring placeholders in streamed text
pub struct PiiUnredactionStep {
    sensitive: Arc<SensitiveDataManager>,
}

impl PiiUnredactionStep {
    pub fn new(sensitive: Arc<SensitiveDataManager>) -> Self {
        Self { sensitive }
    }

    /// Restore complete placeholders; returns `None` when everything was buffered
    fn unredact(&self, content: &str, context: &mut OutputContext, session_id: &str) -> Option<String> {
        let mut result = String::with_capacity(content.len());
        let mut pos = 0;

        while pos < content.len() {
            let Some(start) = content[pos..].find('#').map(|i| pos + i) else {
                result.push_str(&content[pos..]);
                break;
            };

            let Some(end) = content[start + 1..].find('#').map(|i| start + 1 + i) else {
                // Unterminated marker: hold it back only while it can still be a placeholder
                let tail = &content[start + 1..];
                if !tail.is_empty() && !can_be_uuid(tail) {
                    result.push_str(&content[pos..]);
                } else {
                    result.push_str(&content[pos..start]);
                    context.prefix_buffer = content[start..].to_string();
                }
                break;
            };

            result.push_str(&content[pos..start]);

            let marker = &content[start..=end];
            let inner = &marker[1..marker.len() - 1];
            if PLACEHOLDER_UUID.is_match(inner) {
                match self.sensitive.get_original_value(session_id, marker) {
                    Some(original) => result.push_str(&original),
                    None => result.push_str(marker),
                }
                pos = end + 1;
            } else {
                // Not a placeholder; the closing '#' may open the next one
                result.push('#');
                pos = start + 1;
            }
        }

        (!result.is_empty()).then_some(result)
    }
}

impl OutputPipelineStep for PiiUnredactionStep {
    fn name(&self) -> &str {
        "pii-unredaction-step"
    }

    fn process_chunk(
        &self,
        mut chunk: Value,
        context: &mut OutputContext,
        input: &mut PipelineContext,
    ) -> Vec<Value> {
        let Some(pointer) = text_pointer(&chunk) else {
            return vec![chunk];
        };
        let text = chunk_text(&chunk).unwrap_or_default();
        if text.is_empty() && context.prefix_buffer.is_empty() {
            return vec![chunk];
        }

        let mut content = std::mem::take(&mut context.prefix_buffer);
        content.push_str(text);

        match self.unredact(&content, context, &input.session_id) {
            Some(restored) => {
                set_chunk_text(&mut chunk, pointer, restored);
                vec![chunk]
            }
            None => Vec::new(),
        }
    }
}

/// Output step announcing what was redacted, once per response
pub struct PiiRedactionNotifier;

impl PiiRedactionNotifier {
    /// e.g. `2 email addresses, 1 ip address`
    pub fn format_summary(details: &[PiiDetail]) -> String {
        let mut counts: Vec<(PiiEntity, usize)> = Vec::new();
        for detail in details {
            match counts.iter_mut().find(|(e, _)| *e == detail.entity) {
                Some((_, n)) => *n += 1,
                None => counts.push((detail.entity, 1)),
            }
        }

        counts
            .iter()
            .map(|(entity, n)| {
                let name = entity.readable();
                if *n == 1 {
                    format!("1 {}", name)
                } else if name.ends_with('s') {
                    format!("{} {}es", n, name)
                } else {
                    format!("{} {}s", n, name)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn notice_text(count: usize, details: &[PiiDetail]) -> String {
        format!(
            "🛡️ [CodeGate protected {} instances of PII, including {}]({}) from being leaked by redacting them.\n\n",
            count,
            Self::format_summary(details),
            NOTICE_LINK
        )
    }
}

impl OutputPipelineStep for PiiRedactionNotifier {
    fn name(&self) -> &str {
        "pii-redaction-notifier"
    }

    fn process_chunk(
        &self,
        chunk: Value,
        _context: &mut OutputContext,
        input: &mut PipelineContext,
    ) -> Vec<Value> {
        if input.redaction.count == 0 || !has_role(&chunk) {
            return vec![chunk];
        }

        let text = Self::notice_text(input.redaction.count, &input.redaction.details);
        let Some(notice) = text_chunk_like(&chunk, &text) else {
            return vec![chunk];
        };

        input.redaction.count = 0;
        input.redaction.details.clear();
        vec![notice, chunk]
    }
}
