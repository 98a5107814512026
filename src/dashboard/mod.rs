//! Dashboard views over stored traffic
//!
//! Stored prompts and outputs are raw JSON. These helpers pull the user's
//! question and the assistant's answer out of them and group the exchanges
//! into conversations by the upstream chat id.

use crate::core::constants::{content, role};
use crate::models::dashboard::{
    AlertConversation, ChatMessage, Conversation, PartialConversation, QuestionAnswer,
};
use crate::models::db::{AlertWithPrompt, PromptWithOutput};
use crate::pipeline::output::chunk_text;
use serde_json::Value;
use tracing::debug;

/// Prompts that clients send on their own, not typed by the user
const INTERNAL_PROMPTS: [&str; 1] = [
    "Given the following... please reply with a short summary that is 4-12 words in length, \
     you should summarize what the user is asking for OR what the user is trying to accomplish. \
     You should only respond with the summary, no additional text or explanation, \
     you don't need ending punctuation.",
];

fn is_internal_prompt(message: &str) -> bool {
    INTERNAL_PROMPTS.iter().any(|p| message.contains(p))
}

/// Text of a message `content`: the string itself or its last text part
fn content_text(content_value: &Value) -> Option<&str> {
    match content_value {
        Value::String(s) => Some(s.as_str()),
        Value::Array(parts) => parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some(content::TEXT))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .last(),
        _ => None,
    }
}

/// Latest user message of a stored request
///
/// Falls back to a top-level `prompt` for completion style requests.
pub fn parse_request(request: &str) -> Option<String> {
    let request: Value = match serde_json::from_str(request) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Could not parse stored request");
            return None;
        }
    };

    let from_messages = request
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|m| m.get("role").and_then(Value::as_str) == Some(role::USER))
        .filter_map(|m| m.get("content").and_then(content_text))
        .filter(|text| !text.is_empty() && !is_internal_prompt(text))
        .last();

    from_messages
        .or_else(|| {
            request
                .get("prompt")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty() && !is_internal_prompt(p))
        })
        .map(str::to_string)
}

/// Assistant text and chat id of a stored output
///
/// Streamed outputs are stored as a JSON array of chunks; whole responses as
/// a single object.
pub fn parse_output(output: &str) -> (Option<String>, Option<String>) {
    let output: Value = match serde_json::from_str(output) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Could not parse stored output");
            return (None, None);
        }
    };

    match output {
        Value::Array(chunks) => {
            let mut message = String::new();
            let mut chat_id = None;
            for chunk in chunks.iter().filter(|c| c.is_object()) {
                if chat_id.is_none() {
                    chat_id = chunk_id(chunk);
                }
                if let Some(text) = chunk_text(chunk) {
                    message.push_str(text);
                }
            }
            (Some(message), chat_id)
        }
        Value::Object(_) => (Some(response_text(&output)), chunk_id(&output)),
        _ => (None, None),
    }
}

fn chunk_id(chunk: &Value) -> Option<String> {
    chunk
        .get("id")
        .or_else(|| chunk.pointer("/message/id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Text of a non-streamed response in OpenAI, Anthropic or Ollama shape
fn response_text(response: &Value) -> String {
    if let Some(choices) = response.get("choices").and_then(Value::as_array) {
        return choices
            .iter()
            .filter_map(|c| {
                c.pointer("/message/content")
                    .or_else(|| c.get("text"))
                    .and_then(Value::as_str)
            })
            .collect();
    }
    if let Some(blocks) = response.get("content").and_then(Value::as_array) {
        return blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();
    }
    response
        .pointer("/message/content")
        .or_else(|| response.get("response"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// One stored exchange, or `None` if either side has no usable text
///
/// Outputs without an upstream id (Ollama) use the prompt id as chat id.
pub fn parse_prompt_with_output(row: &PromptWithOutput) -> Option<PartialConversation> {
    let question = parse_request(&row.request)?;
    let (answer, chat_id) = parse_output(row.output.as_deref()?);
    let answer = answer.filter(|a| !a.is_empty())?;
    let chat_id = chat_id.unwrap_or_else(|| row.id.clone());

    Some(PartialConversation {
        question_answer: QuestionAnswer {
            question: ChatMessage {
                message: question,
                timestamp: row.timestamp,
                message_id: row.id.clone(),
            },
            answer: ChatMessage {
                message: answer,
                timestamp: row.output_timestamp.unwrap_or(row.timestamp),
                message_id: row.output_id.clone().unwrap_or_default(),
            },
        },
        provider: row.provider.clone(),
        conversation_type: row.prompt_type.clone(),
        chat_id,
        request_timestamp: row.timestamp,
    })
}

/// Group exchanges by chat id, each group ordered by request time
///
/// Groups keep the order in which their chat id first appears.
pub fn match_conversations(partials: Vec<Option<PartialConversation>>) -> Vec<Conversation> {
    let mut groups: Vec<(String, Vec<PartialConversation>)> = Vec::new();
    for partial in partials.into_iter().flatten() {
        match groups.iter_mut().find(|(id, _)| *id == partial.chat_id) {
            Some((_, group)) => group.push(partial),
            None => groups.push((partial.chat_id.clone(), vec![partial])),
        }
    }

    groups
        .into_iter()
        .filter_map(|(chat_id, mut group)| {
            group.sort_by_key(|p| p.request_timestamp);
            let first = group.first()?.request_timestamp;
            let last = group.last()?;
            let provider = last.provider.clone();
            let conversation_type = last.conversation_type.clone();
            Some(Conversation {
                question_answers: group.into_iter().map(|p| p.question_answer).collect(),
                provider,
                conversation_type,
                chat_id,
                conversation_timestamp: first,
            })
        })
        .collect()
}

/// Alerts with the single exchange that raised each of them
pub fn parse_alerts(rows: &[AlertWithPrompt]) -> Vec<AlertConversation> {
    rows.iter()
        .filter_map(|row| {
            let partial = parse_prompt_with_output(&row.prompt)?;
            let conversation = match_conversations(vec![Some(partial)]).pop()?;
            Some(AlertConversation {
                conversation,
                alert_id: row.alert.id.clone(),
                code_snippet: row.alert.code_snippet.clone(),
                trigger_string: row.alert.trigger_string.clone(),
                trigger_type: row.alert.trigger_type.clone(),
                trigger_category: row.alert.trigger_category.clone(),
                timestamp: row.alert.timestamp,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::db::Alert;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn row(id: &str, secs: i64, request: Value, output: Option<Value>) -> PromptWithOutput {
        let timestamp = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        PromptWithOutput {
            id: id.to_string(),
            timestamp,
            provider: Some("openai".to_string()),
            request: request.to_string(),
            prompt_type: "chat".to_string(),
            output_id: output.as_ref().map(|_| format!("out-{}", id)),
            output: output.map(|o| o.to_string()),
            output_timestamp: Some(timestamp),
        }
    }

    #[test]
    fn test_parse_request_latest_user_message() {
        let request = json!({"messages": [
            {"role": "system", "content": "sys"},
            {"role": "user", "content": "first"},
            {"role": "assistant", "content": "reply"},
            {"role": "user", "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "second"}]}
        ]});
        assert_eq!(parse_request(&request.to_string()).as_deref(), Some("second"));
    }

    #[test]
    fn test_parse_request_skips_internal_and_falls_back_to_prompt() {
        let request = json!({
            "messages": [{"role": "user", "content": format!("{} ok", INTERNAL_PROMPTS[0])}],
            "prompt": "def add(a, b):"
        });
        assert_eq!(parse_request(&request.to_string()).as_deref(), Some("def add(a, b):"));
        assert_eq!(parse_request("not json"), None);
        assert_eq!(parse_request("{}"), None);
    }

    #[test]
    fn test_parse_output_streamed_and_whole() {
        let streamed = json!([
            {"id": "chat-1", "choices": [{"delta": {"role": "assistant", "content": "Hel"}}]},
            {"id": "chat-1", "choices": [{"delta": {"content": "lo"}}]},
            "garbage"
        ]);
        assert_eq!(
            parse_output(&streamed.to_string()),
            (Some("Hello".to_string()), Some("chat-1".to_string()))
        );

        let whole = json!({"id": "chat-2", "choices": [{"message": {"content": "Hi"}}]});
        assert_eq!(
            parse_output(&whole.to_string()),
            (Some("Hi".to_string()), Some("chat-2".to_string()))
        );

        let anthropic = json!({"id": "msg_1", "content": [{"type": "text", "text": "Yo"}]});
        assert_eq!(parse_output(&anthropic.to_string()).0.as_deref(), Some("Yo"));

        assert_eq!(parse_output("oops"), (None, None));
    }

    #[test]
    fn test_parse_prompt_with_output_requires_both_sides() {
        let ok = row(
            "p1",
            0,
            json!({"messages": [{"role": "user", "content": "q"}]}),
            Some(json!({"id": "c", "choices": [{"message": {"content": "a"}}]})),
        );
        let partial = parse_prompt_with_output(&ok).unwrap();
        assert_eq!(partial.chat_id, "c");
        assert_eq!(partial.question_answer.answer.message_id, "out-p1");

        let no_output = row("p2", 0, json!({"messages": [{"role": "user", "content": "q"}]}), None);
        assert!(parse_prompt_with_output(&no_output).is_none());

        let empty_answer = row(
            "p3",
            0,
            json!({"messages": [{"role": "user", "content": "q"}]}),
            Some(json!({"id": "c", "choices": [{"message": {"content": ""}}]})),
        );
        assert!(parse_prompt_with_output(&empty_answer).is_none());
    }

    #[test]
    fn test_match_conversations_groups_and_sorts() {
        let user = |text: &str| json!({"messages": [{"role": "user", "content": text}]});
        let answer = |id: &str| Some(json!({"id": id, "choices": [{"message": {"content": "a"}}]}));

        let rows = vec![
            row("p3", 30, user("third"), answer("chat-a")),
            row("p2", 20, user("other"), answer("chat-b")),
            row("p1", 10, user("first"), answer("chat-a")),
        ];
        let partials = rows.iter().map(parse_prompt_with_output).chain([None]).collect();

        let conversations = match_conversations(partials);
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].chat_id, "chat-a");
        let questions: Vec<&str> = conversations[0]
            .question_answers
            .iter()
            .map(|qa| qa.question.message.as_str())
            .collect();
        assert_eq!(questions, vec!["first", "third"]);
        assert_eq!(conversations[0].conversation_timestamp, rows[2].timestamp);
    }

    #[test]
    fn test_parse_alerts() {
        let prompt = row(
            "p1",
            0,
            json!({"messages": [{"role": "user", "content": "q"}]}),
            Some(json!({"id": "c", "choices": [{"message": {"content": "a"}}]})),
        );
        let alert = Alert {
            id: "a1".to_string(),
            prompt_id: "p1".to_string(),
            output_id: None,
            code_snippet: None,
            trigger_string: Some("PII".to_string()),
            trigger_type: "codegate-pii".to_string(),
            trigger_category: Some("critical".to_string()),
            timestamp: prompt.timestamp,
        };

        let parsed = parse_alerts(&[AlertWithPrompt { alert, prompt }]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].alert_id, "a1");
        assert_eq!(parsed[0].conversation.chat_id, "c");
    }
}
