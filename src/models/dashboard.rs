//! Dashboard response models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One side of a question/answer pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub question: ChatMessage,
    pub answer: ChatMessage,
}

/// A single stored exchange, before grouping by chat id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialConversation {
    pub question_answer: QuestionAnswer,
    pub provider: Option<String>,
    #[serde(rename = "type")]
    pub conversation_type: String,
    pub chat_id: String,
    pub request_timestamp: DateTime<Utc>,
}

/// Exchanges sharing a chat id, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub question_answers: Vec<QuestionAnswer>,
    pub provider: Option<String>,
    #[serde(rename = "type")]
    pub conversation_type: String,
    pub chat_id: String,
    pub conversation_timestamp: DateTime<Utc>,
}

/// An alert and the exchange that raised it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConversation {
    pub conversation: Conversation,
    pub alert_id: String,
    pub code_snippet: Option<String>,
    pub trigger_string: Option<String>,
    pub trigger_type: String,
    pub trigger_category: Option<String>,
    pub timestamp: DateTime<Utc>,
}
