use serde::{Deserialize, Serialize};
use serde_json::Value;

use astra_core::privacy::ContextItem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Chat,
    Code,
}

/// One request into the brain. `purpose` selects queue priority and model
/// tiering; `chat_response` with kind `chat` rides the chat-priority queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub purpose: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub context_items: Vec<ContextItem>,
    pub preferred_model_kind: ModelKind,
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Deterministic stub path, set from run meta or env.
    #[serde(default)]
    pub qa_mode: bool,
}

impl LlmRequest {
    pub fn new(purpose: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            purpose: purpose.into(),
            messages,
            context_items: Vec::new(),
            preferred_model_kind: ModelKind::Chat,
            temperature: 0.2,
            top_p: None,
            repeat_penalty: None,
            max_tokens: None,
            json_schema: None,
            tools: None,
            run_id: None,
            task_id: None,
            step_id: None,
            qa_mode: false,
        }
    }

    pub fn last_user_message(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role.trim().eq_ignore_ascii_case("user"))
            .map(|message| message.content.trim().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    BudgetExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    pub provider: String,
    pub model_id: String,
    pub latency_ms: i64,
    pub cache_hit: bool,
    pub route_reason: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default)]
    pub retry_count: u32,
}

impl LlmResponse {
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}
