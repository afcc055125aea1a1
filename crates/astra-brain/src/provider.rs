// Local LLM provider speaking the Ollama chat API. The only outbound LLM
// surface in the process; the privacy router guarantees the base URL is local.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::BrainError;
use crate::types::{ChatMessage, ModelKind};

#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub text: String,
    pub usage: Option<Value>,
    pub model_id: String,
}

#[derive(Clone)]
pub struct LocalLlmProvider {
    base_url: String,
    client: reqwest::Client,
    default_num_ctx: i64,
    default_num_predict: i64,
    default_timeout: Duration,
}

pub struct ChatOptions<'a> {
    pub model: &'a str,
    pub model_kind: ModelKind,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub max_tokens: Option<i64>,
    pub json_schema: Option<&'a Value>,
    pub tools: Option<&'a Value>,
    pub timeout_s: Option<u64>,
}

impl LocalLlmProvider {
    pub fn new(
        base_url: &str,
        timeout_s: u64,
        default_num_ctx: i64,
        default_num_predict: i64,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            default_num_ctx,
            default_num_predict,
            default_timeout: Duration::from_secs(timeout_s),
        }
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions<'_>,
    ) -> Result<ProviderResult, BrainError> {
        let mut opts = json!({
            "temperature": options.temperature,
            "num_ctx": self.default_num_ctx,
            "num_predict": options.max_tokens.unwrap_or(self.default_num_predict),
        });
        if let Some(top_p) = options.top_p {
            opts["top_p"] = json!(top_p);
        }
        if let Some(repeat_penalty) = options.repeat_penalty {
            opts["repeat_penalty"] = json!(repeat_penalty);
        }

        let mut payload = json!({
            "model": options.model,
            "messages": messages,
            "stream": false,
            "options": opts,
        });
        if let Some(schema) = options.json_schema {
            payload["format"] = schema.clone();
        }
        if let Some(tools) = options.tools {
            payload["tools"] = tools.clone();
        }

        let timeout = options
            .timeout_s
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BrainError::Connection(e.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 && body.to_lowercase().contains("not found") {
                return Err(BrainError::ModelNotFound(options.model.to_string()));
            }
            return Err(BrainError::Http {
                status: status.as_u16(),
            });
        }

        let data: Value = response.json().await.map_err(|_| BrainError::InvalidJson)?;

        let text = data
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let usage = json!({
            "prompt_eval_count": data.get("prompt_eval_count"),
            "eval_count": data.get("eval_count"),
            "total_duration": data.get("total_duration"),
        });
        let model_id = data
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(options.model)
            .to_string();

        Ok(ProviderResult {
            text,
            usage: Some(usage),
            model_id,
        })
    }
}
