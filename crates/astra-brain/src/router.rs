// Brain Router
// Serializes LLM calls through the priority queue, picks a model tier per
// request, caches per-run, enforces budgets, and narrates via the event bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use astra_core::config::env_bool;
use astra_core::privacy::{decide_route, summarize_items, PolicyFlags};
use astra_core::EventBus;
use astra_types::{EventLevel, EventType};

use crate::config::BrainConfig;
use crate::error::BrainError;
use crate::provider::{ChatOptions, LocalLlmProvider};
use crate::queue::BrainQueue;
use crate::types::{LlmRequest, LlmResponse, ModelKind, ResponseStatus};
use crate::LlmClient;

// Tier cues match as stems on purpose: "подроб" must catch "подробный",
// "анализ" must catch "анализировать".
static FAST_EXCLUDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(код|code|python|javascript|sql|regex|архитект|пошаг|подроб|сравни|анализ)")
        .expect("fast exclude pattern")
});
static COMPLEX_CUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(архитект|план|сравни|объясни|деталь|подроб|анализ|формул|доказ|рефактор)")
        .expect("complex cue pattern")
});

/// Which chat tier a query lands on. Surfaced into run meta as
/// `chat_inference_profile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatProfile {
    Fast,
    Complex,
    Base,
}

impl ChatProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Complex => "complex",
            Self::Base => "base",
        }
    }
}

pub struct BrainRouter {
    config: BrainConfig,
    queue: BrainQueue,
    provider: LocalLlmProvider,
    bus: Option<EventBus>,
    cache: Mutex<HashMap<String, HashMap<String, LlmResponse>>>,
    run_counts: Mutex<HashMap<String, u32>>,
    step_counts: Mutex<HashMap<(String, String), u32>>,
    local_failures: Mutex<HashMap<(String, String), u32>>,
}

impl BrainRouter {
    pub fn new(config: BrainConfig, bus: Option<EventBus>) -> Self {
        let queue = BrainQueue::new(config.max_concurrency, config.chat_priority_extra_slots);
        let provider = LocalLlmProvider::new(
            &config.local_base_url,
            config.local_timeout_s,
            config.local_num_ctx,
            config.local_num_predict,
        );
        Self {
            config,
            queue,
            provider,
            bus,
            cache: Mutex::new(HashMap::new()),
            run_counts: Mutex::new(HashMap::new()),
            step_counts: Mutex::new(HashMap::new()),
            local_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BrainConfig {
        &self.config
    }

    pub async fn dispatch(&self, request: LlmRequest) -> Result<LlmResponse, BrainError> {
        let run_id = request.run_id.clone();
        let task_id = request.task_id.clone();
        let step_id = request.step_id.clone();

        if request.qa_mode || env_bool("ASTRA_QA_MODE", false) {
            return Ok(self.qa_response(&request, run_id.as_deref(), task_id.as_deref(), step_id.as_deref()).await);
        }

        let flags = PolicyFlags::default();
        let decision = decide_route(&request.context_items, &flags);
        let model_id = self.select_model(&request);
        let items_summary = summarize_items(&request.context_items);

        self.emit(
            run_id.as_deref(),
            EventType::LlmRouteDecided,
            "LLM route decided",
            json!({
                "route": decision.route.as_str(),
                "reason": decision.reason,
                "provider": "local",
                "model_id": model_id,
                "items_summary_by_source_type": items_summary["by_source_type"],
            }),
            EventLevel::Info,
            task_id.as_deref(),
            step_id.as_deref(),
        )
        .await;

        let cache_key = cache_key(decision.route.as_str(), &model_id, &request);
        if let Some(cached) = self.cache_get(run_id.as_deref(), &cache_key) {
            self.emit(
                run_id.as_deref(),
                EventType::LlmRequestStarted,
                "LLM request started",
                json!({ "provider": cached.provider, "model_id": cached.model_id }),
                EventLevel::Info,
                task_id.as_deref(),
                step_id.as_deref(),
            )
            .await;
            self.emit(
                run_id.as_deref(),
                EventType::LlmRequestSucceeded,
                "LLM request succeeded",
                json!({
                    "provider": cached.provider,
                    "model_id": cached.model_id,
                    "latency_ms": 0,
                    "usage_if_available": cached.usage,
                    "cache_hit": true,
                }),
                EventLevel::Info,
                task_id.as_deref(),
                step_id.as_deref(),
            )
            .await;
            return Ok(cached);
        }

        if let Some(run_id_value) = run_id.as_deref() {
            if let Some((budget_name, limit, current)) =
                self.check_budget(run_id_value, step_id.as_deref())
            {
                self.emit(
                    Some(run_id_value),
                    EventType::LlmBudgetExceeded,
                    "LLM budget exceeded",
                    json!({ "budget_name": budget_name, "limit": limit, "current": current }),
                    EventLevel::Warning,
                    task_id.as_deref(),
                    step_id.as_deref(),
                )
                .await;
                return Ok(LlmResponse {
                    text: String::new(),
                    usage: None,
                    provider: "local".to_string(),
                    model_id,
                    latency_ms: 0,
                    cache_hit: false,
                    route_reason: decision.reason.to_string(),
                    status: ResponseStatus::BudgetExceeded,
                    error_type: Some("budget_exceeded".to_string()),
                    http_status: None,
                    retry_count: 0,
                });
            }
        }

        let prioritize_chat =
            request.purpose == "chat_response" && request.preferred_model_kind == ModelKind::Chat;
        let _permit = self.queue.acquire(prioritize_chat).await;
        let start = Instant::now();

        self.emit(
            run_id.as_deref(),
            EventType::LlmRequestStarted,
            "LLM request started",
            json!({ "provider": "local", "model_id": model_id }),
            EventLevel::Info,
            task_id.as_deref(),
            step_id.as_deref(),
        )
        .await;

        match self.call_local(&request, &model_id).await {
            Ok(result) => {
                let response = LlmResponse {
                    text: result.text,
                    usage: result.usage,
                    provider: "local".to_string(),
                    model_id: result.model_id,
                    latency_ms: start.elapsed().as_millis() as i64,
                    cache_hit: false,
                    route_reason: decision.reason.to_string(),
                    status: ResponseStatus::Ok,
                    error_type: None,
                    http_status: None,
                    retry_count: 0,
                };
                self.note_local_result(run_id.as_deref(), request.preferred_model_kind, &response);

                self.emit(
                    run_id.as_deref(),
                    EventType::LlmRequestSucceeded,
                    "LLM request succeeded",
                    json!({
                        "provider": response.provider,
                        "model_id": response.model_id,
                        "latency_ms": response.latency_ms,
                        "usage_if_available": response.usage,
                        "cache_hit": false,
                    }),
                    EventLevel::Info,
                    task_id.as_deref(),
                    step_id.as_deref(),
                )
                .await;

                self.cache_set(run_id.as_deref(), &cache_key, &response);
                self.increment_budget(run_id.as_deref(), step_id.as_deref());
                Ok(response)
            }
            Err(error) => {
                self.emit(
                    run_id.as_deref(),
                    EventType::LlmRequestFailed,
                    "LLM request failed",
                    json!({
                        "provider": "local",
                        "model_id": model_id,
                        "error_type": error.error_type(),
                        "http_status_if_any": error.http_status(),
                        "retry_count": 0,
                    }),
                    EventLevel::Warning,
                    task_id.as_deref(),
                    step_id.as_deref(),
                )
                .await;
                if let Some(status) = error.http_status() {
                    self.emit(
                        run_id.as_deref(),
                        EventType::LocalLlmHttpError,
                        "Local LLM HTTP error",
                        json!({ "status": status, "model_id": model_id }),
                        EventLevel::Warning,
                        task_id.as_deref(),
                        step_id.as_deref(),
                    )
                    .await;
                }
                self.note_local_failure(run_id.as_deref(), request.preferred_model_kind);
                Err(error)
            }
        }
    }

    async fn call_local(
        &self,
        request: &LlmRequest,
        model_id: &str,
    ) -> Result<crate::provider::ProviderResult, BrainError> {
        // Tiered chat models get a tighter timeout so a stuck tier degrades
        // fast instead of eating the whole chat latency budget.
        let timeout_override = if request.preferred_model_kind == ModelKind::Chat
            && request.purpose == "chat_response"
            && model_id != self.config.local_chat_model
        {
            Some(
                self.config
                    .chat_tier_timeout_s
                    .min(self.config.local_timeout_s)
                    .max(5),
            )
        } else {
            None
        };

        let attempt = self
            .provider
            .chat(
                &request.messages,
                ChatOptions {
                    model: model_id,
                    model_kind: request.preferred_model_kind,
                    temperature: request.temperature,
                    top_p: request.top_p,
                    repeat_penalty: request.repeat_penalty,
                    max_tokens: request.max_tokens,
                    json_schema: request.json_schema.as_ref(),
                    tools: request.tools.as_ref(),
                    timeout_s: timeout_override,
                },
            )
            .await;

        match attempt {
            Ok(result) => Ok(result),
            Err(error)
                if request.preferred_model_kind == ModelKind::Chat
                    && model_id != self.config.local_chat_model
                    && error.is_tier_fallback_eligible() =>
            {
                // Tiered model can be absent/unstable locally; retry once on
                // the base chat model with a grace timeout.
                let grace = self
                    .config
                    .chat_tier_timeout_s
                    .max(35)
                    .min(self.config.local_timeout_s)
                    .max(5);
                self.provider
                    .chat(
                        &request.messages,
                        ChatOptions {
                            model: &self.config.local_chat_model,
                            model_kind: request.preferred_model_kind,
                            temperature: request.temperature,
                            top_p: request.top_p,
                            repeat_penalty: request.repeat_penalty,
                            max_tokens: request.max_tokens,
                            json_schema: request.json_schema.as_ref(),
                            tools: request.tools.as_ref(),
                            timeout_s: Some(grace),
                        },
                    )
                    .await
            }
            Err(error) => Err(error),
        }
    }

    // ========================================================================
    // Model selection
    // ========================================================================

    fn select_model(&self, request: &LlmRequest) -> String {
        if request.preferred_model_kind == ModelKind::Code {
            return self.config.local_code_model.clone();
        }
        if request.purpose != "chat_response" {
            return self.config.local_chat_model.clone();
        }
        let query = request.last_user_message();
        match self.chat_profile_for_query(&query) {
            ChatProfile::Fast => self
                .config
                .local_chat_fast_model
                .clone()
                .unwrap_or_else(|| self.config.local_chat_model.clone()),
            ChatProfile::Complex => self
                .config
                .local_chat_complex_model
                .clone()
                .unwrap_or_else(|| self.config.local_chat_model.clone()),
            ChatProfile::Base => self.config.local_chat_model.clone(),
        }
    }

    pub fn chat_profile_for_query(&self, query: &str) -> ChatProfile {
        let normalized = query.trim();
        if normalized.is_empty() {
            return ChatProfile::Base;
        }
        if self.is_fast_chat_query(normalized) {
            return ChatProfile::Fast;
        }
        if self.is_complex_chat_query(normalized) {
            return ChatProfile::Complex;
        }
        ChatProfile::Base
    }

    fn is_fast_chat_query(&self, normalized: &str) -> bool {
        let words = normalized.split_whitespace().count();
        if normalized.chars().count() > self.config.fast_query_max_chars {
            return false;
        }
        if words > self.config.fast_query_max_words {
            return false;
        }
        if normalized.contains('\n') || normalized.contains("```") {
            return false;
        }
        !FAST_EXCLUDE_RE.is_match(normalized)
    }

    fn is_complex_chat_query(&self, normalized: &str) -> bool {
        let words = normalized.split_whitespace().count();
        if normalized.chars().count() >= self.config.complex_query_min_chars {
            return true;
        }
        if words >= self.config.complex_query_min_words {
            return true;
        }
        if normalized.contains("```") {
            return true;
        }
        COMPLEX_CUE_RE.is_match(normalized)
    }

    // ========================================================================
    // Cache / budget / failure tracking
    // ========================================================================

    fn cache_get(&self, run_id: Option<&str>, key: &str) -> Option<LlmResponse> {
        let run_id = run_id?;
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let cached = cache.get(run_id)?.get(key)?;
        let mut hit = cached.clone();
        hit.latency_ms = 0;
        hit.cache_hit = true;
        Some(hit)
    }

    fn cache_set(&self, run_id: Option<&str>, key: &str, response: &LlmResponse) {
        let Some(run_id) = run_id else { return };
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(run_id.to_string())
            .or_default()
            .insert(key.to_string(), response.clone());
    }

    fn check_budget(&self, run_id: &str, step_id: Option<&str>) -> Option<(&'static str, u32, u32)> {
        if let Some(limit) = self.config.budget_per_run {
            let counts = self.run_counts.lock().unwrap_or_else(|e| e.into_inner());
            let current = counts.get(run_id).copied().unwrap_or(0);
            if current >= limit {
                return Some(("per_run", limit, current));
            }
        }
        if let (Some(step_id), Some(limit)) = (step_id, self.config.budget_per_step) {
            let counts = self.step_counts.lock().unwrap_or_else(|e| e.into_inner());
            let current = counts
                .get(&(run_id.to_string(), step_id.to_string()))
                .copied()
                .unwrap_or(0);
            if current >= limit {
                return Some(("per_step", limit, current));
            }
        }
        None
    }

    fn increment_budget(&self, run_id: Option<&str>, step_id: Option<&str>) {
        let Some(run_id) = run_id else { return };
        {
            let mut counts = self.run_counts.lock().unwrap_or_else(|e| e.into_inner());
            *counts.entry(run_id.to_string()).or_insert(0) += 1;
        }
        if let Some(step_id) = step_id {
            let mut counts = self.step_counts.lock().unwrap_or_else(|e| e.into_inner());
            *counts
                .entry((run_id.to_string(), step_id.to_string()))
                .or_insert(0) += 1;
        }
    }

    fn note_local_failure(&self, run_id: Option<&str>, kind: ModelKind) {
        let key = (run_id.unwrap_or("").to_string(), kind_label(kind).to_string());
        let mut failures = self.local_failures.lock().unwrap_or_else(|e| e.into_inner());
        *failures.entry(key).or_insert(0) += 1;
    }

    fn note_local_result(&self, run_id: Option<&str>, kind: ModelKind, response: &LlmResponse) {
        let key = (run_id.unwrap_or("").to_string(), kind_label(kind).to_string());
        let mut failures = self.local_failures.lock().unwrap_or_else(|e| e.into_inner());
        if response.text.trim().is_empty() {
            *failures.entry(key).or_insert(0) += 1;
        } else {
            failures.insert(key, 0);
        }
    }

    // ========================================================================
    // QA stub & events
    // ========================================================================

    async fn qa_response(
        &self,
        request: &LlmRequest,
        run_id: Option<&str>,
        task_id: Option<&str>,
        step_id: Option<&str>,
    ) -> LlmResponse {
        let model_id = "qa_stub";
        self.emit(
            run_id,
            EventType::LlmRouteDecided,
            "LLM route decided",
            json!({
                "route": "LOCAL",
                "reason": "qa_mode",
                "provider": "local",
                "model_id": model_id,
                "items_summary_by_source_type": summarize_items(&request.context_items)["by_source_type"],
            }),
            EventLevel::Info,
            task_id,
            step_id,
        )
        .await;
        self.emit(
            run_id,
            EventType::LlmRequestStarted,
            "LLM request started",
            json!({ "provider": "local", "model_id": model_id }),
            EventLevel::Info,
            task_id,
            step_id,
        )
        .await;

        let text = if request.json_schema.is_some() {
            "{\"qa_mode\": true}".to_string()
        } else if !request.messages.is_empty() {
            "QA mode: response stub.".to_string()
        } else {
            "QA mode".to_string()
        };
        let response = LlmResponse {
            text,
            usage: None,
            provider: "local".to_string(),
            model_id: model_id.to_string(),
            latency_ms: 0,
            cache_hit: true,
            route_reason: "qa_mode".to_string(),
            status: ResponseStatus::Ok,
            error_type: None,
            http_status: None,
            retry_count: 0,
        };

        self.emit(
            run_id,
            EventType::LlmRequestSucceeded,
            "LLM request succeeded",
            json!({
                "provider": response.provider,
                "model_id": response.model_id,
                "latency_ms": 0,
                "usage_if_available": response.usage,
                "cache_hit": true,
            }),
            EventLevel::Info,
            task_id,
            step_id,
        )
        .await;
        response
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit(
        &self,
        run_id: Option<&str>,
        event_type: EventType,
        message: &str,
        payload: Value,
        level: EventLevel,
        task_id: Option<&str>,
        step_id: Option<&str>,
    ) {
        let (Some(bus), Some(run_id)) = (self.bus.as_ref(), run_id) else {
            return;
        };
        if let Err(e) = bus
            .emit(run_id, event_type, message, payload, level, task_id, step_id)
            .await
        {
            tracing::error!("failed to emit brain event: {}", e);
        }
    }
}

#[async_trait]
impl LlmClient for BrainRouter {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, BrainError> {
        self.dispatch(request).await
    }
}

fn kind_label(kind: ModelKind) -> &'static str {
    match kind {
        ModelKind::Chat => "chat",
        ModelKind::Code => "code",
    }
}

/// Content-addressed cache key over everything that shapes the completion.
fn cache_key(route: &str, model_id: &str, request: &LlmRequest) -> String {
    let payload = json!({
        "route": route,
        "model": model_id,
        "temperature": request.temperature,
        "top_p": request.top_p,
        "repeat_penalty": request.repeat_penalty,
        "max_tokens": request.max_tokens,
        "messages": request.messages,
        "json_schema": request.json_schema,
        "tools": request.tools,
    });
    let raw = payload.to_string();
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn router() -> BrainRouter {
        BrainRouter::new(BrainConfig::from_env(), None)
    }

    #[test]
    fn short_query_selects_fast_profile() {
        let router = router();
        assert_eq!(router.chat_profile_for_query("2+2?"), ChatProfile::Fast);
        assert_eq!(router.chat_profile_for_query("как дела"), ChatProfile::Fast);
    }

    #[test]
    fn code_fences_and_cues_select_complex_profile() {
        let router = router();
        assert_eq!(
            router.chat_profile_for_query("объясни ```fn main() {}``` детально"),
            ChatProfile::Complex
        );
        assert_eq!(
            router.chat_profile_for_query(
                "Составь подробный план тренировок на месяц с этапами, рисками и метриками прогресса."
            ),
            ChatProfile::Complex
        );
    }

    #[test]
    fn cache_key_is_stable_and_parameter_sensitive() {
        let request_a = LlmRequest::new("chat_response", vec![ChatMessage::user("привет")]);
        let request_b = LlmRequest::new("chat_response", vec![ChatMessage::user("привет")]);
        assert_eq!(
            cache_key("LOCAL", "m", &request_a),
            cache_key("LOCAL", "m", &request_b)
        );

        let mut request_c = request_a.clone();
        request_c.temperature = 0.9;
        assert_ne!(
            cache_key("LOCAL", "m", &request_a),
            cache_key("LOCAL", "m", &request_c)
        );
    }

    #[tokio::test]
    async fn qa_mode_short_circuits_without_network() {
        let router = router();
        let mut request = LlmRequest::new("chat_response", vec![ChatMessage::user("2+2?")]);
        request.qa_mode = true;
        let response = router.dispatch(request).await.unwrap();
        assert_eq!(response.model_id, "qa_stub");
        assert!(response.cache_hit);
        assert_eq!(response.text, "QA mode: response stub.");
    }

    #[tokio::test]
    async fn budget_exceeded_returns_non_ok_response() {
        let mut config = BrainConfig::from_env();
        config.budget_per_run = Some(0);
        let router = BrainRouter::new(config, None);
        let mut request = LlmRequest::new("chat_response", vec![ChatMessage::user("привет")]);
        request.run_id = Some("run-1".to_string());
        let response = router.dispatch(request).await.unwrap();
        assert_eq!(response.status, ResponseStatus::BudgetExceeded);
        assert_eq!(response.error_type.as_deref(), Some("budget_exceeded"));
        assert!(response.text.is_empty());
    }
}
