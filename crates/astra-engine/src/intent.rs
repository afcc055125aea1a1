// Intent Router
// Fast-chat path first, then a semantic classifier over the brain with a
// strict JSON schema. Any classifier failure degrades to CHAT: the kernel
// never fails a run because classification infrastructure is down.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

use astra_brain::{ChatMessage, LlmClient, LlmRequest};
use astra_core::config::ChatConfig;
use astra_core::privacy::{ContextItem, Sensitivity, SourceType};
use astra_types::{
    ActHint, DecisionPath, Intent, IntentDecision, RunMode, StepKind,
};

pub static FAST_CHAT_ACTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)\b(напомни|через\s+\d+|открой|запусти|выполни|кликни|нажми|перейди|удали|очисти|",
        r"отправь|оплати|переведи|создай\s+напомин|deploy|terminal|командн\w+\s+строк\w+|",
        r"браузер|browser|file|файл|папк\w+)"
    ))
    .expect("fast chat action pattern")
});

pub static FAST_CHAT_MEMORY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)\b(запомни|сохрани\s+в\s+память|добавь\s+в\s+память|меня\s+\S+\s+зовут|меня\s+зовут|",
        r"мо[её]\s+имя|называй\s+меня|предпочитаю|remember\s+this|my\s+name\s+is|save\s+to\s+memory)"
    ))
    .expect("fast chat memory pattern")
});

/// Error from the semantic classifier; the caller degrades to CHAT.
#[derive(Debug, Clone)]
pub struct SemanticDecisionError {
    pub code: String,
}

impl std::fmt::Display for SemanticDecisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "semantic decision failed: {}", self.code)
    }
}

impl std::error::Error for SemanticDecisionError {}

/// Short, non-actionable, non-memory queries skip the semantic call entirely.
pub fn is_fast_chat_candidate(text: &str, qa_mode: bool, config: &ChatConfig) -> bool {
    if qa_mode || !config.fast_path_enabled {
        return false;
    }
    let query = text.trim();
    if query.is_empty() {
        return false;
    }
    if query.chars().count() > config.fast_path_max_chars {
        return false;
    }
    if query.split_whitespace().count() > 32 {
        return false;
    }
    if FAST_CHAT_ACTION_RE.is_match(query) {
        return false;
    }
    !FAST_CHAT_MEMORY_RE.is_match(query)
}

pub fn fast_chat_decision() -> IntentDecision {
    IntentDecision {
        intent: Intent::Chat,
        confidence: 0.55,
        reasons: vec!["fast_chat_path".to_string()],
        needs_clarification: false,
        plan_hint: vec![StepKind::ChatResponse],
        memory_item: None,
        response_style_hint: None,
        user_visible_note: None,
        decision_path: DecisionPath::FastChatPath,
    }
}

/// Degrade-to-CHAT decision used whenever the classifier errors.
pub fn semantic_resilience_decision(error_code: &str) -> IntentDecision {
    IntentDecision {
        intent: Intent::Chat,
        confidence: 0.0,
        reasons: vec!["semantic_resilience".to_string(), error_code.to_string()],
        needs_clarification: false,
        plan_hint: vec![StepKind::ChatResponse],
        memory_item: None,
        response_style_hint: None,
        user_visible_note: Some(
            "Семантическая классификация недоступна, отвечаю напрямую.".to_string(),
        ),
        decision_path: DecisionPath::SemanticResilience,
    }
}

pub struct IntentRouter {
    llm: Arc<dyn LlmClient>,
    qa_mode: bool,
}

impl IntentRouter {
    pub fn new(llm: Arc<dyn LlmClient>, qa_mode: bool) -> Self {
        Self { llm, qa_mode }
    }

    pub async fn decide(
        &self,
        query_text: &str,
        run_id: &str,
    ) -> Result<IntentDecision, SemanticDecisionError> {
        if self.qa_mode {
            // Deterministic QA shortcut keeps smoke runs off the model.
            return Ok(fast_chat_decision());
        }

        let schema = json!({
            "type": "object",
            "properties": {
                "intent": { "type": "string", "enum": ["CHAT", "ASK", "ACT"] },
                "confidence": { "type": "number" },
                "reasons": { "type": "array", "items": { "type": "string" } },
                "questions": { "type": "array", "items": { "type": "string" } },
                "needs_clarification": { "type": "boolean" },
                "suggested_run_mode": { "type": ["string", "null"] },
                "danger_flags": { "type": "array", "items": { "type": "string" } },
                "target": { "type": ["string", "null"] },
                "plan_hint": { "type": "array", "items": { "type": "string" } },
                "response_style_hint": { "type": ["string", "null"] }
            },
            "required": ["intent", "confidence"]
        });
        let mut request = LlmRequest::new(
            "semantic_decide",
            vec![
                ChatMessage::system(
                    "Классифицируй запрос владельца. CHAT — ответить текстом, ASK — нужны \
                     уточняющие вопросы, ACT — выполнить действия на компьютере. Верни строго \
                     JSON по схеме.",
                ),
                ChatMessage::user(query_text.to_string()),
            ],
        );
        request.json_schema = Some(schema);
        request.max_tokens = Some(300);
        request.run_id = Some(run_id.to_string());
        request.context_items = vec![ContextItem::text(
            query_text,
            SourceType::UserPrompt,
            Sensitivity::Personal,
        )];

        let response = self.llm.call(request).await.map_err(|error| {
            SemanticDecisionError {
                code: error.error_type().to_string(),
            }
        })?;
        if !response.is_ok() {
            return Err(SemanticDecisionError {
                code: response
                    .error_type
                    .unwrap_or_else(|| "semantic_decision_failed".to_string()),
            });
        }

        parse_semantic_payload(&response.text).ok_or(SemanticDecisionError {
            code: "semantic_invalid_json".to_string(),
        })
    }
}

fn parse_semantic_payload(text: &str) -> Option<IntentDecision> {
    let payload: Value = serde_json::from_str(text.trim()).ok()?;
    let intent_raw = payload.get("intent")?.as_str()?;

    let questions: Vec<String> = payload
        .get("questions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let danger_flags: Vec<String> = payload
        .get("danger_flags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let intent = match intent_raw {
        "CHAT" => Intent::Chat,
        "ASK" => Intent::Ask { questions },
        "ACT" => Intent::Act {
            act_hint: ActHint {
                suggested_run_mode: payload
                    .get("suggested_run_mode")
                    .and_then(Value::as_str)
                    .and_then(RunMode::parse),
                danger_flags,
                target: payload
                    .get("target")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
        },
        _ => return None,
    };

    let plan_hint: Vec<StepKind> = payload
        .get("plan_hint")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(StepKind::parse)
                .collect()
        })
        .unwrap_or_default();

    Some(IntentDecision {
        intent,
        confidence: payload
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0),
        reasons: payload
            .get("reasons")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        needs_clarification: payload
            .get("needs_clarification")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        plan_hint,
        memory_item: payload.get("memory_item").cloned().filter(|v| !v.is_null()),
        response_style_hint: payload
            .get("response_style_hint")
            .and_then(Value::as_str)
            .map(str::to_string),
        user_visible_note: None,
        decision_path: DecisionPath::Semantic,
    })
}

/// Resolve the effective run mode and purpose for a decided intent.
pub fn resolve_run_mode(
    decision: &IntentDecision,
    requested_mode: RunMode,
    requested_purpose: Option<&str>,
) -> (RunMode, Option<String>) {
    match &decision.intent {
        Intent::Act { act_hint } => {
            let mut mode = requested_mode;
            if act_hint.suggested_run_mode == Some(RunMode::ExecuteConfirm) {
                mode = RunMode::ExecuteConfirm;
            }
            (mode, requested_purpose.map(str::to_string))
        }
        Intent::Chat => (
            RunMode::PlanOnly,
            Some(
                requested_purpose
                    .map(str::to_string)
                    .unwrap_or_else(|| "chat_only".to_string()),
            ),
        ),
        Intent::Ask { .. } => (
            RunMode::PlanOnly,
            Some(
                requested_purpose
                    .map(str::to_string)
                    .unwrap_or_else(|| "clarify".to_string()),
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astra_types::IntentKind;

    fn chat_config() -> ChatConfig {
        ChatConfig::from_env()
    }

    #[test]
    fn short_plain_query_is_fast_chat() {
        assert!(is_fast_chat_candidate("2+2?", false, &chat_config()));
        assert!(is_fast_chat_candidate("как дела", false, &chat_config()));
    }

    #[test]
    fn action_and_memory_cues_block_fast_chat() {
        let config = chat_config();
        assert!(!is_fast_chat_candidate("открой браузер", false, &config));
        assert!(!is_fast_chat_candidate("запомни: меня зовут Ира", false, &config));
        assert!(!is_fast_chat_candidate("2+2?", true, &config));
    }

    #[test]
    fn semantic_payload_parses_act_hint() {
        let decision = parse_semantic_payload(
            &json!({
                "intent": "ACT",
                "confidence": 0.9,
                "reasons": ["action verbs"],
                "suggested_run_mode": "execute_confirm",
                "danger_flags": ["delete_file"],
                "target": "finder",
                "plan_hint": ["COMPUTER_ACTIONS"],
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(decision.intent.kind(), IntentKind::Act);
        let hint = decision.intent.act_hint().unwrap();
        assert_eq!(hint.suggested_run_mode, Some(RunMode::ExecuteConfirm));
        assert_eq!(hint.danger_flags, vec!["delete_file".to_string()]);
        assert_eq!(decision.plan_hint, vec![StepKind::ComputerActions]);
    }

    #[test]
    fn chat_intent_forces_plan_only_with_chat_purpose() {
        let decision = fast_chat_decision();
        let (mode, purpose) = resolve_run_mode(&decision, RunMode::AutopilotSafe, None);
        assert_eq!(mode, RunMode::PlanOnly);
        assert_eq!(purpose.as_deref(), Some("chat_only"));
    }

    #[test]
    fn act_upgrades_to_execute_confirm_on_hint() {
        let decision = IntentDecision {
            intent: Intent::Act {
                act_hint: ActHint {
                    suggested_run_mode: Some(RunMode::ExecuteConfirm),
                    danger_flags: vec![],
                    target: None,
                },
            },
            confidence: 0.8,
            reasons: vec![],
            needs_clarification: false,
            plan_hint: vec![],
            memory_item: None,
            response_style_hint: None,
            user_visible_note: None,
            decision_path: DecisionPath::Semantic,
        };
        let (mode, _) = resolve_run_mode(&decision, RunMode::AutopilotSafe, None);
        assert_eq!(mode, RunMode::ExecuteConfirm);
    }

    #[test]
    fn resilience_decision_is_chat() {
        let decision = semantic_resilience_decision("connection_error");
        assert_eq!(decision.intent.kind(), IntentKind::Chat);
        assert_eq!(decision.decision_path, DecisionPath::SemanticResilience);
        assert!(decision.reasons.contains(&"connection_error".to_string()));
    }
}
