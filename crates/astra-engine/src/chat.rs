// Chat guard loop. A draft that is empty, off-topic, in the wrong language,
// truncated, or opens with refusal boilerplate gets one targeted remediation
// per reason before the loop gives up with a guard text or degraded answer.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use astra_brain::{BrainError, ChatMessage, LlmClient, LlmRequest, LlmResponse};
use astra_persona::relevance::{self, CYRILLIC_RE};

use crate::intent::{FAST_CHAT_ACTION_RE, FAST_CHAT_MEMORY_RE};

pub const SOFT_RETRY_PROMPT: &str =
    "Продолжи ответ точно по запросу владельца, полностью и без добавлений.";
pub const SOFT_RETRY_PROMPT_LANG_RU: &str =
    "Перепиши ответ полностью на русском языке, строго по запросу владельца, без добавлений и без английских вставок.";
pub const SOFT_RETRY_PROMPT_OFF_TOPIC: &str =
    "Ответ не по теме. Ответь строго на вопрос владельца, по существу, без смены темы и без лишних отступлений.";

const UNWANTED_PREFIXES: &[&str] = &[
    "как ии",
    "как ai",
    "как языков",
    "извините",
    "я не могу",
    "я не должен",
    "против правил",
    "это нарушает",
    "согласно политике",
    "ограничения безопасности",
];

static FIRST_PERSON_RU_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(я|мне|меня|мой|моя|моё|мои|мною)\b").expect("first person pattern")
});
static FIRST_PERSON_NARRATIVE_RU_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(был|была|было|попал|попала|пришел|пришла|думал|думала|вспомнил|вспомнила|расскажу)\b")
        .expect("first person narrative pattern")
});
static INFO_QUERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)\b(кто|что|где|когда|почему|зачем|как|сколько|какой|какая|какие|чей|чья|чьи|",
        r"знаешь|знаете|расскажи|объясни|объяснить|сюжет|история|факт|факты|",
        r"who|what|where|when|why|how|explain|tell|fact|facts)\b"
    ))
    .expect("info query pattern")
});
static UNCERTAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)\b(не знаю|не уверен|не слышал|не слышала|не помню|не могу подтвердить|",
        r"возможно|наверное|предполагаю|скорее всего|может быть|",
        r"not sure|i don't know|i am not sure|maybe|probably|i guess|i think)\b"
    ))
    .expect("uncertain pattern")
});

const AUTO_WEB_RESEARCH_ERROR_CODES: &[&str] = &[
    "chat_empty_response",
    "connection_error",
    "http_error",
    "invalid_json",
    "model_not_found",
    "chat_llm_unhandled_error",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardReason {
    UnwantedPrefix,
    RuLanguageMismatch,
    OffTopic,
    Truncated,
}

impl GuardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnwantedPrefix => "unwanted_prefix",
            Self::RuLanguageMismatch => "ru_language_mismatch",
            Self::OffTopic => "off_topic",
            Self::Truncated => "truncated",
        }
    }
}

pub fn is_likely_truncated_response(text: &str) -> bool {
    let stripped = text.trim();
    if stripped.is_empty() {
        return true;
    }
    const TRAILING: &[&str] = &["...", "…", ":", ";", ",", "(", "[", "{", "—", "-"];
    if TRAILING.iter().any(|suffix| stripped.ends_with(suffix)) {
        return true;
    }
    stripped.matches("```").count() % 2 == 1
}

pub fn is_ru_language_mismatch(user_text: &str, response_text: &str) -> bool {
    if user_text.trim().is_empty() || response_text.trim().is_empty() {
        return false;
    }
    if !CYRILLIC_RE.is_match(user_text) {
        return false;
    }
    !CYRILLIC_RE.is_match(response_text)
}

fn is_unprompted_first_person_narrative(user_text: &str, response_text: &str) -> bool {
    if response_text.trim().is_empty() {
        return false;
    }
    if FIRST_PERSON_RU_RE.is_match(user_text) {
        return false;
    }
    if !FIRST_PERSON_RU_RE.is_match(response_text) {
        return false;
    }
    FIRST_PERSON_NARRATIVE_RU_RE.is_match(response_text)
}

fn has_unwanted_prefix(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    UNWANTED_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

pub fn soft_retry_reason(user_text: &str, text: &str) -> Option<GuardReason> {
    if has_unwanted_prefix(text) {
        return Some(GuardReason::UnwantedPrefix);
    }
    if is_ru_language_mismatch(user_text, text) {
        return Some(GuardReason::RuLanguageMismatch);
    }
    if is_unprompted_first_person_narrative(user_text, text) {
        return Some(GuardReason::OffTopic);
    }
    if relevance::is_likely_off_topic(user_text, text) {
        return Some(GuardReason::OffTopic);
    }
    if is_likely_truncated_response(text) {
        return Some(GuardReason::Truncated);
    }
    None
}

fn soft_retry_prompt(reason: GuardReason) -> &'static str {
    match reason {
        GuardReason::RuLanguageMismatch => SOFT_RETRY_PROMPT_LANG_RU,
        GuardReason::OffTopic => SOFT_RETRY_PROMPT_OFF_TOPIC,
        _ => SOFT_RETRY_PROMPT,
    }
}

pub fn off_topic_guard_text(user_text: &str) -> String {
    let query = user_text.split_whitespace().collect::<Vec<_>>().join(" ");
    if query.is_empty() {
        return "Ответ ушёл от темы. Повтори вопрос одним предложением, отвечу строго по сути."
            .to_string();
    }
    format!(
        "Понял запрос: «{}». Предыдущий ответ вышел не по теме. \
         Могу дать короткий или подробный ответ строго по этому вопросу.",
        query
    )
}

/// User-visible text for an unrecoverable chat failure.
pub fn chat_resilience_text(error_type: Option<&str>) -> String {
    match error_type {
        Some("budget_exceeded") => {
            "Лимит обращений к модели исчерпан для этого запуска. Попробуй ещё раз чуть позже."
        }
        Some("missing_api_key") => "Облачная модель недоступна: не задан OPENAI_API_KEY.",
        Some(code)
            if code.contains("llm_call_failed")
                || matches!(
                    code,
                    "model_not_found"
                        | "http_error"
                        | "connection_error"
                        | "invalid_json"
                        | "chat_empty_response"
                ) =>
        {
            "Локальная модель сейчас недоступна. Проверь Ollama и выбранную модель, затем повтори запрос."
        }
        _ => "Не удалось получить ответ модели. Повтори запрос.",
    }
    .to_string()
}

// ============================================================================
// Soft-retry wrapper
// ============================================================================

async fn call_chat_base_fallback(
    llm: &Arc<dyn LlmClient>,
    request: &LlmRequest,
) -> Option<LlmResponse> {
    // Switch purpose so the router picks the base chat model instead of the
    // tiered fast/complex model.
    let mut fallback_request = request.clone();
    fallback_request.purpose = "chat_response_base_fallback".to_string();
    match llm.call(fallback_request).await {
        Ok(response) if response.is_ok() && !response.text.trim().is_empty() => Some(response),
        _ => None,
    }
}

async fn retry_off_topic_with_min_prompt(
    llm: &Arc<dyn LlmClient>,
    request: &LlmRequest,
    user_text: &str,
) -> Option<LlmResponse> {
    if user_text.trim().is_empty() {
        return None;
    }
    let mut focused_request = request.clone();
    focused_request.purpose = "chat_response_base_fallback".to_string();
    focused_request.messages = vec![
        ChatMessage::system(
            "Ответь строго по вопросу пользователя. Без смены темы, без мета-комментариев. \
             Если не знаешь точный ответ, честно скажи это и попроси уточнение.",
        ),
        ChatMessage::user(user_text.trim().to_string()),
    ];
    match llm.call(focused_request).await {
        Ok(response)
            if response.is_ok()
                && !response.text.trim().is_empty()
                && soft_retry_reason(user_text, &response.text) != Some(GuardReason::OffTopic) =>
        {
            Some(response)
        }
        _ => None,
    }
}

async fn rewrite_response_in_russian(
    llm: &Arc<dyn LlmClient>,
    request: &LlmRequest,
    user_text: &str,
    draft_text: &str,
) -> Option<LlmResponse> {
    let mut rewrite_request = request.clone();
    rewrite_request.purpose = "chat_response_base_fallback".to_string();
    rewrite_request.messages = vec![
        ChatMessage::system(
            "Ты редактор ответа ассистента. Перепиши ответ строго на русском языке, \
             без английских вставок и без добавления новых фактов. \
             Верни только итоговый ответ без заголовков, без префиксов и без служебных пометок.",
        ),
        ChatMessage::user(format!(
            "[Запрос пользователя]\n{}\n\n[Черновик ответа]\n{}\n\n\
             Сделай итоговый ответ полностью на русском языке и выведи только финальный текст.",
            user_text.trim(),
            draft_text.trim()
        )),
    ];
    match llm.call(rewrite_request).await {
        Ok(response)
            if response.is_ok()
                && !response.text.trim().is_empty()
                && CYRILLIC_RE.is_match(&response.text) =>
        {
            Some(response)
        }
        _ => None,
    }
}

/// Call the brain and remediate guard failures in reason order; never more
/// than one remediation loop per reason.
pub async fn call_chat_with_soft_retry(
    llm: &Arc<dyn LlmClient>,
    request: LlmRequest,
) -> Result<LlmResponse, BrainError> {
    let response = llm.call(request.clone()).await?;
    if !response.is_ok() {
        return Ok(response);
    }

    if response.text.trim().is_empty() {
        return Ok(call_chat_base_fallback(llm, &request)
            .await
            .unwrap_or(response));
    }

    let user_text = request.last_user_message();
    let Some(reason) = soft_retry_reason(&user_text, &response.text) else {
        return Ok(response);
    };

    if reason == GuardReason::OffTopic {
        if let Some(focused) = retry_off_topic_with_min_prompt(llm, &request, &user_text).await {
            return Ok(focused);
        }
    }

    if reason == GuardReason::RuLanguageMismatch {
        if let Some(rewritten) =
            rewrite_response_in_russian(llm, &request, &user_text, &response.text).await
        {
            return Ok(rewritten);
        }
    }

    // Continuation retry: append the draft and ask for a clean completion.
    let mut retry_request = request.clone();
    retry_request
        .messages
        .push(ChatMessage::assistant(response.text.clone()));
    retry_request
        .messages
        .push(ChatMessage::user(soft_retry_prompt(reason).to_string()));
    let retry_response = match llm.call(retry_request).await {
        Ok(retry_response) => retry_response,
        Err(_) => response.clone(),
    };

    if retry_response.is_ok() && !retry_response.text.trim().is_empty() {
        if reason == GuardReason::OffTopic
            && soft_retry_reason(&user_text, &retry_response.text) == Some(GuardReason::OffTopic)
        {
            if let Some(fallback) = call_chat_base_fallback(llm, &request).await {
                if soft_retry_reason(&user_text, &fallback.text) != Some(GuardReason::OffTopic) {
                    return Ok(fallback);
                }
            }
            let mut guarded = retry_response;
            guarded.text = off_topic_guard_text(&user_text);
            return Ok(guarded);
        }
        return Ok(retry_response);
    }

    match call_chat_base_fallback(llm, &request).await {
        Some(fallback) => Ok(fallback),
        None if reason == GuardReason::OffTopic => {
            let mut guarded = response;
            guarded.text = off_topic_guard_text(&user_text);
            Ok(guarded)
        }
        None => Ok(response),
    }
}

// ============================================================================
// Auto web research decision
// ============================================================================

pub fn is_information_query(user_text: &str) -> bool {
    let query = user_text.trim();
    if query.is_empty() {
        return false;
    }
    if FAST_CHAT_ACTION_RE.is_match(query) || FAST_CHAT_MEMORY_RE.is_match(query) {
        return false;
    }
    if query.contains('?') {
        return true;
    }
    if INFO_QUERY_RE.is_match(query) {
        return true;
    }
    query.split_whitespace().count() >= 7
}

pub fn is_uncertain_response(text: &str) -> bool {
    let value = text.trim();
    if value.is_empty() {
        return true;
    }
    let lowered = value.to_lowercase();
    if lowered.contains("предыдущий ответ вышел не по теме") {
        return true;
    }
    UNCERTAIN_RE.is_match(&lowered)
}

/// Whether the auto web research sub-pipeline should run, and why.
pub fn auto_web_research_decision(
    enabled: bool,
    user_text: &str,
    response_text: &str,
    error_type: Option<&str>,
) -> (bool, &'static str) {
    if !enabled {
        return (false, "disabled");
    }
    if !is_information_query(user_text) {
        return (false, "not_information_query");
    }
    if let Some(code) = error_type {
        if AUTO_WEB_RESEARCH_ERROR_CODES.contains(&code) {
            return (true, "provider_error");
        }
    }
    let answer = response_text.trim();
    if answer.is_empty() {
        return (true, "empty_response");
    }
    if matches!(
        soft_retry_reason(user_text, answer),
        Some(GuardReason::OffTopic) | Some(GuardReason::RuLanguageMismatch)
    ) {
        return (true, "guarded_response");
    }
    if is_uncertain_response(answer) {
        return (true, "uncertain_response");
    }
    (false, "confident_response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_detector_catches_tails_and_fences() {
        assert!(is_likely_truncated_response("ответ обрывается на полуслове,"));
        assert!(is_likely_truncated_response("вот код: ```rust"));
        assert!(is_likely_truncated_response(""));
        assert!(!is_likely_truncated_response("Полный ответ."));
    }

    #[test]
    fn language_mismatch_requires_cyrillic_query() {
        assert!(is_ru_language_mismatch("кто такой кен канеки", "He is an anime character."));
        assert!(!is_ru_language_mismatch("who is kaneki", "He is an anime character."));
        assert!(!is_ru_language_mismatch("кто такой кен канеки", "Кен Канеки — герой аниме."));
    }

    #[test]
    fn refusal_prefix_is_flagged_first() {
        let reason = soft_retry_reason("расскажи сюжет", "Извините, я не могу это обсуждать.");
        assert_eq!(reason, Some(GuardReason::UnwantedPrefix));
    }

    #[test]
    fn unprompted_first_person_story_counts_as_off_topic() {
        let reason = soft_retry_reason(
            "объясни устройство двигателя автомобиля",
            "Я вспомнил как был молодым и попал в гараж, расскажу историю из жизни про своего деда и его машину",
        );
        assert_eq!(reason, Some(GuardReason::OffTopic));
    }

    #[test]
    fn guard_text_quotes_the_query() {
        let text = off_topic_guard_text("  какие   новости  по  openai ");
        assert!(text.contains("«какие новости по openai»"));
        assert!(text.contains("не по теме"));
    }

    #[test]
    fn information_query_detection() {
        assert!(is_information_query("Какие последние новости по OpenAI сегодня?"));
        assert!(is_information_query("расскажи сюжет токийского гуля"));
        assert!(!is_information_query("открой браузер"));
        assert!(!is_information_query("запомни меня зовут Ира"));
    }

    #[test]
    fn uncertain_response_detection() {
        assert!(is_uncertain_response("Не знаю точно, возможно появились новые обновления."));
        assert!(is_uncertain_response(""));
        assert!(!is_uncertain_response("OpenAI выпустила новую модель вчера."));
    }

    #[test]
    fn auto_research_triggers_on_uncertain_answer() {
        let (go, reason) = auto_web_research_decision(
            true,
            "Какие последние новости по OpenAI сегодня?",
            "Не знаю точно, возможно появились новые обновления.",
            None,
        );
        assert!(go);
        assert_eq!(reason, "uncertain_response");
    }

    #[test]
    fn auto_research_skips_confident_and_non_info() {
        let (go, _) = auto_web_research_decision(
            true,
            "Какие последние новости по OpenAI сегодня?",
            "Сегодня OpenAI опубликовала последние новости: вышло обновление моделей и снижены цены API.",
            None,
        );
        assert!(!go);

        let (go, reason) = auto_web_research_decision(true, "открой браузер", "", None);
        assert!(!go);
        assert_eq!(reason, "not_information_query");

        let (go, reason) = auto_web_research_decision(false, "кто такой кен канеки?", "", None);
        assert!(!go);
        assert_eq!(reason, "disabled");
    }

    #[test]
    fn auto_research_triggers_on_provider_errors() {
        let (go, reason) = auto_web_research_decision(
            true,
            "Какие последние новости по OpenAI сегодня?",
            "",
            Some("connection_error"),
        );
        assert!(go);
        assert_eq!(reason, "provider_error");
    }
}
