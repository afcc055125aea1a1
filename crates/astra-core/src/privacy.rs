// Privacy Router
// Classifies and sanitizes context items before they can reach a model.
// The route is always LOCAL; a non-local endpoint in settings is a hard error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{AstraError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    UserPrompt,
    WebPageText,
    TelegramText,
    FileContent,
    AppUiText,
    ScreenshotText,
    SystemNote,
    InternalSummary,
}

pub const ALL_SOURCE_TYPES: &[SourceType] = &[
    SourceType::UserPrompt,
    SourceType::WebPageText,
    SourceType::TelegramText,
    SourceType::FileContent,
    SourceType::AppUiText,
    SourceType::ScreenshotText,
    SourceType::SystemNote,
    SourceType::InternalSummary,
];

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserPrompt => "user_prompt",
            Self::WebPageText => "web_page_text",
            Self::TelegramText => "telegram_text",
            Self::FileContent => "file_content",
            Self::AppUiText => "app_ui_text",
            Self::ScreenshotText => "screenshot_text",
            Self::SystemNote => "system_note",
            Self::InternalSummary => "internal_summary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Public,
    Personal,
    Financial,
    Confidential,
}

pub const ALL_SENSITIVITIES: &[Sensitivity] = &[
    Sensitivity::Public,
    Sensitivity::Personal,
    Sensitivity::Financial,
    Sensitivity::Confidential,
];

impl Sensitivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Personal => "personal",
            Self::Financial => "financial",
            Self::Confidential => "confidential",
        }
    }
}

/// A labeled chunk of context headed for a model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: Value,
    pub source_type: SourceType,
    pub sensitivity: Sensitivity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl ContextItem {
    pub fn text(content: impl Into<String>, source_type: SourceType, sensitivity: Sensitivity) -> Self {
        Self {
            content: Value::String(content.into()),
            source_type,
            sensitivity,
            provenance: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFlags {
    pub strict_local: bool,
    pub max_item_chars: usize,
}

impl Default for PolicyFlags {
    fn default() -> Self {
        Self {
            strict_local: true,
            max_item_chars: 2000,
        }
    }
}

impl PolicyFlags {
    pub fn from_settings(settings: &Value) -> Self {
        let cfg = settings
            .get("privacy")
            .or_else(|| settings.get("routing"))
            .cloned()
            .unwrap_or(Value::Null);
        Self {
            strict_local: cfg
                .get("strict_local")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            max_item_chars: cfg
                .get("max_item_chars")
                .and_then(Value::as_u64)
                .unwrap_or(2000) as usize,
        }
    }
}

/// The kernel routes exactly one way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    Local,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        "LOCAL"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub route: Route,
    pub reason: &'static str,
    pub redaction_plan: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizationResult {
    pub items: Vec<ContextItem>,
    pub removed_counts_by_source: BTreeMap<&'static str, usize>,
    pub redacted_count: usize,
    pub total_chars: usize,
    pub truncated: bool,
}

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r#"(?i)(api[_-]?key|token|secret|password|passphrase)\s*[:=]\s*[^\s"']+"#)
            .expect("secret assignment pattern"),
        Regex::new(r"(?i)bearer\s+[A-Za-z0-9\-\._~\+/]+=*").expect("bearer pattern"),
        Regex::new(r"sk-[A-Za-z0-9]{10,}").expect("sk key pattern"),
    ]
});

fn redact_secrets(text: &str) -> (String, usize) {
    let mut value = text.to_string();
    let mut total = 0;
    for pattern in SECRET_PATTERNS.iter() {
        let count = pattern.find_iter(&value).count();
        if count > 0 {
            value = pattern.replace_all(&value, "[REDACTED]").into_owned();
            total += count;
        }
    }
    (value, total)
}

fn estimate_length(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Object(map) => map.values().map(estimate_length).sum(),
        Value::Array(items) => items.iter().map(estimate_length).sum(),
        Value::Null => 0,
        other => other.to_string().chars().count(),
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    value.chars().take(max_chars).collect()
}

fn sanitize_value(value: &Value, max_chars: usize) -> (Value, usize, bool) {
    match value {
        Value::String(s) => {
            let (redacted, count) = redact_secrets(s);
            let truncated = redacted.chars().count() > max_chars;
            (Value::String(truncate_chars(&redacted, max_chars)), count, truncated)
        }
        Value::Object(map) => {
            let mut redacted_total = 0;
            let mut truncated_any = false;
            let mut sanitized = serde_json::Map::new();
            for (key, item) in map {
                if let Value::String(s) = item {
                    let (redacted, count) = redact_secrets(s);
                    redacted_total += count;
                    truncated_any = truncated_any || redacted.chars().count() > max_chars;
                    sanitized.insert(key.clone(), Value::String(truncate_chars(&redacted, max_chars)));
                } else {
                    sanitized.insert(key.clone(), item.clone());
                }
            }
            (Value::Object(sanitized), redacted_total, truncated_any)
        }
        Value::Array(items) => {
            let mut redacted_total = 0;
            let mut truncated_any = false;
            let mut sanitized = Vec::with_capacity(items.len());
            for item in items {
                if let Value::String(s) = item {
                    let (redacted, count) = redact_secrets(s);
                    redacted_total += count;
                    truncated_any = truncated_any || redacted.chars().count() > max_chars;
                    sanitized.push(Value::String(truncate_chars(&redacted, max_chars)));
                } else {
                    sanitized.push(item.clone());
                }
            }
            (Value::Array(sanitized), redacted_total, truncated_any)
        }
        other => (other.clone(), 0, false),
    }
}

/// Drop disallowed item classes, redact secrets, truncate per-item content.
pub fn sanitize_context_items(
    items: &[ContextItem],
    allow_financial_file: bool,
    flags: &PolicyFlags,
) -> SanitizationResult {
    let mut removed_counts: BTreeMap<&'static str, usize> = ALL_SOURCE_TYPES
        .iter()
        .map(|ty| (ty.as_str(), 0))
        .collect();
    let mut sanitized_items = Vec::new();
    let mut redacted_total = 0;
    let mut total_chars = 0;
    let mut truncated_any = false;

    for item in items {
        if matches!(item.source_type, SourceType::TelegramText | SourceType::ScreenshotText) {
            *removed_counts.entry(item.source_type.as_str()).or_default() += 1;
            continue;
        }
        if item.source_type == SourceType::FileContent
            && item.sensitivity == Sensitivity::Financial
            && !allow_financial_file
        {
            *removed_counts.entry(item.source_type.as_str()).or_default() += 1;
            continue;
        }

        let (content, redacted, truncated) = sanitize_value(&item.content, flags.max_item_chars);
        redacted_total += redacted;
        truncated_any = truncated_any || truncated;

        let item_len = estimate_length(&content);
        if item_len == 0 {
            *removed_counts.entry(item.source_type.as_str()).or_default() += 1;
            continue;
        }

        total_chars += item_len;
        sanitized_items.push(ContextItem {
            content,
            source_type: item.source_type,
            sensitivity: item.sensitivity,
            provenance: item.provenance.clone(),
        });
    }

    SanitizationResult {
        items: sanitized_items,
        removed_counts_by_source: removed_counts,
        redacted_count: redacted_total,
        total_chars,
        truncated: truncated_any,
    }
}

/// Audit summary by source type and sensitivity.
pub fn summarize_items(items: &[ContextItem]) -> Value {
    let mut by_source: BTreeMap<&'static str, usize> = ALL_SOURCE_TYPES
        .iter()
        .map(|ty| (ty.as_str(), 0))
        .collect();
    let mut by_sensitivity: BTreeMap<&'static str, usize> = ALL_SENSITIVITIES
        .iter()
        .map(|s| (s.as_str(), 0))
        .collect();
    for item in items {
        *by_source.entry(item.source_type.as_str()).or_default() += 1;
        *by_sensitivity.entry(item.sensitivity.as_str()).or_default() += 1;
    }
    serde_json::json!({
        "by_source_type": by_source,
        "by_sensitivity": by_sensitivity,
    })
}

pub fn decide_route(items: &[ContextItem], flags: &PolicyFlags) -> RoutingDecision {
    if flags.strict_local {
        return RoutingDecision {
            route: Route::Local,
            reason: "strict_local",
            redaction_plan: serde_json::json!({}),
        };
    }
    if items.iter().any(|item| item.source_type == SourceType::TelegramText) {
        return RoutingDecision {
            route: Route::Local,
            reason: "telegram_text_present",
            redaction_plan: serde_json::json!({ "drop": ["telegram_text"] }),
        };
    }
    if items.iter().any(|item| item.source_type == SourceType::ScreenshotText) {
        return RoutingDecision {
            route: Route::Local,
            reason: "screenshot_text_present",
            redaction_plan: serde_json::json!({ "drop": ["screenshot_text"] }),
        };
    }
    RoutingDecision {
        route: Route::Local,
        reason: "default_local",
        redaction_plan: serde_json::json!({}),
    }
}

fn is_local_endpoint(raw: &str) -> bool {
    let Ok(parsed) = url::Url::parse(raw) else {
        return false;
    };
    matches!(
        parsed.host_str(),
        Some("localhost") | Some("127.0.0.1") | Some("::1") | Some("[::1]") | Some("0.0.0.0")
    )
}

/// Enforce that the configured LLM provider/endpoint is local-only.
pub fn resolve_llm_settings(settings: &Value) -> Result<Value> {
    let llm_local = settings
        .get("llm_local")
        .or_else(|| settings.get("llm"))
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    let provider = llm_local
        .get("provider")
        .and_then(Value::as_str)
        .unwrap_or("local")
        .trim()
        .to_lowercase();
    if !matches!(provider.as_str(), "local" | "ollama") {
        return Err(AstraError::Privacy(
            "only local LLM provider is supported".to_string(),
        ));
    }
    if let Some(endpoint) = llm_local
        .get("base_url")
        .or_else(|| llm_local.get("endpoint"))
        .and_then(Value::as_str)
    {
        if !is_local_endpoint(endpoint) {
            return Err(AstraError::Privacy(
                "only local LLM endpoint is allowed".to_string(),
            ));
        }
    }
    Ok(llm_local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drops_telegram_and_screenshot_items() {
        let items = vec![
            ContextItem::text("привет", SourceType::UserPrompt, Sensitivity::Personal),
            ContextItem::text("из телеграма", SourceType::TelegramText, Sensitivity::Personal),
            ContextItem::text("с экрана", SourceType::ScreenshotText, Sensitivity::Personal),
        ];
        let result = sanitize_context_items(&items, false, &PolicyFlags::default());
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.removed_counts_by_source["telegram_text"], 1);
        assert_eq!(result.removed_counts_by_source["screenshot_text"], 1);
    }

    #[test]
    fn financial_file_content_requires_allow() {
        let item = ContextItem::text("выписка по счёту", SourceType::FileContent, Sensitivity::Financial);
        let dropped = sanitize_context_items(std::slice::from_ref(&item), false, &PolicyFlags::default());
        assert!(dropped.items.is_empty());

        let allowed = sanitize_context_items(&[item], true, &PolicyFlags::default());
        assert_eq!(allowed.items.len(), 1);
    }

    #[test]
    fn redaction_leaves_no_secret_substrings() {
        let item = ContextItem::text(
            "config: api_key=abcd1234 then Bearer xyzToken987 and sk-abcdefghij1234",
            SourceType::UserPrompt,
            Sensitivity::Personal,
        );
        let result = sanitize_context_items(&[item], false, &PolicyFlags::default());
        let text = result.items[0].content.as_str().unwrap();
        assert!(result.redacted_count >= 3);
        for pattern in SECRET_PATTERNS.iter() {
            assert!(!pattern.is_match(text), "pattern still matches: {}", text);
        }
        assert!(text.contains("[REDACTED]"));
    }

    #[test]
    fn items_are_truncated_to_cap() {
        let flags = PolicyFlags {
            strict_local: true,
            max_item_chars: 5,
        };
        let item = ContextItem::text("длинный текст", SourceType::UserPrompt, Sensitivity::Public);
        let result = sanitize_context_items(&[item], false, &flags);
        assert!(result.truncated);
        assert_eq!(result.items[0].content.as_str().unwrap().chars().count(), 5);
    }

    #[test]
    fn route_is_always_local() {
        let flags = PolicyFlags {
            strict_local: false,
            max_item_chars: 2000,
        };
        let items = vec![ContextItem::text("из телеграма", SourceType::TelegramText, Sensitivity::Personal)];
        let decision = decide_route(&items, &flags);
        assert_eq!(decision.route, Route::Local);
        assert_eq!(decision.reason, "telegram_text_present");

        let strict = decide_route(&[], &PolicyFlags::default());
        assert_eq!(strict.reason, "strict_local");
    }

    #[test]
    fn non_local_endpoint_is_rejected() {
        let settings = json!({ "llm_local": { "provider": "ollama", "base_url": "https://api.example.com" } });
        assert!(resolve_llm_settings(&settings).is_err());

        let local = json!({ "llm_local": { "provider": "local", "base_url": "http://127.0.0.1:11434" } });
        assert!(resolve_llm_settings(&local).is_ok());

        let cloud = json!({ "llm": { "provider": "openai" } });
        assert!(resolve_llm_settings(&cloud).is_err());
    }
}
