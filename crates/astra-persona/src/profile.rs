// User-profile context assembled from long-term memories: profile block,
// style hints from stored preferences, user name extraction.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use astra_types::{ChatTurn, UserMemory};

use crate::tone::ToneAnalysis;

const SHORT_BREVITY_VALUES: &[&str] = &["short", "brief", "compact", "кратко", "коротко", "сжато"];
const STRICT_TONE_VALUES: &[&str] = &[
    "strict", "formal", "business", "строго", "строгий", "формально", "формальный", "деловой",
    "официальный", "официально", "сухой", "сухо",
];
const FRIENDLY_TONE_VALUES: &[&str] = &[
    "friendly", "warm", "casual", "дружелюбно", "дружелюбный", "дружественно", "тепло", "мягко",
    "по-дружески",
];

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)имя пользователя:\s*([A-Za-zА-Яа-яЁё-]{2,})").expect("name pattern")
});

fn summary_or_content(memory: &UserMemory) -> String {
    if let Some(summary) = &memory.meta.summary {
        if !summary.trim().is_empty() {
            return summary.trim().to_string();
        }
    }
    if !memory.content.trim().is_empty() {
        return memory.content.trim().to_string();
    }
    memory.title.clone().unwrap_or_default().trim().to_string()
}

fn extract_name_from_memories(memories: &[UserMemory]) -> Option<String> {
    for memory in memories {
        for fact in &memory.meta.facts {
            if fact.get("key").and_then(Value::as_str) == Some("user.name") {
                if let Some(value) = fact.get("value").and_then(Value::as_str) {
                    let value = value.trim();
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
        let text = summary_or_content(memory);
        if let Some(captures) = NAME_RE.captures(&text) {
            let value = captures[1].trim().to_string();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn normalized_value(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .replace('ё', "е")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn style_hint_from_preference(key: &str, value: &str) -> Option<String> {
    let key_norm = key.trim().to_lowercase();
    let value_clean = value.trim();
    let value_norm = normalized_value(value_clean);
    if value_clean.is_empty() {
        return None;
    }

    match key_norm.as_str() {
        "style.brevity" => {
            if SHORT_BREVITY_VALUES.contains(&value_norm.as_str()) {
                Some("Отвечай коротко и по делу.".to_string())
            } else {
                Some(format!("Уровень краткости: {}.", value_clean))
            }
        }
        "style.tone" => {
            if STRICT_TONE_VALUES.contains(&value_norm.as_str()) {
                Some("Стиль: строгий и точный, без лишней разговорности.".to_string())
            } else if FRIENDLY_TONE_VALUES.contains(&value_norm.as_str()) {
                Some("Стиль: дружелюбный и поддерживающий.".to_string())
            } else if value_norm == "supportive-direct" {
                Some("Тон ответа: поддерживающий и прямой.".to_string())
            } else if value_norm == "calm-supportive" {
                Some("Тон ответа: спокойный и поддерживающий.".to_string())
            } else if value_norm == "energetic-direct" {
                Some("Тон ответа: энергичный и прямой.".to_string())
            } else {
                Some(format!("Тон ответа: {}.", value_clean))
            }
        }
        "style.mirror_level" => match value_norm.as_str() {
            "low" => Some("Зеркалинг минимальный: акцент на точность.".to_string()),
            "high" => Some("Зеркалинг высокий: адаптируй ритм и лексику.".to_string()),
            "medium" => Some("Зеркалинг умеренный: деловой и человечный баланс.".to_string()),
            _ => None,
        },
        "user.addressing.preference" => {
            Some(format!("Формат обращения к пользователю: {}.", value_clean))
        }
        "response.format" => Some(format!("Формат ответа: {}.", value_clean)),
        _ => None,
    }
}

fn style_hints_from_memories(memories: &[UserMemory], limit: usize) -> Vec<String> {
    let mut hints = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for memory in memories {
        for pref in &memory.meta.preferences {
            let (Some(key), Some(value)) = (
                pref.get("key").and_then(Value::as_str),
                pref.get("value").and_then(Value::as_str),
            ) else {
                continue;
            };
            let Some(hint) = style_hint_from_preference(key, value) else {
                continue;
            };
            if !seen.insert(hint.clone()) {
                continue;
            }
            hints.push(hint);
            if hints.len() >= limit {
                return hints;
            }
        }
    }
    hints
}

pub fn build_profile_block(memories: &[UserMemory], max_items: usize, max_chars: usize) -> Option<String> {
    let mut lines = Vec::new();
    let mut total = 0;
    for memory in memories.iter().take(max_items) {
        let content = summary_or_content(memory);
        if content.is_empty() {
            continue;
        }
        let mut content = content.split_whitespace().collect::<Vec<_>>().join(" ");
        if content.chars().count() > 220 {
            content = content.chars().take(217).collect::<String>() + "...";
        }
        let line = format!("- {}", content);
        if total + line.chars().count() + 1 > max_chars {
            break;
        }
        total += line.chars().count() + 1;
        lines.push(line);
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

pub fn build_memory_dump_response(memories: &[UserMemory]) -> String {
    match build_profile_block(memories, 20, 1500) {
        Some(block) => format!("Вот что я помню о тебе:\n{}", block),
        None => "Пока ничего не помню о тебе. Можешь рассказать, как тебя называть или как тебе удобнее отвечать."
            .to_string(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileContext {
    pub profile_block: Option<String>,
    pub user_name: Option<String>,
    pub style_hints: Vec<String>,
}

pub fn build_user_profile_context(memories: &[UserMemory]) -> ProfileContext {
    ProfileContext {
        profile_block: build_profile_block(memories, 12, 1200),
        user_name: extract_name_from_memories(memories),
        style_hints: style_hints_from_memories(memories, 4),
    }
}

/// system + history tail + current user message, as plain turns the caller
/// maps into its LLM request type.
pub fn build_chat_messages(
    system_text: &str,
    history: &[ChatTurn],
    user_text: &str,
) -> Vec<ChatTurn> {
    let mut messages = vec![ChatTurn {
        role: "system".to_string(),
        content: system_text.to_string(),
    }];
    for turn in history {
        if matches!(turn.role.as_str(), "user" | "assistant") && !turn.content.is_empty() {
            messages.push(turn.clone());
        }
    }
    messages.push(ChatTurn::user(user_text));
    messages
}

fn safe_evidence(user_msg: &str, limit: usize) -> String {
    let compact = user_msg.split_whitespace().collect::<Vec<_>>().join(" ");
    compact.chars().take(limit).collect()
}

/// Memory payload derived from tone only, used when the interpreter produced
/// nothing and the turn still looks profile-worthy.
pub fn build_tone_profile_memory_payload(
    user_msg: &str,
    analysis: &ToneAnalysis,
    memories: &[UserMemory],
) -> Option<Value> {
    if !analysis.self_improve {
        return None;
    }
    let existing_pairs: std::collections::HashSet<(String, String)> = memories
        .iter()
        .flat_map(|memory| memory.meta.preferences.iter())
        .filter_map(|pref| {
            Some((
                pref.get("key")?.as_str()?.to_lowercase(),
                pref.get("value")?.as_str()?.to_lowercase(),
            ))
        })
        .collect();

    let candidates = vec![
        json!({
            "key": "persona.mode.primary",
            "value": analysis.primary_mode,
            "evidence": safe_evidence(user_msg, 220),
        }),
        json!({
            "key": "style.mirror_level",
            "value": analysis.mirror_level.as_str(),
            "evidence": safe_evidence(user_msg, 220),
        }),
    ];
    let fresh: Vec<Value> = candidates
        .into_iter()
        .filter(|pref| {
            let key = pref["key"].as_str().unwrap_or_default().to_lowercase();
            let value = pref["value"].as_str().unwrap_or_default().to_lowercase();
            !existing_pairs.contains(&(key, value))
        })
        .collect();
    if fresh.is_empty() {
        return None;
    }

    let summary = format!(
        "Тон: {}, зеркалинг {}, режимы {} + {}.",
        analysis.tone_type.as_str(),
        analysis.mirror_level.as_str(),
        analysis.primary_mode,
        analysis.supporting_mode
    );
    Some(json!({
        "content": summary,
        "origin": "auto",
        "memory_payload": {
            "title": "Профиль тона",
            "summary": summary,
            "confidence": analysis.intensity,
            "facts": [],
            "preferences": fresh,
            "possible_facts": [],
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use astra_types::MemoryMeta;

    fn memory_with_prefs(prefs: Vec<Value>) -> UserMemory {
        UserMemory {
            id: "m1".to_string(),
            title: Some("Профиль".to_string()),
            content: "Имя пользователя: Ира".to_string(),
            tags: vec![],
            pinned: false,
            source: "auto".to_string(),
            meta: MemoryMeta {
                summary: None,
                facts: vec![],
                preferences: prefs,
                possible_facts: vec![],
                confidence: None,
            },
            created_at: chrono::Utc::now(),
            is_deleted: false,
        }
    }

    #[test]
    fn name_is_extracted_from_content() {
        let memories = vec![memory_with_prefs(vec![])];
        let context = build_user_profile_context(&memories);
        assert_eq!(context.user_name.as_deref(), Some("Ира"));
        assert!(context.profile_block.is_some());
    }

    #[test]
    fn style_hints_dedup_and_translate() {
        let memories = vec![memory_with_prefs(vec![
            json!({"key": "style.brevity", "value": "short"}),
            json!({"key": "style.brevity", "value": "brief"}),
            json!({"key": "style.tone", "value": "strict"}),
        ])];
        let context = build_user_profile_context(&memories);
        assert_eq!(context.style_hints.len(), 2);
        assert_eq!(context.style_hints[0], "Отвечай коротко и по делу.");
    }

    #[test]
    fn chat_messages_wrap_history() {
        let history = vec![ChatTurn::user("привет"), ChatTurn::assistant("привет!")];
        let messages = build_chat_messages("система", &history, "как дела?");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[3].content, "как дела?");
    }

    #[test]
    fn memory_dump_handles_empty_profile() {
        let dump = build_memory_dump_response(&[]);
        assert!(dump.starts_with("Пока ничего не помню"));
    }
}
