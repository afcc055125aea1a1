// Memory Interpreter
// Derives profile/preference/fact updates from the user turn via a strict
// JSON call. Interpretation never blocks the response; saves are async.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use astra_brain::{ChatMessage, LlmClient, LlmRequest};
use astra_types::{ChatTurn, UserMemory};

#[derive(Debug, Clone)]
pub struct MemoryInterpretationError {
    pub code: String,
}

impl std::fmt::Display for MemoryInterpretationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory interpretation failed: {}", self.code)
    }
}

impl std::error::Error for MemoryInterpretationError {}

#[derive(Debug, Clone, Default)]
pub struct MemoryInterpretation {
    pub should_store: bool,
    pub facts: Vec<Value>,
    pub preferences: Vec<Value>,
    pub possible_facts: Vec<Value>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub confidence: Option<f64>,
}

fn known_profile_payload(memories: &[UserMemory]) -> Value {
    let trimmed: Vec<Value> = memories
        .iter()
        .take(20)
        .map(|memory| {
            json!({
                "title": memory.title,
                "content": memory.content,
                "meta": { "summary": memory.meta.summary },
            })
        })
        .collect();
    json!({ "memories": trimmed })
}

pub async fn interpret_user_message_for_memory(
    llm: &Arc<dyn LlmClient>,
    query_text: &str,
    history: &[ChatTurn],
    memories: &[UserMemory],
    run_id: &str,
    qa_mode: bool,
) -> Result<MemoryInterpretation, MemoryInterpretationError> {
    let schema = json!({
        "type": "object",
        "properties": {
            "should_store": { "type": "boolean" },
            "facts": { "type": "array", "items": { "type": "object" } },
            "preferences": { "type": "array", "items": { "type": "object" } },
            "possible_facts": { "type": "array", "items": { "type": "object" } },
            "title": { "type": "string" },
            "summary": { "type": "string" },
            "confidence": { "type": "number" }
        },
        "required": ["should_store"]
    });
    let history_tail: Vec<Value> = history
        .iter()
        .rev()
        .take(8)
        .rev()
        .map(|turn| json!({ "role": turn.role, "content": turn.content }))
        .collect();
    let mut request = LlmRequest::new(
        "memory_interpret",
        vec![
            ChatMessage::system(
                "Определи, есть ли в сообщении владельца устойчивые факты или предпочтения для \
                 долгой памяти. Не выдумывай: бери только явное. Верни строго JSON по схеме.",
            ),
            ChatMessage::user(
                json!({
                    "message": query_text,
                    "history": history_tail,
                    "known_profile": known_profile_payload(memories),
                })
                .to_string(),
            ),
        ],
    );
    request.json_schema = Some(schema);
    request.max_tokens = Some(400);
    request.run_id = Some(run_id.to_string());
    request.qa_mode = qa_mode;

    let response = llm.call(request).await.map_err(|error| MemoryInterpretationError {
        code: error.error_type().to_string(),
    })?;
    if !response.is_ok() {
        return Err(MemoryInterpretationError {
            code: response
                .error_type
                .unwrap_or_else(|| "memory_interpreter_failed".to_string()),
        });
    }

    let payload: Value =
        serde_json::from_str(response.text.trim()).map_err(|_| MemoryInterpretationError {
            code: "memory_interpreter_invalid_json".to_string(),
        })?;

    let array = |key: &str| -> Vec<Value> {
        payload
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };

    Ok(MemoryInterpretation {
        should_store: payload
            .get("should_store")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        facts: array("facts"),
        preferences: array("preferences"),
        possible_facts: array("possible_facts"),
        title: payload
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string),
        summary: payload
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string),
        confidence: payload.get("confidence").and_then(Value::as_f64),
    })
}

/// Style hint derived from interpreted preferences, strongest signal first.
pub fn style_hint_from_interpretation(interpretation: &MemoryInterpretation) -> Option<String> {
    let mut hints: Vec<String> = Vec::new();
    for pref in &interpretation.preferences {
        let (Some(key), Some(value)) = (
            pref.get("key").and_then(Value::as_str),
            pref.get("value").and_then(Value::as_str),
        ) else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let hint = match key.as_str() {
            "style.brevity" if matches!(value.to_lowercase().as_str(), "short" | "brief" | "compact") => {
                "Отвечай коротко и по делу.".to_string()
            }
            "style.tone" => format!("Тон ответа: {}.", value),
            "user.addressing.preference" => {
                format!("Формат обращения к пользователю: {}.", value)
            }
            "response.format" => format!("Формат ответа: {}.", value),
            _ => continue,
        };
        if !hints.contains(&hint) {
            hints.push(hint);
        }
    }
    if hints.is_empty() {
        None
    } else {
        Some(hints.into_iter().take(3).collect::<Vec<_>>().join(" "))
    }
}

pub fn name_from_interpretation(interpretation: &MemoryInterpretation) -> Option<String> {
    for fact in &interpretation.facts {
        if fact.get("key").and_then(Value::as_str) == Some("user.name") {
            if let Some(value) = fact.get("value").and_then(Value::as_str) {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Save payload from an interpretation, if it asked to store anything.
pub fn memory_payload_from_interpretation(
    interpretation: &MemoryInterpretation,
) -> Option<Value> {
    if !interpretation.should_store {
        return None;
    }
    let summary = interpretation.summary.as_deref()?.trim();
    if summary.is_empty() {
        return None;
    }
    let title = interpretation
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or("Профиль пользователя");
    Some(json!({
        "content": summary,
        "origin": "auto",
        "memory_payload": {
            "title": title,
            "summary": summary,
            "confidence": interpretation.confidence,
            "facts": interpretation.facts,
            "preferences": interpretation.preferences,
            "possible_facts": interpretation.possible_facts,
        },
    }))
}

fn pair_key(item: &Value) -> Option<(String, String)> {
    Some((
        item.get("key")?.as_str()?.trim().to_lowercase(),
        item.get("value")?.as_str()?.trim().to_lowercase(),
    ))
}

fn merge_unique_items(left: &[Value], right: &[Value]) -> Vec<Value> {
    let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for item in left.iter().chain(right.iter()) {
        match pair_key(item) {
            Some(key) => {
                if seen.insert(key) {
                    merged.push(item.clone());
                }
            }
            None => merged.push(item.clone()),
        }
    }
    merged
}

/// Merge law: preference/fact lists dedup by (key, value) case-insensitive,
/// confidence takes the max, summaries concatenate up to 320 chars.
pub fn merge_memory_payloads(primary: Option<Value>, secondary: Option<Value>) -> Option<Value> {
    match (primary, secondary) {
        (None, None) => None,
        (Some(payload), None) | (None, Some(payload)) => Some(payload),
        (Some(primary), Some(secondary)) => {
            let primary_mp = primary.get("memory_payload").cloned().unwrap_or(Value::Null);
            let secondary_mp = secondary.get("memory_payload").cloned().unwrap_or(Value::Null);

            let list = |payload: &Value, key: &str| -> Vec<Value> {
                payload
                    .get(key)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
            };

            let facts = merge_unique_items(&list(&primary_mp, "facts"), &list(&secondary_mp, "facts"));
            let preferences = merge_unique_items(
                &list(&primary_mp, "preferences"),
                &list(&secondary_mp, "preferences"),
            );
            let possible_facts = merge_unique_items(
                &list(&primary_mp, "possible_facts"),
                &list(&secondary_mp, "possible_facts"),
            );

            let confidence = [
                primary_mp.get("confidence").and_then(Value::as_f64),
                secondary_mp.get("confidence").and_then(Value::as_f64),
            ]
            .into_iter()
            .flatten()
            .fold(None::<f64>, |acc, value| {
                Some(acc.map_or(value, |current| current.max(value)))
            });

            let summary_primary = primary_mp
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let summary_secondary = secondary_mp
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let mut summary = summary_primary.trim().to_string();
            if !summary_secondary.trim().is_empty() && summary_secondary.trim() != summary {
                if !summary.is_empty() {
                    summary.push(' ');
                }
                summary.push_str(summary_secondary.trim());
            }
            let summary: String = summary.chars().take(320).collect();

            let mut merged_mp = Map::new();
            merged_mp.insert(
                "title".to_string(),
                primary_mp
                    .get("title")
                    .cloned()
                    .or_else(|| secondary_mp.get("title").cloned())
                    .unwrap_or_else(|| json!("Профиль пользователя")),
            );
            merged_mp.insert("summary".to_string(), json!(summary));
            merged_mp.insert("confidence".to_string(), json!(confidence));
            merged_mp.insert("facts".to_string(), Value::Array(facts));
            merged_mp.insert("preferences".to_string(), Value::Array(preferences));
            merged_mp.insert("possible_facts".to_string(), Value::Array(possible_facts));

            Some(json!({
                "content": summary,
                "origin": primary.get("origin").cloned().unwrap_or_else(|| json!("auto")),
                "memory_payload": Value::Object(merged_mp),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(summary: &str, prefs: Vec<Value>, confidence: f64) -> Value {
        json!({
            "content": summary,
            "origin": "auto",
            "memory_payload": {
                "title": "Профиль пользователя",
                "summary": summary,
                "confidence": confidence,
                "facts": [],
                "preferences": prefs,
                "possible_facts": [],
            },
        })
    }

    #[test]
    fn merge_dedups_preferences_case_insensitive() {
        let left = payload(
            "Любит краткость",
            vec![json!({"key": "style.brevity", "value": "SHORT"})],
            0.5,
        );
        let right = payload(
            "Любит краткость и строгий тон",
            vec![
                json!({"key": "style.brevity", "value": "short"}),
                json!({"key": "style.tone", "value": "strict"}),
            ],
            0.8,
        );
        let merged = merge_memory_payloads(Some(left), Some(right)).unwrap();
        let mp = &merged["memory_payload"];
        assert_eq!(mp["preferences"].as_array().unwrap().len(), 2);
        assert_eq!(mp["confidence"], 0.8);
        let summary = mp["summary"].as_str().unwrap();
        assert!(summary.contains("краткость"));
        assert!(summary.chars().count() <= 320);
    }

    #[test]
    fn merge_passes_through_single_side() {
        let left = payload("Сводка", vec![], 0.4);
        let merged = merge_memory_payloads(Some(left.clone()), None).unwrap();
        assert_eq!(merged, left);
        assert!(merge_memory_payloads(None, None).is_none());
    }

    #[test]
    fn payload_requires_should_store_and_summary() {
        let interpretation = MemoryInterpretation {
            should_store: false,
            summary: Some("что-то".to_string()),
            ..MemoryInterpretation::default()
        };
        assert!(memory_payload_from_interpretation(&interpretation).is_none());

        let interpretation = MemoryInterpretation {
            should_store: true,
            summary: Some("Имя пользователя: Ира".to_string()),
            ..MemoryInterpretation::default()
        };
        let payload = memory_payload_from_interpretation(&interpretation).unwrap();
        assert_eq!(payload["memory_payload"]["title"], "Профиль пользователя");
    }

    #[test]
    fn style_hint_prefers_brevity() {
        let interpretation = MemoryInterpretation {
            should_store: true,
            preferences: vec![
                json!({"key": "style.brevity", "value": "short"}),
                json!({"key": "style.tone", "value": "дружелюбно"}),
            ],
            ..MemoryInterpretation::default()
        };
        let hint = style_hint_from_interpretation(&interpretation).unwrap();
        assert!(hint.starts_with("Отвечай коротко"));
        assert!(hint.contains("Тон ответа"));
    }
}
