// Memory-save skill: turns a merged memory payload into a user memory row.
// Used by the async chat save path and the MEMORY_COMMIT plan step.

use async_trait::async_trait;
use serde_json::{json, Value};

use astra_core::AstraError;
use astra_types::{MemoryMeta, SkillEvent, SkillResult};

use crate::{Skill, SkillContext, SkillError};

pub struct MemorySaveSkill;

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Skill for MemorySaveSkill {
    fn name(&self) -> &'static str {
        "memory_save"
    }

    async fn run(&self, inputs: Value, ctx: &SkillContext) -> Result<SkillResult, SkillError> {
        let content = inputs
            .get("content")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| SkillError::InvalidInputs("content is required".to_string()))?;
        let origin = inputs
            .get("origin")
            .and_then(Value::as_str)
            .unwrap_or("auto");
        let tags = string_list(inputs.get("tags"));

        let payload = inputs.get("memory_payload").cloned().unwrap_or(Value::Null);
        let title = payload
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|title| !title.is_empty());
        let meta = MemoryMeta {
            summary: payload
                .get("summary")
                .and_then(Value::as_str)
                .map(str::to_string),
            facts: payload
                .get("facts")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            preferences: payload
                .get("preferences")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            possible_facts: payload
                .get("possible_facts")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            confidence: payload.get("confidence").and_then(Value::as_f64),
        };

        let memory = match ctx
            .store
            .create_user_memory(title, content, &tags, origin, Some(meta))
            .await
        {
            Ok(memory) => memory,
            Err(AstraError::Validation(code)) if code == "content_too_long" => {
                return Err(SkillError::InvalidInputs("content_too_long".to_string()));
            }
            Err(error) => return Err(error.into()),
        };

        Ok(SkillResult {
            what_i_did: "Сохранил запись в долгую память.".to_string(),
            sources: vec![],
            facts: vec![],
            artifacts: vec![],
            confidence: memory.meta.confidence.unwrap_or(0.6),
            assumptions: vec![],
            events: vec![SkillEvent {
                message: "Память обновлена".to_string(),
                phase: Some("memory_saved".to_string()),
                reason_code: None,
                payload: json!({ "memory_id": memory.id, "title": memory.title }),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use astra_core::SqliteStore;
    use astra_types::{PlanStep, Run, RunMode, RunStatus, StepKind, StepStatus, Task, TaskStatus};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn test_ctx(store: Arc<SqliteStore>) -> SkillContext {
        let run = Run {
            id: "run-1".to_string(),
            project_id: "p-1".to_string(),
            query_text: "запомни: меня зовут Ира".to_string(),
            mode: RunMode::PlanOnly,
            purpose: None,
            parent_run_id: None,
            status: RunStatus::Running,
            meta: json!({}),
            created_at: chrono::Utc::now(),
        };
        let step = PlanStep {
            id: "step-1".to_string(),
            run_id: "run-1".to_string(),
            step_index: 0,
            kind: StepKind::MemoryCommit,
            skill_name: "memory_save".to_string(),
            title: None,
            inputs: json!({}),
            depends_on: vec![],
            status: StepStatus::Running,
            success_criteria: None,
            danger_flags: vec![],
            requires_approval: false,
            artifacts_expected: vec![],
        };
        let task = Task {
            id: "task-1".to_string(),
            run_id: "run-1".to_string(),
            step_id: "step-1".to_string(),
            attempt: 1,
            status: TaskStatus::Running,
            created_at: chrono::Utc::now(),
        };
        SkillContext {
            run,
            step,
            task,
            settings: json!({}),
            base_dir: PathBuf::from("."),
            store,
        }
    }

    #[tokio::test]
    async fn saves_memory_with_payload_meta() {
        let store = Arc::new(SqliteStore::open_in_memory(4000).unwrap());
        let ctx = test_ctx(store.clone());
        let skill = MemorySaveSkill;

        let result = skill
            .run(
                json!({
                    "content": "Зовут Ира, любит краткие ответы",
                    "origin": "auto",
                    "memory_payload": {
                        "title": "Профиль пользователя",
                        "summary": "Имя пользователя: Ира",
                        "confidence": 0.8,
                        "facts": [{ "key": "user.name", "value": "Ира" }],
                        "preferences": [{ "key": "style.brevity", "value": "short" }],
                        "possible_facts": [],
                    },
                }),
                &ctx,
            )
            .await
            .unwrap();

        assert!(result.confidence > 0.7);
        let memories = store.list_user_memories(10, None).await.unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].title.as_deref(), Some("Профиль пользователя"));
        assert_eq!(memories[0].meta.facts.len(), 1);
    }

    #[tokio::test]
    async fn oversized_content_maps_to_content_too_long() {
        let store = Arc::new(SqliteStore::open_in_memory(10).unwrap());
        let ctx = test_ctx(store);
        let skill = MemorySaveSkill;
        let err = skill
            .run(json!({ "content": "слишком длинное содержимое для памяти" }), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SkillError::InvalidInputs(ref code) if code == "content_too_long"));
    }
}
