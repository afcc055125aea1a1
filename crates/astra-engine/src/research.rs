// Auto web research glue for the chat loop: invoke the skill, persist its
// candidates with per-run dedup, relay progress events, and compose the
// user-facing text with a sources block.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};

use astra_core::{EventBus, SqliteStore};
use astra_types::{
    Artifact, EventLevel, EventType, PlanStep, Run, SkillResult, Source, StepKind, StepStatus,
    Task, TaskStatus,
};

use crate::chat::{soft_retry_reason, GuardReason};
use crate::error::Result;
use astra_skills::{Skill, SkillContext};

/// Insert the skill's sources and artifacts, deduping against the run's
/// existing records.
pub async fn persist_skill_result(
    store: &Arc<SqliteStore>,
    run_id: &str,
    result: &SkillResult,
) -> Result<()> {
    let now = Utc::now();
    let sources: Vec<Source> = result
        .sources
        .iter()
        .filter(|candidate| !candidate.url.trim().is_empty())
        .map(|candidate| Source {
            id: astra_types::new_id(),
            run_id: run_id.to_string(),
            url: candidate.url.trim().to_string(),
            title: candidate.title.clone(),
            domain: candidate.domain.clone(),
            quality: candidate.quality,
            retrieved_at: candidate.retrieved_at.unwrap_or(now),
            snippet: candidate.snippet.clone(),
            pinned: candidate.pinned,
        })
        .collect();
    if !sources.is_empty() {
        store.insert_sources(run_id, &sources).await?;
    }

    let artifacts: Vec<Artifact> = result
        .artifacts
        .iter()
        .filter(|candidate| !candidate.content_uri.trim().is_empty())
        .map(|candidate| Artifact {
            id: astra_types::new_id(),
            run_id: run_id.to_string(),
            artifact_type: candidate.artifact_type.clone(),
            title: candidate.title.clone(),
            content_uri: candidate.content_uri.trim().to_string(),
            created_at: candidate.created_at.unwrap_or(now),
            meta: candidate.meta.clone(),
        })
        .collect();
    if !artifacts.is_empty() {
        store.insert_artifacts(run_id, &artifacts).await?;
    }
    Ok(())
}

fn read_web_research_answer(result: &SkillResult, base_dir: &Path) -> String {
    let mut artifacts = result.artifacts.clone();
    artifacts.sort_by_key(|artifact| {
        if artifact.artifact_type == "web_research_answer_md" {
            0
        } else {
            1
        }
    });
    for artifact in artifacts {
        let uri = artifact.content_uri.trim();
        if uri.is_empty() {
            continue;
        }
        let path = PathBuf::from(uri);
        let path = if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        };
        if let Ok(text) = std::fs::read_to_string(&path) {
            let text = text.trim().to_string();
            if !text.is_empty() {
                return text;
            }
        }
    }
    String::new()
}

fn format_sources_block(result: &SkillResult, limit: usize) -> String {
    let mut lines = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for source in &result.sources {
        let url = source.url.trim();
        if url.is_empty() || !seen.insert(url.to_string()) {
            continue;
        }
        let label = source
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(url);
        lines.push(format!("- {} - {}", label, url));
        if lines.len() >= limit {
            break;
        }
    }
    lines.join("\n")
}

/// Answer text for chat: the artifact markdown (or the skill summary) plus a
/// sources block when the markdown does not already carry one.
pub fn compose_web_research_chat_text(result: &SkillResult, base_dir: &Path) -> String {
    let mut answer = read_web_research_answer(result, base_dir);
    if answer.is_empty() {
        let summary = result.what_i_did.trim();
        if !summary.is_empty() {
            answer = format!("{}\n\nЯ проверил источники и собрал данные из интернета.", summary);
        }
    }
    let sources_block = format_sources_block(result, 5);
    if !sources_block.is_empty() && !answer.to_lowercase().contains("источники:") && !answer.contains("## Источники")
    {
        answer = format!("{}\n\nИсточники:\n{}", answer.trim(), sources_block);
    }
    answer.trim().to_string()
}

pub struct AutoResearchOutcome {
    pub text: String,
    pub latency_ms: i64,
    pub sources_count: usize,
    pub confidence: f64,
}

async fn emit_progress(
    bus: &EventBus,
    run_id: &str,
    result: &SkillResult,
) -> Result<()> {
    for event in &result.events {
        if event.message.trim().is_empty() {
            continue;
        }
        let mut payload = event.payload.clone();
        if let Some(map) = payload.as_object_mut() {
            if let Some(phase) = &event.phase {
                map.insert("phase".to_string(), json!(phase));
            }
            if let Some(reason_code) = &event.reason_code {
                map.insert("reason_code".to_string(), json!(reason_code));
            }
        }
        bus.emit_info(run_id, EventType::TaskProgress, &event.message, payload)
            .await?;
    }
    Ok(())
}

/// Run the web-research skill for a chat turn whose model answer was not good
/// enough. Returns None whenever the pipeline cannot improve on the draft.
#[allow(clippy::too_many_arguments)]
pub async fn run_auto_web_research(
    store: &Arc<SqliteStore>,
    bus: &EventBus,
    skill: &Arc<dyn Skill>,
    run: &Run,
    settings: &Value,
    base_dir: &Path,
    query_text: &str,
    style_hint: Option<&str>,
    max_rounds: u32,
    max_sources: u32,
    max_pages: u32,
    depth: &str,
) -> Result<Option<AutoResearchOutcome>> {
    let query = query_text.trim();
    if query.is_empty() {
        return Ok(None);
    }

    // Synthetic step/task so skill attribution stays consistent.
    let step = PlanStep {
        id: format!("chat-web-research-step:{}", run.id),
        run_id: run.id.clone(),
        step_index: 0,
        kind: StepKind::WebResearch,
        skill_name: "web_research".to_string(),
        title: Some("Chat auto web research".to_string()),
        inputs: json!({}),
        depends_on: vec![],
        status: StepStatus::Running,
        success_criteria: None,
        danger_flags: vec![],
        requires_approval: false,
        artifacts_expected: vec![],
    };
    let task = Task {
        id: format!("chat-web-research-task:{}", run.id),
        run_id: run.id.clone(),
        step_id: step.id.clone(),
        attempt: 1,
        status: TaskStatus::Running,
        created_at: Utc::now(),
    };
    let ctx = SkillContext {
        run: run.clone(),
        step,
        task,
        settings: settings.clone(),
        base_dir: base_dir.to_path_buf(),
        store: store.clone(),
    };
    let mut inputs = json!({
        "query": query,
        "mode": "deep",
        "depth": depth,
        "max_rounds": max_rounds,
        "max_sources_total": max_sources,
        "max_pages_fetch": max_pages,
    });
    if let Some(hint) = style_hint {
        if !hint.trim().is_empty() {
            inputs["style_hint"] = json!(hint.trim());
        }
    }

    bus.emit_info(
        &run.id,
        EventType::TaskProgress,
        "Проверяю данные в интернете",
        json!({ "phase": "chat_auto_web_research_started", "query": query }),
    )
    .await?;

    let started = Instant::now();
    let result = match skill.run(inputs, &ctx).await {
        Ok(result) => result,
        Err(error) => {
            bus.emit(
                &run.id,
                EventType::TaskProgress,
                "Auto web research не удался",
                json!({ "phase": "chat_auto_web_research_failed", "error": error.to_string() }),
                EventLevel::Warning,
                None,
                None,
            )
            .await?;
            return Ok(None);
        }
    };
    let latency_ms = started.elapsed().as_millis() as i64;
    emit_progress(bus, &run.id, &result).await?;

    // A round that produced neither sources nor an artifact cannot improve on
    // the draft; keep the model answer.
    if result.sources.is_empty() && result.artifacts.is_empty() {
        bus.emit(
            &run.id,
            EventType::TaskProgress,
            "Auto web research не дал итогового ответа",
            json!({ "phase": "chat_auto_web_research_empty" }),
            EventLevel::Warning,
            None,
            None,
        )
        .await?;
        return Ok(None);
    }

    let text = compose_web_research_chat_text(&result, base_dir);
    if text.is_empty() {
        bus.emit(
            &run.id,
            EventType::TaskProgress,
            "Auto web research не дал итогового ответа",
            json!({ "phase": "chat_auto_web_research_empty" }),
            EventLevel::Warning,
            None,
            None,
        )
        .await?;
        return Ok(None);
    }

    if soft_retry_reason(query, &text) == Some(GuardReason::OffTopic) {
        bus.emit(
            &run.id,
            EventType::TaskProgress,
            "Auto web research вернул нерелевантный ответ",
            json!({ "phase": "chat_auto_web_research_off_topic", "query": query }),
            EventLevel::Warning,
            None,
            None,
        )
        .await?;
        return Ok(None);
    }

    persist_skill_result(store, &run.id, &result).await?;
    bus.emit_info(
        &run.id,
        EventType::TaskProgress,
        "Auto web research завершён",
        json!({
            "phase": "chat_auto_web_research_done",
            "sources_count": result.sources.len(),
            "latency_ms": latency_ms,
            "confidence": result.confidence,
        }),
    )
    .await?;

    Ok(Some(AutoResearchOutcome {
        text,
        latency_ms,
        sources_count: result.sources.len(),
        confidence: result.confidence,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use astra_types::{ArtifactCandidate, SourceCandidate};

    fn result_with_sources() -> SkillResult {
        SkillResult {
            what_i_did: "Собрал ответ по запросу".to_string(),
            sources: vec![SourceCandidate {
                url: "https://example.org/a".to_string(),
                title: Some("Example".to_string()),
                domain: Some("example.org".to_string()),
                quality: Some(0.8),
                retrieved_at: None,
                snippet: None,
                pinned: false,
            }],
            facts: vec![],
            artifacts: vec![],
            confidence: 0.8,
            assumptions: vec![],
            events: vec![],
        }
    }

    #[test]
    fn chat_text_appends_sources_block() {
        let text = compose_web_research_chat_text(&result_with_sources(), Path::new("/tmp"));
        assert!(text.contains("Источники:"));
        assert!(text.contains("https://example.org/a"));
    }

    #[test]
    fn chat_text_prefers_artifact_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let answer_path = dir.path().join("answer.md");
        std::fs::write(&answer_path, "Краткий итог: готово.\n\n## Источники\n[1] https://example.org/a").unwrap();

        let mut result = result_with_sources();
        result.artifacts = vec![ArtifactCandidate {
            artifact_type: "web_research_answer_md".to_string(),
            title: "answer".to_string(),
            content_uri: answer_path.to_string_lossy().into_owned(),
            created_at: None,
            meta: json!({}),
        }];
        let text = compose_web_research_chat_text(&result, dir.path());
        assert!(text.starts_with("Краткий итог:"));
        // Markdown already carries the sources section; no duplicate block.
        assert_eq!(text.matches("Источники").count(), 1);
    }

    #[tokio::test]
    async fn persist_dedups_against_existing_rows() {
        let store = Arc::new(SqliteStore::open_in_memory(4000).unwrap());
        let result = result_with_sources();
        persist_skill_result(&store, "run-1", &result).await.unwrap();
        persist_skill_result(&store, "run-1", &result).await.unwrap();
        assert_eq!(store.list_sources("run-1").await.unwrap().len(), 1);
    }
}
