// Create-run pipeline: triage intent, analyze tone, interpret memory, then
// branch into chat generation, clarification, or plan creation. Classifier
// and interpreter failures degrade; they never surface as 5xx.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use astra_brain::router::ChatProfile;
use astra_brain::{BrainRouter, ChatMessage, LlmClient, LlmRequest, ModelKind};
use astra_core::config::ChatConfig;
use astra_core::privacy::{ContextItem, Sensitivity, SourceType};
use astra_core::{EventBus, SqliteStore};
use astra_persona::relevance::CYRILLIC_RE;
use astra_persona::{analyze_tone, build_chat_messages, build_dynamic_prompt, EpisodicStore};
use astra_types::{
    ChatTurn, EventLevel, EventType, IntentDecision, IntentKind, PlanStep, Run, RunMode,
    StepKind, StepStatus, Task, TaskStatus, UserMemory,
};

use crate::chat::{
    auto_web_research_decision, call_chat_with_soft_retry, chat_resilience_text,
};
use crate::engine::RunEngine;
use crate::error::{EngineError, Result};
use crate::intent::{
    fast_chat_decision, is_fast_chat_candidate, resolve_run_mode, semantic_resilience_decision,
    IntentRouter,
};
use crate::interpreter::{
    interpret_user_message_for_memory, memory_payload_from_interpretation,
    merge_memory_payloads, name_from_interpretation, style_hint_from_interpretation,
};
use crate::research::run_auto_web_research;
use astra_skills::{Skill, SkillContext, SkillRegistry};

const CHAT_HISTORY_TURNS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateRunKind {
    Chat,
    Clarify,
    Act,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRunOutcome {
    pub kind: CreateRunKind,
    pub intent: IntentDecision,
    pub run: Run,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_response: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<PlanStep>,
}

pub struct Kernel {
    pub store: Arc<SqliteStore>,
    pub bus: EventBus,
    pub brain: Arc<BrainRouter>,
    pub llm: Arc<dyn LlmClient>,
    pub episodic: Arc<EpisodicStore>,
    pub chat_config: ChatConfig,
    pub registry: SkillRegistry,
    pub engine: Arc<RunEngine>,
    pub base_dir: PathBuf,
}

impl Kernel {
    pub async fn create_run(
        &self,
        project_id: &str,
        query_text: &str,
        mode: RunMode,
        parent_run_id: Option<&str>,
        purpose: Option<&str>,
        qa_mode: bool,
    ) -> Result<CreateRunOutcome> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("project {}", project_id)))?;
        let settings = project.settings.clone();

        let run = self
            .store
            .create_run(
                project_id,
                query_text,
                mode,
                parent_run_id,
                purpose,
                json!({ "intent": "ASK", "qa_mode": qa_mode, "intent_path": "pending" }),
            )
            .await?;
        self.bus
            .emit_info(
                &run.id,
                EventType::RunCreated,
                "Запуск создан",
                json!({
                    "project_id": project_id,
                    "mode": run.mode.as_str(),
                    "query_text": query_text,
                }),
            )
            .await?;

        // Triage: fast path, then semantic classify with degrade-to-CHAT.
        let mut semantic_error_code: Option<String> = None;
        let decision = if is_fast_chat_candidate(query_text, qa_mode, &self.chat_config) {
            fast_chat_decision()
        } else {
            let router = IntentRouter::new(self.llm.clone(), qa_mode);
            match router.decide(query_text, &run.id).await {
                Ok(decision) => decision,
                Err(error) => {
                    semantic_error_code = Some(error.code.clone());
                    self.bus
                        .emit(
                            &run.id,
                            EventType::LlmRequestFailed,
                            "Semantic decision failed",
                            json!({
                                "provider": "local",
                                "model_id": null,
                                "error_type": error.code,
                                "http_status_if_any": null,
                                "retry_count": 0,
                            }),
                            EventLevel::Warning,
                            None,
                            None,
                        )
                        .await?;
                    semantic_resilience_decision(&error.code)
                }
            }
        };

        let semantic_resilience = semantic_error_code.is_some();
        let fast_chat_path = decision.decision_path == astra_types::DecisionPath::FastChatPath;

        let profile_memories = self.store.list_user_memories(50, None).await?;
        let profile_context = astra_persona::build_user_profile_context(&profile_memories);
        let history = self
            .store
            .list_recent_chat_turns(project_id, CHAT_HISTORY_TURNS)
            .await?;
        let tone_analysis = analyze_tone(query_text, &history, &profile_memories);

        // Memory interpretation is skipped on degraded and latency paths.
        let mut memory_interpretation = None;
        let mut memory_interpretation_error: Option<String> = None;
        if semantic_resilience {
            memory_interpretation_error =
                Some("memory_interpreter_skipped_semantic_resilience".to_string());
        } else if fast_chat_path {
            memory_interpretation_error = Some("memory_interpreter_skipped_fast_path".to_string());
        } else {
            match interpret_user_message_for_memory(
                &self.llm,
                query_text,
                &history,
                &profile_memories,
                &run.id,
                qa_mode,
            )
            .await
            {
                Ok(interpretation) => memory_interpretation = Some(interpretation),
                Err(error) => {
                    memory_interpretation_error = Some(error.code.clone());
                    self.bus
                        .emit(
                            &run.id,
                            EventType::LlmRequestFailed,
                            "Memory interpretation failed",
                            json!({
                                "provider": "local",
                                "model_id": null,
                                "error_type": error.code,
                                "http_status_if_any": null,
                                "retry_count": 0,
                            }),
                            EventLevel::Warning,
                            None,
                            None,
                        )
                        .await?;
                }
            }
        }

        let interpreted_style_hint = memory_interpretation
            .as_ref()
            .and_then(style_hint_from_interpretation);
        let tone_style_hint = astra_persona::tone::style_hint_from_tone(&tone_analysis);
        let profile_style_hint = if profile_context.style_hints.is_empty() {
            None
        } else {
            Some(
                profile_context
                    .style_hints
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        };
        let effective_style_hint = decision
            .response_style_hint
            .clone()
            .or(interpreted_style_hint)
            .or(tone_style_hint)
            .or(profile_style_hint);

        let interpreted_user_name = memory_interpretation
            .as_ref()
            .and_then(name_from_interpretation)
            .or_else(|| profile_context.user_name.clone());

        let mut memory_payload = memory_interpretation
            .as_ref()
            .and_then(memory_payload_from_interpretation);
        if memory_payload.is_none() && tone_analysis.self_improve {
            memory_payload = astra_persona::profile::build_tone_profile_memory_payload(
                query_text,
                &tone_analysis,
                &profile_memories,
            );
        }
        let memory_payload = merge_memory_payloads(memory_payload, None);

        let (selected_mode, selected_purpose) = resolve_run_mode(&decision, mode, purpose);

        let meta = json!({
            "intent": decision.intent.kind(),
            "intent_confidence": decision.confidence,
            "intent_reasons": decision.reasons.clone(),
            "intent_questions": decision.intent.questions(),
            "needs_clarification": decision.needs_clarification,
            "qa_mode": qa_mode,
            "act_hint": decision.intent.act_hint(),
            "danger_flags": decision.intent.act_hint().map(|h| h.danger_flags.clone()).unwrap_or_default(),
            "suggested_run_mode": decision.intent.act_hint().and_then(|h| h.suggested_run_mode),
            "target": decision.intent.act_hint().and_then(|h| h.target.clone()),
            "intent_path": decision.decision_path,
            "plan_hint": decision.plan_hint.clone(),
            "memory_item": decision.memory_item.clone(),
            "memory_interpretation_error": memory_interpretation_error.clone(),
            "response_style_hint": effective_style_hint.clone(),
            "tone_analysis": &tone_analysis,
            "character_mode": tone_analysis.primary_mode.clone(),
            "supporting_mode": tone_analysis.supporting_mode.clone(),
            "mode_history": tone_analysis.mode_history.clone(),
            "user_visible_note": decision.user_visible_note.clone(),
            "user_name": interpreted_user_name,
            "semantic_error_code": semantic_error_code.clone(),
        });
        let run = self
            .store
            .update_run_meta_and_mode(&run.id, selected_mode, selected_purpose.as_deref(), meta)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run.id)))?;

        self.emit_intent_decided(&run.id, &decision, selected_mode).await?;

        match decision.intent.kind() {
            IntentKind::Act => {
                let plan = match self.engine.create_plan(&run).await {
                    Ok(plan) => plan,
                    Err(error) => {
                        self.store
                            .update_run_status(&run.id, astra_types::RunStatus::Failed)
                            .await?;
                        self.bus
                            .emit(
                                &run.id,
                                EventType::RunFailed,
                                "Запуск завершён с ошибкой",
                                json!({ "error": error.to_string() }),
                                EventLevel::Error,
                                None,
                                None,
                            )
                            .await?;
                        return Err(error);
                    }
                };
                Ok(CreateRunOutcome {
                    kind: CreateRunKind::Act,
                    intent: decision,
                    run,
                    chat_response: None,
                    questions: vec![],
                    plan,
                })
            }
            IntentKind::Ask => {
                self.bus
                    .emit_info(
                        &run.id,
                        EventType::ClarifyRequested,
                        "Запрошено уточнение",
                        json!({ "questions": decision.intent.questions() }),
                    )
                    .await?;
                self.save_memory_payload_async(&run, memory_payload.clone(), &settings);
                let questions = decision.intent.questions().to_vec();
                Ok(CreateRunOutcome {
                    kind: CreateRunKind::Clarify,
                    intent: decision,
                    run,
                    chat_response: None,
                    questions,
                    plan: vec![],
                })
            }
            IntentKind::Chat => {
                self.generate_chat(
                    run,
                    decision,
                    &settings,
                    query_text,
                    &history,
                    &profile_memories,
                    &tone_analysis,
                    effective_style_hint.as_deref(),
                    semantic_error_code,
                    memory_payload,
                    qa_mode,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate_chat(
        &self,
        run: Run,
        decision: IntentDecision,
        settings: &Value,
        query_text: &str,
        history: &[ChatTurn],
        memories: &[UserMemory],
        tone_analysis: &astra_persona::ToneAnalysis,
        style_hint: Option<&str>,
        semantic_error_code: Option<String>,
        memory_payload: Option<Value>,
        qa_mode: bool,
    ) -> Result<CreateRunOutcome> {
        if let Some(error_code) = semantic_error_code {
            let fallback_text = chat_resilience_text(Some(&error_code));
            self.bus
                .emit_info(
                    &run.id,
                    EventType::ChatResponseGenerated,
                    "Ответ сформирован (degraded)",
                    json!({
                        "provider": "local",
                        "model_id": null,
                        "latency_ms": null,
                        "text": fallback_text,
                        "degraded": true,
                        "error_type": error_code,
                    }),
                )
                .await?;
            self.save_memory_payload_async(&run, memory_payload, settings);
            return Ok(CreateRunOutcome {
                kind: CreateRunKind::Chat,
                intent: decision,
                run,
                chat_response: Some(fallback_text),
                questions: vec![],
                plan: vec![],
            });
        }

        // Prompt assembly; episodic recall feeds the full path only.
        let episodic_recall = if tone_analysis.simple_query {
            None
        } else {
            self.episodic
                .retrieve(history, Some(query_text), 3)
                .await
                .ok()
        };
        let prompt_build = build_dynamic_prompt(
            memories,
            style_hint,
            query_text,
            history,
            self.chat_config.owner_direct_mode,
            tone_analysis,
            episodic_recall.as_ref(),
        );
        let mut system_text = prompt_build.prompt;
        if CYRILLIC_RE.is_match(query_text) {
            system_text.push_str(
                "\n\n[Language Lock]\n- Отвечай только на русском языке.\n\
                 - Не переключайся на английский без явной просьбы владельца.\n\
                 - Английские слова допустимы только для кода/терминов.",
            );
        }

        if !tone_analysis.simple_query {
            let episodic = self.episodic.clone();
            let query = query_text.to_string();
            let history_tail = history.to_vec();
            let analysis = tone_analysis.clone();
            tokio::spawn(async move {
                let _ = episodic.update(&query, &history_tail, Some(&analysis), None).await;
            });
        }

        let turns = build_chat_messages(&system_text, history, query_text);
        let mut request = LlmRequest::new(
            "chat_response",
            turns
                .into_iter()
                .map(|turn| ChatMessage {
                    role: turn.role,
                    content: turn.content,
                })
                .collect(),
        );
        request.preferred_model_kind = ModelKind::Chat;
        request.temperature = self.chat_config.temperature;
        request.top_p = Some(self.chat_config.top_p);
        request.repeat_penalty = Some(self.chat_config.repeat_penalty);
        request.max_tokens = Some(self.chat_config.num_predict);
        request.run_id = Some(run.id.clone());
        request.qa_mode = qa_mode;
        request.context_items = vec![ContextItem::text(
            query_text,
            SourceType::UserPrompt,
            Sensitivity::Personal,
        )];

        let chat_profile = self.brain.chat_profile_for_query(query_text);

        // Generation with soft-retry; failures downgrade to resilience text.
        let mut degraded_error: Option<String> = None;
        let mut response_text = String::new();
        let mut provider = "local".to_string();
        let mut model_id: Option<String> = None;
        let mut latency_ms: Option<i64> = None;
        match call_chat_with_soft_retry(&self.llm, request).await {
            Ok(response) => {
                provider = response.provider.clone();
                model_id = Some(response.model_id.clone());
                latency_ms = Some(response.latency_ms);
                if response.is_ok() && !response.text.trim().is_empty() {
                    response_text = response.text;
                } else {
                    degraded_error = Some(
                        response
                            .error_type
                            .unwrap_or_else(|| "chat_empty_response".to_string()),
                    );
                }
            }
            Err(error) => {
                degraded_error = Some(error.error_type().to_string());
            }
        }

        // Auto web research on failures and on uncertain/guarded answers.
        let (should_research, research_reason) = auto_web_research_decision(
            self.chat_config.auto_web_research_enabled,
            query_text,
            &response_text,
            degraded_error.as_deref(),
        );
        if should_research {
            if let Some(skill) = self.registry.get("web_research") {
                let researched = run_auto_web_research(
                    &self.store,
                    &self.bus,
                    &skill,
                    &run,
                    settings,
                    &self.base_dir,
                    query_text,
                    style_hint,
                    self.chat_config.auto_web_research_max_rounds,
                    self.chat_config.auto_web_research_max_sources,
                    self.chat_config.auto_web_research_max_pages,
                    &self.chat_config.auto_web_research_depth,
                )
                .await?;
                if let Some(outcome) = researched {
                    self.bus
                        .emit_info(
                            &run.id,
                            EventType::ChatResponseGenerated,
                            "Ответ сформирован (web research)",
                            json!({
                                "provider": "web_research",
                                "model_id": "web_research",
                                "latency_ms": outcome.latency_ms,
                                "text": outcome.text,
                                "degraded": false,
                                "sources_count": outcome.sources_count,
                                "confidence": outcome.confidence,
                                "reason": research_reason,
                            }),
                        )
                        .await?;
                    self.merge_chat_metrics(&run.id, chat_profile, &outcome.text).await?;
                    self.save_memory_payload_async(&run, memory_payload, settings);
                    return Ok(CreateRunOutcome {
                        kind: CreateRunKind::Chat,
                        intent: decision,
                        run,
                        chat_response: Some(outcome.text),
                        questions: vec![],
                        plan: vec![],
                    });
                }
            }
        }

        let (final_text, degraded) = match degraded_error.as_deref() {
            Some(error_code) => (chat_resilience_text(Some(error_code)), true),
            None => (response_text, false),
        };

        self.bus
            .emit_info(
                &run.id,
                EventType::ChatResponseGenerated,
                if degraded {
                    "Ответ сформирован (degraded)"
                } else {
                    "Ответ сформирован"
                },
                json!({
                    "provider": provider,
                    "model_id": model_id,
                    "latency_ms": latency_ms,
                    "text": final_text,
                    "degraded": degraded,
                    "error_type": degraded_error,
                }),
            )
            .await?;
        self.merge_chat_metrics(&run.id, chat_profile, &final_text).await?;
        self.save_memory_payload_async(&run, memory_payload, settings);

        let run = self.store.get_run(&run.id).await?.unwrap_or(run);
        Ok(CreateRunOutcome {
            kind: CreateRunKind::Chat,
            intent: decision,
            run,
            chat_response: Some(final_text),
            questions: vec![],
            plan: vec![],
        })
    }

    async fn merge_chat_metrics(
        &self,
        run_id: &str,
        profile: ChatProfile,
        text: &str,
    ) -> Result<()> {
        let response_mode = if looks_like_step_plan(text) {
            "step_by_step_plan"
        } else if text.trim().chars().count() <= 200 {
            "short_direct"
        } else {
            "balanced"
        };
        self.store
            .merge_run_meta(
                run_id,
                &json!({
                    "chat_inference_profile": profile.as_str(),
                    "chat_response_mode": response_mode,
                }),
            )
            .await?;
        Ok(())
    }

    async fn emit_intent_decided(
        &self,
        run_id: &str,
        decision: &IntentDecision,
        selected_mode: RunMode,
    ) -> Result<()> {
        self.bus
            .emit_info(
                run_id,
                EventType::IntentDecided,
                "Интент определён",
                json!({
                    "intent": decision.intent.kind(),
                    "confidence": decision.confidence,
                    "reasons": decision.reasons,
                    "danger_flags": decision
                        .intent
                        .act_hint()
                        .map(|hint| hint.danger_flags.clone())
                        .unwrap_or_default(),
                    "suggested_mode": decision
                        .intent
                        .act_hint()
                        .and_then(|hint| hint.suggested_run_mode)
                        .unwrap_or(selected_mode),
                    "selected_mode": selected_mode,
                    "target": decision.intent.act_hint().and_then(|hint| hint.target.clone()),
                    "decision_path": decision.decision_path,
                    "summary": decision.summary(),
                }),
            )
            .await?;
        Ok(())
    }

    /// Fire-and-forget memory save through the memory_save skill; failures
    /// surface as warning events, never as request errors.
    fn save_memory_payload_async(&self, run: &Run, payload: Option<Value>, settings: &Value) {
        let Some(payload) = payload else { return };
        let Some(skill) = self.registry.get("memory_save") else {
            return;
        };
        let store = self.store.clone();
        let bus = self.bus.clone();
        let base_dir = self.base_dir.clone();
        let run = run.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            let run_id = run.id.clone();
            let _ = bus
                .emit_info(
                    &run_id,
                    EventType::MemorySaveRequested,
                    "Запрошено сохранение памяти",
                    json!({}),
                )
                .await;
            let ctx = memory_save_context(run, settings, base_dir, store);
            match skill.run(payload, &ctx).await {
                Ok(result) => {
                    let _ = bus
                        .emit_info(
                            &run_id,
                            EventType::MemorySaved,
                            "Память сохранена",
                            json!({ "confidence": result.confidence }),
                        )
                        .await;
                }
                Err(error) => {
                    let _ = bus
                        .emit(
                            &run_id,
                            EventType::LlmRequestFailed,
                            "Memory save failed",
                            json!({
                                "provider": "local",
                                "model_id": null,
                                "error_type": "memory_save_failed",
                                "detail": error.to_string(),
                                "retry_count": 0,
                            }),
                            EventLevel::Warning,
                            None,
                            None,
                        )
                        .await;
                }
            }
        });
    }
}

fn memory_save_context(
    run: Run,
    settings: Value,
    base_dir: PathBuf,
    store: Arc<SqliteStore>,
) -> SkillContext {
    let step = PlanStep {
        id: format!("memory-save-step:{}", run.id),
        run_id: run.id.clone(),
        step_index: 0,
        kind: StepKind::MemoryCommit,
        skill_name: "memory_save".to_string(),
        title: Some("Async memory save".to_string()),
        inputs: json!({}),
        depends_on: vec![],
        status: StepStatus::Running,
        success_criteria: None,
        danger_flags: vec![],
        requires_approval: false,
        artifacts_expected: vec![],
    };
    let task = Task {
        id: format!("memory-save-task:{}", run.id),
        run_id: run.id.clone(),
        step_id: step.id.clone(),
        attempt: 1,
        status: TaskStatus::Running,
        created_at: chrono::Utc::now(),
    };
    SkillContext {
        run,
        step,
        task,
        settings,
        base_dir,
        store,
    }
}

/// A complex answer that opens with a summary line and numbers its steps.
fn looks_like_step_plan(text: &str) -> bool {
    let has_summary = text.trim_start().starts_with("Краткий итог:");
    let numbered = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed
                .split_once('.')
                .map(|(head, _)| !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        })
        .count();
    has_summary && numbered >= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_plan_detector_needs_summary_and_numbers() {
        let plan = "Краткий итог: план готов.\n1. Разминка.\n2. Силовая.\n3. Кардио.";
        assert!(looks_like_step_plan(plan));
        assert!(!looks_like_step_plan("Просто ответ без структуры"));
        assert!(!looks_like_step_plan("1. Шаг без итога.\n2. Второй шаг."));
    }
}
