// Run Engine
// Owns Run/Task transitions. One background worker per run walks the ready
// set of the plan DAG, executes steps sequentially, and honors pause/cancel
// at every safe point. Cancellation is store-backed so every loop in the
// process observes it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use astra_brain::{ChatMessage, LlmClient, LlmRequest};
use astra_core::{EventBus, SqliteStore};
use astra_types::{
    EventLevel, EventType, PlanStep, Run, RunStatus, SkillResult, StepKind, StepStatus, Task,
    TaskStatus,
};

use crate::error::{EngineError, Result};
use crate::executor::{ComputerExecutor, StepOutcome, StepOutcomeStatus};
use crate::planner::{validate_plan, Planner};
use crate::research::persist_skill_result;
use crate::success::{evaluate_success_checks, normalize_success_checks};
use astra_skills::{SkillContext, SkillError, SkillRegistry};

const WORKER_POLL: Duration = Duration::from_millis(200);
const PAUSE_POLL: Duration = Duration::from_millis(500);

pub struct RunEngine {
    store: Arc<SqliteStore>,
    bus: EventBus,
    registry: SkillRegistry,
    executor: Arc<ComputerExecutor>,
    llm: Arc<dyn LlmClient>,
    base_dir: PathBuf,
    max_step_retries: u32,
    active_workers: Mutex<HashSet<String>>,
}

impl RunEngine {
    pub fn new(
        store: Arc<SqliteStore>,
        bus: EventBus,
        registry: SkillRegistry,
        executor: Arc<ComputerExecutor>,
        llm: Arc<dyn LlmClient>,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            executor,
            llm,
            base_dir,
            max_step_retries: 2,
            active_workers: Mutex::new(HashSet::new()),
        }
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    pub async fn create_plan(&self, run: &Run) -> Result<Vec<PlanStep>> {
        let existing = self.store.list_plan_steps(&run.id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        self.store
            .update_run_status(&run.id, RunStatus::Planning)
            .await?;
        let steps = Planner::plan(run, None);
        validate_plan(&steps).map_err(EngineError::Validation)?;
        self.store.insert_plan_steps(&steps).await?;
        Ok(steps)
    }

    /// Start (or restart) the background worker for a run.
    pub async fn start_run(self: &Arc<Self>, run_id: &str) -> Result<()> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))?;
        if run.status.is_terminal() {
            return Err(EngineError::InvalidOperation(format!(
                "run {} is already {}",
                run_id,
                run.status.as_str()
            )));
        }
        if self.store.list_plan_steps(run_id).await?.is_empty() {
            self.create_plan(&run).await?;
        }
        self.store
            .update_run_status(run_id, RunStatus::Running)
            .await?;
        self.spawn_worker(run_id).await;
        Ok(())
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<Run> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))?;
        // Cancelling a completed run is a no-op.
        if run.status.is_terminal() {
            return Ok(run);
        }
        let run = self
            .store
            .update_run_status(run_id, RunStatus::Canceled)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))?;
        self.store.cancel_open_tasks(run_id).await?;
        let expired = self.store.expire_pending_approvals(run_id).await?;
        self.bus
            .emit_info(
                run_id,
                EventType::StepCancelledByUser,
                "Запуск отменён пользователем",
                json!({ "expired_approvals": expired.len() }),
            )
            .await?;
        Ok(run)
    }

    pub async fn pause_run(&self, run_id: &str) -> Result<Run> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))?;
        if run.status != RunStatus::Running && run.status != RunStatus::WaitingApproval {
            return Err(EngineError::InvalidOperation(
                "run is not running".to_string(),
            ));
        }
        self.store
            .update_run_status(run_id, RunStatus::Paused)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))
    }

    pub async fn resume_run(self: &Arc<Self>, run_id: &str) -> Result<Run> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))?;
        if run.status != RunStatus::Paused {
            return Err(EngineError::InvalidOperation("run is not paused".to_string()));
        }
        let run = self
            .store
            .update_run_status(run_id, RunStatus::Running)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))?;
        self.spawn_worker(run_id).await;
        Ok(run)
    }

    /// Retry a terminal task: its step goes back to created and the worker
    /// will open a fresh attempt.
    pub async fn retry_task(self: &Arc<Self>, run_id: &str, task_id: &str) -> Result<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .filter(|task| task.run_id == run_id)
            .ok_or_else(|| EngineError::NotFound(format!("task {}", task_id)))?;
        if !task.status.is_terminal() {
            return Err(EngineError::InvalidOperation(
                "task is still active".to_string(),
            ));
        }
        self.retry_step(run_id, &task.step_id).await?;
        let new_task = self.store.create_task(run_id, &task.step_id).await?;
        self.spawn_worker(run_id).await;
        Ok(new_task)
    }

    pub async fn retry_step(self: &Arc<Self>, run_id: &str, step_id: &str) -> Result<PlanStep> {
        let step = self
            .store
            .get_plan_step(step_id)
            .await?
            .filter(|step| step.run_id == run_id)
            .ok_or_else(|| EngineError::NotFound(format!("step {}", step_id)))?;
        self.store
            .update_step_status(step_id, StepStatus::Created)
            .await?;
        let run = self.store.get_run(run_id).await?;
        if let Some(run) = run {
            if run.status.is_terminal() {
                self.store
                    .update_run_status(run_id, RunStatus::Running)
                    .await?;
            }
        }
        self.spawn_worker(run_id).await;
        Ok(step)
    }

    // ========================================================================
    // Worker
    // ========================================================================

    async fn spawn_worker(self: &Arc<Self>, run_id: &str) {
        {
            let mut active = self.active_workers.lock().await;
            if !active.insert(run_id.to_string()) {
                return;
            }
        }
        let engine = Arc::clone(self);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = engine.run_worker(&run_id).await {
                tracing::error!("run worker {} failed: {}", run_id, error);
                let _ = engine.mark_run_failed(&run_id, &error.to_string()).await;
            }
            engine.active_workers.lock().await.remove(&run_id);
        });
    }

    async fn run_worker(&self, run_id: &str) -> Result<()> {
        loop {
            let Some(run) = self.store.get_run(run_id).await? else {
                return Ok(());
            };
            match run.status {
                RunStatus::Canceled | RunStatus::Done | RunStatus::Failed => return Ok(()),
                RunStatus::Paused => {
                    tokio::time::sleep(PAUSE_POLL).await;
                    continue;
                }
                _ => {}
            }

            let steps = self.store.list_plan_steps(run_id).await?;
            if steps.is_empty() {
                return Err(EngineError::InvalidOperation(
                    "run has no plan steps".to_string(),
                ));
            }

            // Skip steps whose dependencies already failed.
            let failed: HashSet<&str> = steps
                .iter()
                .filter(|step| step.status == StepStatus::Failed)
                .map(|step| step.id.as_str())
                .collect();
            for step in &steps {
                if step.status == StepStatus::Created
                    && step.depends_on.iter().any(|dep| failed.contains(dep.as_str()))
                {
                    self.store
                        .update_step_status(&step.id, StepStatus::Skipped)
                        .await?;
                }
            }

            let steps = self.store.list_plan_steps(run_id).await?;
            if steps.iter().all(|step| {
                matches!(
                    step.status,
                    StepStatus::Done | StepStatus::Failed | StepStatus::Skipped
                )
            }) {
                let any_failed = steps.iter().any(|step| step.status == StepStatus::Failed);
                if any_failed {
                    self.mark_run_failed(run_id, "one or more plan steps failed")
                        .await?;
                } else {
                    self.store.update_run_status(run_id, RunStatus::Done).await?;
                }
                return Ok(());
            }

            let done: HashSet<&str> = steps
                .iter()
                .filter(|step| step.status == StepStatus::Done)
                .map(|step| step.id.as_str())
                .collect();
            let ready: Vec<PlanStep> = steps
                .iter()
                .filter(|step| {
                    step.status == StepStatus::Created
                        && step.depends_on.iter().all(|dep| done.contains(dep.as_str()))
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                tokio::time::sleep(WORKER_POLL).await;
                continue;
            }

            // Steps within one run execute sequentially along the DAG.
            for step in ready {
                let Some(run) = self.store.get_run(run_id).await? else {
                    return Ok(());
                };
                if run.status != RunStatus::Running {
                    break;
                }
                self.execute_step_with_retries(&run, &step).await?;
            }
        }
    }

    async fn mark_run_failed(&self, run_id: &str, reason: &str) -> Result<()> {
        self.store
            .update_run_status(run_id, RunStatus::Failed)
            .await?;
        self.bus
            .emit(
                run_id,
                EventType::RunFailed,
                "Запуск завершён с ошибкой",
                json!({ "error": reason }),
                EventLevel::Error,
                None,
                None,
            )
            .await?;
        Ok(())
    }

    async fn execute_step_with_retries(&self, run: &Run, step: &PlanStep) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let task = self.store.create_task(&run.id, &step.id).await?;
            self.store
                .update_task_status(&task.id, TaskStatus::Running)
                .await?;
            self.store
                .update_step_status(&step.id, StepStatus::Running)
                .await?;

            match self.dispatch_step(run, step, &task).await {
                Ok(StepDisposition::Done) => {
                    self.store
                        .update_task_status(&task.id, TaskStatus::Done)
                        .await?;
                    self.store
                        .update_step_status(&step.id, StepStatus::Done)
                        .await?;
                    return Ok(());
                }
                Ok(StepDisposition::Canceled) => {
                    self.store
                        .update_task_status(&task.id, TaskStatus::Canceled)
                        .await?;
                    return Ok(());
                }
                Ok(StepDisposition::Failed { reason, retryable }) => {
                    self.store
                        .update_task_status(&task.id, TaskStatus::Failed)
                        .await?;
                    if retryable && attempt <= self.max_step_retries {
                        self.bus
                            .emit(
                                &run.id,
                                EventType::StepRetrying,
                                "Повтор шага после сбоя",
                                json!({ "attempt": attempt, "reason": reason }),
                                EventLevel::Warning,
                                Some(&task.id),
                                Some(&step.id),
                            )
                            .await?;
                        continue;
                    }
                    self.store
                        .update_step_status(&step.id, StepStatus::Failed)
                        .await?;
                    return Ok(());
                }
                Err(error) => {
                    self.store
                        .update_task_status(&task.id, TaskStatus::Failed)
                        .await?;
                    self.store
                        .update_step_status(&step.id, StepStatus::Failed)
                        .await?;
                    return Err(error);
                }
            }
        }
    }

    async fn dispatch_step(
        &self,
        run: &Run,
        step: &PlanStep,
        task: &Task,
    ) -> Result<StepDisposition> {
        if step.kind.is_computer_kind() {
            let outcome = self.executor.execute_step(run, step, task).await?;
            return Ok(disposition_from_outcome(outcome));
        }

        if step.kind == StepKind::ChatResponse {
            return self.run_chat_step(run, step, task).await;
        }

        let Some(skill) = self.registry.get(&step.skill_name) else {
            return Ok(StepDisposition::Failed {
                reason: format!("unknown skill {}", step.skill_name),
                retryable: false,
            });
        };

        self.bus
            .emit(
                &run.id,
                EventType::StepExecutionStarted,
                "Начат шаг исполнения",
                json!({ "step_id": step.id, "kind": step.kind.as_str(), "title": step.title }),
                EventLevel::Info,
                Some(&task.id),
                Some(&step.id),
            )
            .await?;

        let settings = self
            .store
            .get_project(&run.project_id)
            .await?
            .map(|project| project.settings)
            .unwrap_or(Value::Null);
        let ctx = SkillContext {
            run: run.clone(),
            step: step.clone(),
            task: task.clone(),
            settings,
            base_dir: self.base_dir.clone(),
            store: self.store.clone(),
        };

        match skill.run(step.inputs.clone(), &ctx).await {
            Ok(result) => {
                self.emit_skill_events(run, step, task, &result).await?;
                persist_skill_result(&self.store, &run.id, &result).await?;
                let passed = self.check_success_criteria(step, &result);
                self.bus
                    .emit(
                        &run.id,
                        EventType::StepExecutionFinished,
                        if passed { "Шаг завершён" } else { "Шаг не прошёл критерии" },
                        json!({
                            "status": if passed { "done" } else { "failed" },
                            "reason": if passed { "skill_done" } else { "success_criteria_failed" },
                            "confidence": result.confidence,
                        }),
                        if passed { EventLevel::Info } else { EventLevel::Warning },
                        Some(&task.id),
                        Some(&step.id),
                    )
                    .await?;
                if passed {
                    Ok(StepDisposition::Done)
                } else {
                    Ok(StepDisposition::Failed {
                        reason: "success_criteria_failed".to_string(),
                        retryable: false,
                    })
                }
            }
            Err(SkillError::Llm(error)) => Ok(StepDisposition::Failed {
                retryable: error.is_transient(),
                reason: error.error_type().to_string(),
            }),
            Err(SkillError::InvalidInputs(reason)) => Ok(StepDisposition::Failed {
                reason,
                retryable: false,
            }),
            Err(error) => Err(error.into()),
        }
    }

    fn check_success_criteria(&self, step: &PlanStep, result: &SkillResult) -> bool {
        let checks = normalize_success_checks(
            step.inputs.get("success_checks"),
            step.success_criteria.as_deref(),
        );
        if checks.is_empty() {
            return true;
        }
        evaluate_success_checks(&checks, &result.what_i_did)
    }

    async fn emit_skill_events(
        &self,
        run: &Run,
        step: &PlanStep,
        task: &Task,
        result: &SkillResult,
    ) -> Result<()> {
        for event in &result.events {
            let mut payload = event.payload.clone();
            if let Some(map) = payload.as_object_mut() {
                if let Some(phase) = &event.phase {
                    map.insert("phase".to_string(), json!(phase));
                }
                if let Some(reason_code) = &event.reason_code {
                    map.insert("reason_code".to_string(), json!(reason_code));
                }
            }
            self.bus
                .emit(
                    &run.id,
                    EventType::TaskProgress,
                    &event.message,
                    payload,
                    EventLevel::Info,
                    Some(&task.id),
                    Some(&step.id),
                )
                .await?;
        }
        Ok(())
    }

    /// Final summarizing answer of an ACT plan.
    async fn run_chat_step(
        &self,
        run: &Run,
        step: &PlanStep,
        task: &Task,
    ) -> Result<StepDisposition> {
        let sources = self.store.list_sources(&run.id).await?;
        let events = self.store.list_events(&run.id, 40).await?;
        let finished: Vec<Value> = events
            .iter()
            .filter(|event| event.event_type == EventType::StepExecutionFinished)
            .map(|event| event.payload.clone())
            .collect();

        let mut request = LlmRequest::new(
            "act_summary",
            vec![
                ChatMessage::system(
                    "Сформулируй короткий итог выполненного плана для владельца: что сделано, \
                     что не получилось, что дальше. По-русски, без воды.",
                ),
                ChatMessage::user(
                    json!({
                        "query": run.query_text,
                        "step_results": finished,
                        "sources": sources.iter().map(|s| &s.url).collect::<Vec<_>>(),
                    })
                    .to_string(),
                ),
            ],
        );
        request.max_tokens = Some(400);
        request.run_id = Some(run.id.clone());
        request.task_id = Some(task.id.clone());
        request.step_id = Some(step.id.clone());
        request.qa_mode = run.qa_mode();

        // Plain dispatch: the soft-retry guards compare against the raw user
        // query, which this summarizing request does not carry.
        let (text, degraded) = match self.llm.call(request).await {
            Ok(response) if response.is_ok() && !response.text.trim().is_empty() => {
                (response.text, false)
            }
            Ok(response) => (
                crate::chat::chat_resilience_text(response.error_type.as_deref()),
                true,
            ),
            Err(error) => (
                crate::chat::chat_resilience_text(Some(error.error_type())),
                true,
            ),
        };

        self.bus
            .emit(
                &run.id,
                EventType::ChatResponseGenerated,
                if degraded {
                    "Ответ сформирован (degraded)"
                } else {
                    "Ответ сформирован"
                },
                json!({ "provider": "local", "text": text, "degraded": degraded }),
                EventLevel::Info,
                Some(&task.id),
                Some(&step.id),
            )
            .await?;
        Ok(StepDisposition::Done)
    }
}

enum StepDisposition {
    Done,
    Canceled,
    Failed { reason: String, retryable: bool },
}

fn disposition_from_outcome(outcome: StepOutcome) -> StepDisposition {
    match outcome.status {
        StepOutcomeStatus::Done => StepDisposition::Done,
        StepOutcomeStatus::Canceled => StepDisposition::Canceled,
        StepOutcomeStatus::Failed => StepDisposition::Failed {
            // Executor failures are policy outcomes, not transient provider
            // errors; they never burn silent retries.
            retryable: false,
            reason: outcome.reason,
        },
    }
}
