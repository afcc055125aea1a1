// Computer Executor
// Micro-action loop for on-screen work: observe -> propose -> execute ->
// verify, bounded by micro-step and wall-clock budgets, with approval gating
// and no-progress recovery through user help.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use astra_brain::{ChatMessage, LlmClient, LlmRequest};
use astra_core::config::{env_bool, env_int};
use astra_core::privacy::{ContextItem, Sensitivity, SourceType};
use astra_core::{EventBus, SqliteStore};
use astra_types::{EventLevel, EventType, PlanStep, Run, RunStatus, Task};

use crate::approvals::ApprovalGate;
use crate::error::Result;

// ============================================================================
// Bridge port
// ============================================================================

#[derive(Debug, Clone)]
pub struct Capture {
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
}

/// External desktop bridge process: screenshot capture and input injection.
#[async_trait]
pub trait DesktopBridge: Send + Sync {
    async fn capture(&self, max_width: u32, quality: u32) -> anyhow::Result<Capture>;
    async fn act(
        &self,
        action: &MicroAction,
        image_width: u32,
        image_height: u32,
    ) -> anyhow::Result<()>;
}

// ============================================================================
// Actions
// ============================================================================

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MicroAction {
    MoveMouse { x: i64, y: i64 },
    Click { x: i64, y: i64, button: Option<String> },
    DoubleClick { x: i64, y: i64 },
    Drag { start_x: i64, start_y: i64, end_x: i64, end_y: i64 },
    Type { text: String },
    Key { keys: Vec<String> },
    Scroll { dy: i64 },
    Wait { ms: i64 },
    Done,
}

impl MicroAction {
    pub fn summarize(&self) -> String {
        match self {
            Self::Type { text } => format!("type:{} chars", text.chars().count()),
            Self::Key { keys } => format!("key:{}", keys.join("+")),
            Self::Click { x, y, .. } => format!("click({},{})", x, y),
            Self::DoubleClick { x, y } => format!("double_click({},{})", x, y),
            Self::MoveMouse { x, y } => format!("move_mouse({},{})", x, y),
            Self::Drag { start_x, start_y, end_x, end_y } => {
                format!("drag({},{})->({},{})", start_x, start_y, end_x, end_y)
            }
            Self::Scroll { dy } => format!("scroll({})", dy),
            Self::Wait { ms } => format!("wait({}ms)", ms),
            Self::Done => "done".to_string(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::MoveMouse { .. } => "move_mouse",
            Self::Click { .. } => "click",
            Self::DoubleClick { .. } => "double_click",
            Self::Drag { .. } => "drag",
            Self::Type { .. } => "type",
            Self::Key { .. } => "key",
            Self::Scroll { .. } => "scroll",
            Self::Wait { .. } => "wait",
            Self::Done => "done",
        }
    }
}

/// Validate a model-proposed payload into a well-formed action.
pub fn normalize_action(payload: &Value) -> Option<MicroAction> {
    let action_type = payload
        .get("action_type")
        .or_else(|| payload.get("type"))
        .and_then(Value::as_str)?;
    let int = |key: &str| payload.get(key).and_then(Value::as_i64);
    match action_type {
        "done" => Some(MicroAction::Done),
        "move_mouse" => Some(MicroAction::MoveMouse { x: int("x")?, y: int("y")? }),
        "click" => Some(MicroAction::Click {
            x: int("x")?,
            y: int("y")?,
            button: payload.get("button").and_then(Value::as_str).map(str::to_string),
        }),
        "double_click" => Some(MicroAction::DoubleClick { x: int("x")?, y: int("y")? }),
        "drag" => Some(MicroAction::Drag {
            start_x: int("start_x")?,
            start_y: int("start_y")?,
            end_x: int("end_x")?,
            end_y: int("end_y")?,
        }),
        "type" => {
            let text = payload.get("text").and_then(Value::as_str)?;
            Some(MicroAction::Type { text: text.to_string() })
        }
        "key" => {
            let keys: Vec<String> = match payload.get("keys").or_else(|| payload.get("key"))? {
                Value::String(key) => vec![key.clone()],
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(key) => key.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
                _ => return None,
            };
            if keys.is_empty() {
                return None;
            }
            Some(MicroAction::Key { keys })
        }
        "scroll" => Some(MicroAction::Scroll { dy: int("dy")? }),
        "wait" => Some(MicroAction::Wait { ms: int("ms").unwrap_or(500) }),
        _ => None,
    }
}

const MICRO_ACTION_SYSTEM_PROMPT: &str = "Ты управляешь компьютером и предлагаешь одно атомарное действие за шаг. \
Верни JSON строго по схеме. Доступные action_type: move_mouse, click, double_click, \
drag, type, key, scroll, wait, done. \
Используй координаты (x, y) в системе изображения (width/height). \
Для drag укажи start_x/start_y и end_x/end_y. \
Для key используй keys (например [\"CMD\", \"L\"]). \
Если нужно подождать загрузку — action_type=wait и ms. \
Если считаешь шаг завершён — action_type=done. \
Не добавляй лишних полей и не пиши пояснений вне JSON.";

fn micro_action_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action_type": {
                "type": "string",
                "enum": ["click", "done", "double_click", "drag", "key", "move_mouse", "scroll", "type", "wait"],
            },
            "x": { "type": "integer" },
            "y": { "type": "integer" },
            "start_x": { "type": "integer" },
            "start_y": { "type": "integer" },
            "end_x": { "type": "integer" },
            "end_y": { "type": "integer" },
            "text": { "type": "string" },
            "keys": { "type": "array", "items": { "type": "string" } },
            "dy": { "type": "integer" },
            "button": { "type": "string" },
            "ms": { "type": "integer" },
            "rationale": { "type": "string" },
            "expected_change": { "type": "string" },
        },
        "required": ["action_type"],
        "additionalProperties": false,
    })
}

// ============================================================================
// Config & state
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_micro_steps: u32,
    pub max_no_progress: u32,
    pub max_total_time_s: u64,
    pub wait_after_act_ms: u64,
    pub wait_poll_ms: u64,
    pub wait_timeout_ms: u64,
    pub max_action_retries: u32,
    pub screenshot_width: u32,
    pub screenshot_quality: u32,
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_micro_steps: 30,
            max_no_progress: 5,
            max_total_time_s: 600,
            wait_after_act_ms: 350,
            wait_poll_ms: 500,
            wait_timeout_ms: 4000,
            max_action_retries: 1,
            screenshot_width: 1280,
            screenshot_quality: 60,
            dry_run: false,
        }
    }
}

impl ExecutorConfig {
    pub fn from_env_and_settings(settings: &Value) -> Self {
        let cfg = settings.get("executor").cloned().unwrap_or(Value::Null);
        let setting_u64 = |key: &str, default: u64| -> u64 {
            cfg.get(key).and_then(Value::as_u64).unwrap_or(default)
        };
        Self {
            max_micro_steps: env_int("ASTRA_EXECUTOR_MAX_MICRO_STEPS", setting_u64("max_micro_steps", 30) as i64)
                .max(1) as u32,
            max_no_progress: env_int("ASTRA_EXECUTOR_MAX_NO_PROGRESS", setting_u64("max_no_progress", 5) as i64)
                .max(1) as u32,
            max_total_time_s: env_int("ASTRA_EXECUTOR_MAX_TOTAL_TIME_S", setting_u64("max_total_time_s", 600) as i64)
                .max(1) as u64,
            wait_after_act_ms: env_int(
                "ASTRA_EXECUTOR_WAIT_AFTER_ACT_MS",
                setting_u64("wait_after_act_ms", 350) as i64,
            )
            .max(0) as u64,
            wait_poll_ms: env_int("ASTRA_EXECUTOR_WAIT_POLL_MS", setting_u64("wait_poll_ms", 500) as i64).max(50)
                as u64,
            wait_timeout_ms: env_int(
                "ASTRA_EXECUTOR_WAIT_TIMEOUT_MS",
                setting_u64("wait_timeout_ms", 4000) as i64,
            )
            .max(0) as u64,
            max_action_retries: env_int(
                "ASTRA_EXECUTOR_MAX_ACTION_RETRIES",
                setting_u64("max_action_retries", 1) as i64,
            )
            .max(0) as u32,
            screenshot_width: env_int(
                "ASTRA_EXECUTOR_SCREENSHOT_WIDTH",
                setting_u64("screenshot_width", 1280) as i64,
            )
            .max(320) as u32,
            screenshot_quality: env_int(
                "ASTRA_EXECUTOR_SCREENSHOT_QUALITY",
                setting_u64("screenshot_quality", 60) as i64,
            )
            .clamp(10, 100) as u32,
            dry_run: env_bool(
                "ASTRA_EXECUTOR_DRY_RUN",
                cfg.get("dry_run").and_then(Value::as_bool).unwrap_or(false),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Observation {
    pub hash: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcomeStatus {
    Done,
    Failed,
    Canceled,
}

impl StepOutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepOutcomeStatus,
    pub reason: String,
    pub micro_steps: u32,
}

impl StepOutcome {
    fn done(reason: &str, micro_steps: u32) -> Self {
        Self {
            status: StepOutcomeStatus::Done,
            reason: reason.to_string(),
            micro_steps,
        }
    }

    fn failed(reason: &str, micro_steps: u32) -> Self {
        Self {
            status: StepOutcomeStatus::Failed,
            reason: reason.to_string(),
            micro_steps,
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

pub struct ComputerExecutor {
    bridge: Arc<dyn DesktopBridge>,
    llm: Arc<dyn LlmClient>,
    store: Arc<SqliteStore>,
    bus: EventBus,
    gate: ApprovalGate,
    config_override: Option<ExecutorConfig>,
}

impl ComputerExecutor {
    pub fn new(
        bridge: Arc<dyn DesktopBridge>,
        llm: Arc<dyn LlmClient>,
        store: Arc<SqliteStore>,
        bus: EventBus,
        gate: ApprovalGate,
    ) -> Self {
        Self {
            bridge,
            llm,
            store,
            bus,
            gate,
            config_override: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config_override = Some(config);
        self
    }

    pub async fn execute_step(&self, run: &Run, step: &PlanStep, task: &Task) -> Result<StepOutcome> {
        let cfg = self
            .config_override
            .clone()
            .unwrap_or_else(|| ExecutorConfig::from_env_and_settings(&Value::Null));

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

        if step.requires_approval || !step.danger_flags.is_empty() {
            let approved = self.gate.request_step_approval(run, step, task).await?;
            if !approved {
                return self
                    .finish(run, step, task, StepOutcome::failed("approval_rejected", 0))
                    .await;
            }
        }

        let mut last_observation: Option<Observation> = None;
        let mut last_action_summary: Option<String> = None;
        let mut no_progress: u32 = 0;
        let mut micro_steps: u32 = 0;
        let start_time = Instant::now();

        while micro_steps < cfg.max_micro_steps {
            if self.run_canceled(&run.id).await? {
                self.bus
                    .emit(
                        &run.id,
                        EventType::StepCancelledByUser,
                        "Шаг остановлен: запуск отменён",
                        json!({ "micro_steps": micro_steps }),
                        EventLevel::Info,
                        Some(&task.id),
                        Some(&step.id),
                    )
                    .await?;
                return Ok(StepOutcome {
                    status: StepOutcomeStatus::Canceled,
                    reason: "run_canceled".to_string(),
                    micro_steps,
                });
            }

            if start_time.elapsed().as_secs() > cfg.max_total_time_s {
                return self
                    .finish(run, step, task, StepOutcome::failed("max_time", micro_steps))
                    .await;
            }

            let obs_before = self
                .observe(run, step, task, "before", last_observation.as_ref(), &cfg)
                .await?;

            // Propose, with a bounded parse/LLM retry and user help on exhaustion.
            let mut action: Option<MicroAction> = None;
            let mut last_error = String::new();
            for attempt in 0..=cfg.max_action_retries {
                match self
                    .propose_action(run, step, task, &obs_before, last_action_summary.as_deref())
                    .await
                {
                    Ok(proposed) => {
                        action = Some(proposed);
                        break;
                    }
                    Err(error) => {
                        last_error = error;
                        if attempt < cfg.max_action_retries {
                            self.bus
                                .emit(
                                    &run.id,
                                    EventType::StepRetrying,
                                    "Повтор запроса действия",
                                    json!({ "attempt": attempt + 1, "reason": last_error }),
                                    EventLevel::Warning,
                                    Some(&task.id),
                                    Some(&step.id),
                                )
                                .await?;
                        }
                    }
                }
            }

            let Some(action) = action else {
                let reason = if last_error.is_empty() {
                    "action_missing".to_string()
                } else {
                    last_error
                };
                if self.gate.request_user_help(run, step, task, &reason).await? {
                    continue;
                }
                return self
                    .finish(run, step, task, StepOutcome::failed(&reason, micro_steps))
                    .await;
            };

            self.bus
                .emit(
                    &run.id,
                    EventType::MicroActionProposed,
                    "Предложено действие",
                    json!({
                        "action_type": action.kind(),
                        "action_summary": action.summarize(),
                    }),
                    EventLevel::Info,
                    Some(&task.id),
                    Some(&step.id),
                )
                .await?;

            if action == MicroAction::Done {
                return self
                    .finish(run, step, task, StepOutcome::done("model_done", micro_steps))
                    .await;
            }

            let executed_ok = self.execute_action(&action, &obs_before, &cfg).await;
            self.bus
                .emit(
                    &run.id,
                    EventType::MicroActionExecuted,
                    "Действие выполнено",
                    json!({ "action_type": action.kind(), "ok": executed_ok }),
                    EventLevel::Info,
                    Some(&task.id),
                    Some(&step.id),
                )
                .await?;

            if !executed_ok {
                return self
                    .finish(run, step, task, StepOutcome::failed("action_failed", micro_steps))
                    .await;
            }

            let dwell_ms = match &action {
                MicroAction::Wait { ms } => (*ms).max(0) as u64,
                _ => cfg.wait_after_act_ms,
            };
            tokio::time::sleep(Duration::from_millis(dwell_ms)).await;

            let obs_after = self
                .observe(run, step, task, "after", Some(&obs_before), &cfg)
                .await?;
            let (verify_result, verify_details, final_obs) = self
                .verify_progress(run, step, task, &obs_before, obs_after, &cfg)
                .await?;
            self.bus
                .emit(
                    &run.id,
                    EventType::VerificationResult,
                    "Результат проверки",
                    json!({ "result": verify_result, "details": verify_details }),
                    EventLevel::Info,
                    Some(&task.id),
                    Some(&step.id),
                )
                .await?;

            micro_steps += 1;
            last_action_summary = Some(action.summarize());
            last_observation = Some(final_obs);

            if verify_result == "pass_progress" {
                no_progress = 0;
            } else {
                no_progress += 1;
                self.bus
                    .emit(
                        &run.id,
                        EventType::StepRetrying,
                        "Повтор шага",
                        json!({ "attempt": no_progress, "reason": verify_result }),
                        EventLevel::Warning,
                        Some(&task.id),
                        Some(&step.id),
                    )
                    .await?;
            }

            if no_progress >= cfg.max_no_progress {
                let reason = format!("no_progress:{}", verify_result);
                if self.gate.request_user_help(run, step, task, &reason).await? {
                    no_progress = 0;
                } else {
                    return self
                        .finish(run, step, task, StepOutcome::failed("no_progress", micro_steps))
                        .await;
                }
            }
        }

        self.finish(run, step, task, StepOutcome::failed("max_micro_steps", micro_steps))
            .await
    }

    async fn finish(
        &self,
        run: &Run,
        step: &PlanStep,
        task: &Task,
        outcome: StepOutcome,
    ) -> Result<StepOutcome> {
        let message = match outcome.status {
            StepOutcomeStatus::Done => "Шаг завершён",
            StepOutcomeStatus::Failed => "Шаг остановлен",
            StepOutcomeStatus::Canceled => "Шаг отменён",
        };
        self.bus
            .emit(
                &run.id,
                EventType::StepExecutionFinished,
                message,
                json!({
                    "status": outcome.status.as_str(),
                    "reason": outcome.reason,
                    "micro_steps": outcome.micro_steps,
                }),
                if outcome.status == StepOutcomeStatus::Failed {
                    EventLevel::Warning
                } else {
                    EventLevel::Info
                },
                Some(&task.id),
                Some(&step.id),
            )
            .await?;
        Ok(outcome)
    }

    async fn run_canceled(&self, run_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get_run(run_id)
            .await?
            .map(|run| run.status == RunStatus::Canceled)
            .unwrap_or(false))
    }

    async fn observe(
        &self,
        run: &Run,
        step: &PlanStep,
        task: &Task,
        phase: &str,
        prev: Option<&Observation>,
        cfg: &ExecutorConfig,
    ) -> Result<Observation> {
        let capture = self
            .bridge
            .capture(cfg.screenshot_width, cfg.screenshot_quality)
            .await
            .map_err(|error| crate::error::EngineError::InvalidOperation(format!(
                "bridge capture failed: {}",
                error
            )))?;

        let image_bytes = base64::engine::general_purpose::STANDARD
            .decode(capture.image_base64.as_bytes())
            .unwrap_or_else(|_| capture.image_base64.clone().into_bytes());
        let digest = if image_bytes.is_empty() {
            String::new()
        } else {
            let mut hasher = Sha256::new();
            hasher.update(&image_bytes);
            format!("{:x}", hasher.finalize())
        };

        let obs = Observation {
            hash: digest,
            width: capture.width,
            height: capture.height,
        };
        let changed = prev
            .map(|prev| !prev.hash.is_empty() && !obs.hash.is_empty() && prev.hash != obs.hash)
            .unwrap_or(false);
        self.bus
            .emit(
                &run.id,
                EventType::ObservationCaptured,
                "Снимок экрана",
                json!({
                    "step_id": step.id,
                    "phase": phase,
                    "hash": obs.hash,
                    "changed": changed,
                    "width": obs.width,
                    "height": obs.height,
                }),
                EventLevel::Info,
                Some(&task.id),
                Some(&step.id),
            )
            .await?;
        Ok(obs)
    }

    async fn propose_action(
        &self,
        run: &Run,
        step: &PlanStep,
        task: &Task,
        obs: &Observation,
        last_action: Option<&str>,
    ) -> std::result::Result<MicroAction, String> {
        let model_input = json!({
            "user_goal": run.query_text,
            "step": {
                "title": step.title,
                "kind": step.kind.as_str(),
                "success_criteria": step.success_criteria,
                "inputs": step.inputs,
            },
            "observation": {
                "screen_hash": obs.hash,
                "screen_width": obs.width,
                "screen_height": obs.height,
            },
            "last_action": last_action,
            "constraints": {
                "one_action_only": true,
                "no_shell": true,
                "no_batch": true,
            },
        });

        let mut request = LlmRequest::new(
            "computer_micro_plan",
            vec![
                ChatMessage::system(MICRO_ACTION_SYSTEM_PROMPT),
                ChatMessage::user(model_input.to_string()),
            ],
        );
        request.json_schema = Some(micro_action_schema());
        request.max_tokens = Some(200);
        request.temperature = 0.2;
        request.run_id = Some(run.id.clone());
        request.task_id = Some(task.id.clone());
        request.step_id = Some(step.id.clone());
        request.qa_mode = run.qa_mode();
        request.context_items = vec![
            ContextItem {
                content: Value::String(run.query_text.clone()),
                source_type: SourceType::UserPrompt,
                sensitivity: Sensitivity::Personal,
                provenance: Some(format!("run:{}", run.id)),
            },
            ContextItem {
                content: model_input["observation"].clone(),
                source_type: SourceType::SystemNote,
                sensitivity: Sensitivity::Personal,
                provenance: Some("observation_summary".to_string()),
            },
        ];

        let response = self.llm.call(request).await.map_err(|error| {
            error.error_type().to_string()
        })?;
        if !response.is_ok() {
            return Err(response
                .error_type
                .unwrap_or_else(|| "budget_exceeded".to_string()));
        }

        let raw = response.text.trim();
        if raw.is_empty() {
            return Ok(MicroAction::Wait { ms: 500 });
        }
        let payload: Value = serde_json::from_str(raw)
            .ok()
            .or_else(|| extract_json(raw))
            .ok_or_else(|| "invalid_action_payload".to_string())?;
        normalize_action(&payload).ok_or_else(|| "invalid_action_payload".to_string())
    }

    async fn execute_action(
        &self,
        action: &MicroAction,
        obs: &Observation,
        cfg: &ExecutorConfig,
    ) -> bool {
        if cfg.dry_run {
            return true;
        }
        if matches!(action, MicroAction::Wait { .. }) {
            return true;
        }
        self.bridge
            .act(action, obs.width, obs.height)
            .await
            .is_ok()
    }

    async fn verify_progress(
        &self,
        run: &Run,
        step: &PlanStep,
        task: &Task,
        before: &Observation,
        after: Observation,
        cfg: &ExecutorConfig,
    ) -> Result<(&'static str, Value, Observation)> {
        if !before.hash.is_empty() && !after.hash.is_empty() && before.hash != after.hash {
            return Ok(("pass_progress", json!({ "change": "hash_changed" }), after));
        }

        let mut waited_ms: u64 = 0;
        let mut current = after;
        while waited_ms < cfg.wait_timeout_ms {
            tokio::time::sleep(Duration::from_millis(cfg.wait_poll_ms)).await;
            waited_ms += cfg.wait_poll_ms;
            current = self.observe(run, step, task, "wait", Some(before), cfg).await?;
            if !before.hash.is_empty() && !current.hash.is_empty() && before.hash != current.hash {
                self.bus
                    .emit(
                        &run.id,
                        EventType::StepWaiting,
                        "Ожидание загрузки",
                        json!({ "reason": "screen_change", "waited_ms": waited_ms }),
                        EventLevel::Info,
                        Some(&task.id),
                        Some(&step.id),
                    )
                    .await?;
                return Ok(("pass_progress", json!({ "waited_ms": waited_ms }), current));
            }
        }

        self.bus
            .emit(
                &run.id,
                EventType::StepWaiting,
                "Ожидание без изменений",
                json!({ "reason": "no_change", "waited_ms": waited_ms }),
                EventLevel::Info,
                Some(&task.id),
                Some(&step.id),
            )
            .await?;
        Ok(("timeout", json!({ "waited_ms": waited_ms }), current))
    }
}

fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rejects_incomplete_actions() {
        assert!(normalize_action(&json!({ "action_type": "click", "x": 5 })).is_none());
        assert!(normalize_action(&json!({ "action_type": "drag", "start_x": 1, "start_y": 2, "end_x": 3 })).is_none());
        assert!(normalize_action(&json!({ "action_type": "key", "keys": [] })).is_none());
        assert!(normalize_action(&json!({ "action_type": "run_shell", "cmd": "rm -rf" })).is_none());
    }

    #[test]
    fn normalize_accepts_canonical_actions() {
        assert_eq!(
            normalize_action(&json!({ "action_type": "click", "x": 10, "y": 20 })),
            Some(MicroAction::Click { x: 10, y: 20, button: None })
        );
        assert_eq!(
            normalize_action(&json!({ "action_type": "key", "key": "ENTER" })),
            Some(MicroAction::Key { keys: vec!["ENTER".to_string()] })
        );
        assert_eq!(
            normalize_action(&json!({ "action_type": "wait" })),
            Some(MicroAction::Wait { ms: 500 })
        );
        assert_eq!(normalize_action(&json!({ "type": "done" })), Some(MicroAction::Done));
    }

    #[test]
    fn summaries_hide_typed_text() {
        let action = MicroAction::Type { text: "секретный пароль".to_string() };
        let summary = action.summarize();
        assert!(!summary.contains("секретный"));
        assert!(summary.starts_with("type:"));
    }

    #[test]
    fn extract_json_salvages_wrapped_payloads() {
        let text = "вот действие: {\"action_type\": \"done\"} готово";
        let payload = extract_json(text).unwrap();
        assert_eq!(normalize_action(&payload), Some(MicroAction::Done));
    }
}
