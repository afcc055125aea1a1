// Executor micro-loop scenarios with a fake bridge and scripted proposals:
// approval gating, model-done completion, and no-progress termination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use astra_brain::{BrainError, LlmClient, LlmRequest, LlmResponse, ResponseStatus};
use astra_core::{EventBus, SqliteStore};
use astra_engine::executor::StepOutcomeStatus;
use astra_engine::{ApprovalGate, Capture, ComputerExecutor, DesktopBridge, ExecutorConfig, MicroAction};
use astra_types::{
    ApprovalStatus, EventType, PlanStep, Run, RunMode, RunStatus, StepKind, StepStatus, Task,
    TaskStatus,
};

struct FakeBridge {
    captures: AtomicU64,
    screen_changes: bool,
    actions: Mutex<Vec<String>>,
}

impl FakeBridge {
    fn new(screen_changes: bool) -> Self {
        Self {
            captures: AtomicU64::new(0),
            screen_changes,
            actions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DesktopBridge for FakeBridge {
    async fn capture(&self, _max_width: u32, _quality: u32) -> anyhow::Result<Capture> {
        let n = self.captures.fetch_add(1, Ordering::SeqCst);
        let image = if self.screen_changes {
            format!("screen-{}", n)
        } else {
            "static-screen".to_string()
        };
        Ok(Capture {
            image_base64: image,
            width: 1280,
            height: 800,
        })
    }

    async fn act(&self, action: &MicroAction, _w: u32, _h: u32) -> anyhow::Result<()> {
        self.actions.lock().unwrap().push(action.summarize());
        Ok(())
    }
}

struct ScriptedActions {
    actions: Mutex<Vec<serde_json::Value>>,
    repeat_last: bool,
}

#[async_trait]
impl LlmClient for ScriptedActions {
    async fn call(&self, _request: LlmRequest) -> Result<LlmResponse, BrainError> {
        let mut actions = self.actions.lock().unwrap();
        let payload = if actions.len() > 1 || !self.repeat_last {
            if actions.is_empty() {
                json!({ "action_type": "wait", "ms": 10 })
            } else {
                actions.remove(0)
            }
        } else {
            actions.first().cloned().unwrap_or(json!({ "action_type": "wait", "ms": 10 }))
        };
        Ok(LlmResponse {
            text: payload.to_string(),
            usage: None,
            provider: "local".to_string(),
            model_id: "stub".to_string(),
            latency_ms: 1,
            cache_hit: false,
            route_reason: "strict_local".to_string(),
            status: ResponseStatus::Ok,
            error_type: None,
            http_status: None,
            retry_count: 0,
        })
    }
}

struct Fixture {
    store: Arc<SqliteStore>,
    bus: EventBus,
    run: Run,
    step: PlanStep,
    task: Task,
}

async fn fixture(requires_approval: bool, danger_flags: Vec<String>) -> Fixture {
    let store = Arc::new(SqliteStore::open_in_memory(4000).unwrap());
    let bus = EventBus::new(store.clone());
    let project = store.create_project("inbox", &[], &json!({})).await.unwrap();
    let run = store
        .create_run(
            &project.id,
            "удали старый файл отчёта",
            RunMode::ExecuteConfirm,
            None,
            None,
            json!({}),
        )
        .await
        .unwrap();
    store
        .update_run_status(&run.id, RunStatus::Running)
        .await
        .unwrap();
    let run = store.get_run(&run.id).await.unwrap().unwrap();

    let step = PlanStep {
        id: astra_types::new_id(),
        run_id: run.id.clone(),
        step_index: 0,
        kind: StepKind::ComputerActions,
        skill_name: "computer".to_string(),
        title: Some("Действия на компьютере".to_string()),
        inputs: json!({}),
        depends_on: vec![],
        status: StepStatus::Running,
        success_criteria: None,
        danger_flags,
        requires_approval,
        artifacts_expected: vec![],
    };
    store.insert_plan_steps(std::slice::from_ref(&step)).await.unwrap();
    let task = store.create_task(&run.id, &step.id).await.unwrap();
    store
        .update_task_status(&task.id, TaskStatus::Running)
        .await
        .unwrap();
    let task = store.get_task(&task.id).await.unwrap().unwrap();

    Fixture {
        store,
        bus,
        run,
        step,
        task,
    }
}

fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        max_micro_steps: 10,
        max_no_progress: 2,
        max_total_time_s: 30,
        wait_after_act_ms: 0,
        wait_poll_ms: 50,
        wait_timeout_ms: 100,
        max_action_retries: 1,
        screenshot_width: 1280,
        screenshot_quality: 60,
        dry_run: false,
    }
}

/// Background decider: resolve every pending approval with the same verdict.
fn spawn_decider(store: Arc<SqliteStore>, run_id: String, status: ApprovalStatus) {
    tokio::spawn(async move {
        for _ in 0..100 {
            let approvals = store.list_approvals(&run_id).await.unwrap_or_default();
            for approval in approvals {
                if approval.status == ApprovalStatus::Pending {
                    let _ = store
                        .update_approval_status(&approval.id, status, "owner")
                        .await;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });
}

#[tokio::test]
async fn rejected_approval_fails_step_without_bridge_actions() {
    let fx = fixture(true, vec!["delete_file".to_string()]).await;
    let bridge = Arc::new(FakeBridge::new(true));
    let llm = Arc::new(ScriptedActions {
        actions: Mutex::new(vec![json!({ "action_type": "done" })]),
        repeat_last: false,
    });
    let gate = ApprovalGate::new(fx.store.clone(), fx.bus.clone());
    let executor = ComputerExecutor::new(bridge.clone(), llm, fx.store.clone(), fx.bus.clone(), gate)
        .with_config(fast_config());

    spawn_decider(fx.store.clone(), fx.run.id.clone(), ApprovalStatus::Rejected);
    let outcome = executor
        .execute_step(&fx.run, &fx.step, &fx.task)
        .await
        .unwrap();

    assert_eq!(outcome.status, StepOutcomeStatus::Failed);
    assert_eq!(outcome.reason, "approval_rejected");
    assert_eq!(outcome.micro_steps, 0);
    assert!(bridge.actions.lock().unwrap().is_empty());
    assert_eq!(bridge.captures.load(Ordering::SeqCst), 0);

    let events = fx.store.list_events(&fx.run.id, 100).await.unwrap();
    assert!(events
        .iter()
        .any(|event| event.event_type == EventType::StepPausedForApproval));
    assert!(events
        .iter()
        .any(|event| event.event_type == EventType::ApprovalRejected));
}

#[tokio::test]
async fn approved_step_runs_until_model_done() {
    let fx = fixture(true, vec!["delete_file".to_string()]).await;
    let bridge = Arc::new(FakeBridge::new(true));
    let llm = Arc::new(ScriptedActions {
        actions: Mutex::new(vec![
            json!({ "action_type": "click", "x": 10, "y": 20 }),
            json!({ "action_type": "done" }),
        ]),
        repeat_last: false,
    });
    let gate = ApprovalGate::new(fx.store.clone(), fx.bus.clone());
    let executor = ComputerExecutor::new(bridge.clone(), llm, fx.store.clone(), fx.bus.clone(), gate)
        .with_config(fast_config());

    spawn_decider(fx.store.clone(), fx.run.id.clone(), ApprovalStatus::Approved);
    let outcome = executor
        .execute_step(&fx.run, &fx.step, &fx.task)
        .await
        .unwrap();

    assert_eq!(outcome.status, StepOutcomeStatus::Done);
    assert_eq!(outcome.reason, "model_done");
    assert_eq!(bridge.actions.lock().unwrap().len(), 1);

    let events = fx.store.list_events(&fx.run.id, 100).await.unwrap();
    assert!(events
        .iter()
        .any(|event| event.event_type == EventType::ApprovalApproved));
    assert!(events
        .iter()
        .any(|event| event.event_type == EventType::MicroActionExecuted));
    assert!(events
        .iter()
        .any(|event| event.event_type == EventType::ObservationCaptured));
}

#[tokio::test]
async fn static_screen_ends_in_no_progress_after_denied_help() {
    let fx = fixture(false, vec![]).await;
    let bridge = Arc::new(FakeBridge::new(false));
    let llm = Arc::new(ScriptedActions {
        actions: Mutex::new(vec![json!({ "action_type": "click", "x": 10, "y": 20 })]),
        repeat_last: true,
    });
    let gate = ApprovalGate::new(fx.store.clone(), fx.bus.clone());
    let executor = ComputerExecutor::new(bridge, llm, fx.store.clone(), fx.bus.clone(), gate)
        .with_config(fast_config());

    // The only approval in this scenario is the user-help request; deny it.
    spawn_decider(fx.store.clone(), fx.run.id.clone(), ApprovalStatus::Rejected);
    let outcome = executor
        .execute_step(&fx.run, &fx.step, &fx.task)
        .await
        .unwrap();

    assert_eq!(outcome.status, StepOutcomeStatus::Failed);
    assert_eq!(outcome.reason, "no_progress");

    let events = fx.store.list_events(&fx.run.id, 200).await.unwrap();
    assert!(events.iter().any(|event| {
        event.event_type == EventType::VerificationResult && event.payload["result"] == "timeout"
    }));
    assert!(events
        .iter()
        .any(|event| event.event_type == EventType::UserActionRequired));
    let finished = events
        .iter()
        .rfind(|event| event.event_type == EventType::StepExecutionFinished)
        .unwrap();
    assert_eq!(finished.payload["reason"], "no_progress");
}

#[tokio::test]
async fn cancelled_run_stops_loop_at_safe_point() {
    let fx = fixture(false, vec![]).await;
    let bridge = Arc::new(FakeBridge::new(true));
    let llm = Arc::new(ScriptedActions {
        actions: Mutex::new(vec![json!({ "action_type": "click", "x": 1, "y": 1 })]),
        repeat_last: true,
    });
    let gate = ApprovalGate::new(fx.store.clone(), fx.bus.clone());
    let executor = ComputerExecutor::new(bridge, llm, fx.store.clone(), fx.bus.clone(), gate)
        .with_config(fast_config());

    fx.store
        .update_run_status(&fx.run.id, RunStatus::Canceled)
        .await
        .unwrap();
    let outcome = executor
        .execute_step(&fx.run, &fx.step, &fx.task)
        .await
        .unwrap();

    assert_eq!(outcome.status, StepOutcomeStatus::Canceled);
    let events = fx.store.list_events(&fx.run.id, 50).await.unwrap();
    assert!(events
        .iter()
        .any(|event| event.event_type == EventType::StepCancelledByUser));
}
