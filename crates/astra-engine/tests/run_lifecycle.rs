// Run engine lifecycle: plan creation, dependency-ordered execution,
// cancel/retry semantics, and the one-non-terminal-task invariant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use astra_brain::{BrainError, LlmClient, LlmRequest, LlmResponse, ResponseStatus};
use astra_core::{EventBus, SqliteStore};
use astra_engine::{
    ApprovalGate, Capture, ComputerExecutor, DesktopBridge, ExecutorConfig, RunEngine,
};
use astra_skills::{MemorySaveSkill, SkillRegistry, StubFetcher, StubSearchClient, WebResearchSkill};
use astra_types::{RunMode, RunStatus, StepStatus, TaskStatus};

#[derive(Default)]
struct DoneBridge {
    frames: AtomicU64,
}

#[async_trait]
impl DesktopBridge for DoneBridge {
    async fn capture(&self, _max_width: u32, _quality: u32) -> anyhow::Result<Capture> {
        Ok(Capture {
            image_base64: format!("frame-{}", self.frames.fetch_add(1, Ordering::SeqCst)),
            width: 1280,
            height: 800,
        })
    }

    async fn act(
        &self,
        _action: &astra_engine::MicroAction,
        _w: u32,
        _h: u32,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// LLM stub: every proposal is `done`, every chat turn is a short answer.
struct DoneLlm;

#[async_trait]
impl LlmClient for DoneLlm {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, BrainError> {
        let text = if request.purpose == "computer_micro_plan" {
            json!({ "action_type": "done" }).to_string()
        } else {
            "Готово: план выполнен, все шаги завершены.".to_string()
        };
        Ok(LlmResponse {
            text,
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

async fn engine_fixture() -> (Arc<SqliteStore>, EventBus, Arc<RunEngine>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open_in_memory(4000).unwrap());
    let bus = EventBus::new(store.clone());
    let llm: Arc<dyn LlmClient> = Arc::new(DoneLlm);

    let mut registry = SkillRegistry::new();
    registry.register(Arc::new(MemorySaveSkill));
    registry.register(Arc::new(WebResearchSkill::new(
        Arc::new(StubSearchClient),
        Arc::new(StubFetcher),
        llm.clone(),
    )));

    let gate = ApprovalGate::new(store.clone(), bus.clone());
    let executor = Arc::new(
        ComputerExecutor::new(
            Arc::new(DoneBridge::default()),
            llm.clone(),
            store.clone(),
            bus.clone(),
            gate,
        )
            .with_config(ExecutorConfig {
                wait_after_act_ms: 0,
                wait_poll_ms: 50,
                wait_timeout_ms: 100,
                ..ExecutorConfig::default()
            }),
    );
    let engine = Arc::new(RunEngine::new(
        store.clone(),
        bus.clone(),
        registry,
        executor,
        llm,
        tmp.path().to_path_buf(),
    ));
    (store, bus, engine, tmp)
}

async fn wait_for_status(store: &Arc<SqliteStore>, run_id: &str, wanted: RunStatus) -> bool {
    for _ in 0..100 {
        if let Some(run) = store.get_run(run_id).await.unwrap() {
            if run.status == wanted {
                return true;
            }
            if run.status.is_terminal() && run.status != wanted {
                return false;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn act_run_executes_plan_to_done() {
    let (store, _bus, engine, _tmp) = engine_fixture().await;
    let project = store.create_project("inbox", &[], &json!({})).await.unwrap();
    let run = store
        .create_run(
            &project.id,
            "открой браузер и проверь почту",
            RunMode::AutopilotSafe,
            None,
            None,
            json!({}),
        )
        .await
        .unwrap();

    let plan = engine.create_plan(&run).await.unwrap();
    assert!(plan.len() >= 2);
    engine.start_run(&run.id).await.unwrap();

    assert!(wait_for_status(&store, &run.id, RunStatus::Done).await);

    let steps = store.list_plan_steps(&run.id).await.unwrap();
    assert!(steps.iter().all(|step| step.status == StepStatus::Done));

    // Every step got exactly one attempt, and none are left non-terminal.
    let tasks = store.list_tasks(&run.id).await.unwrap();
    assert_eq!(tasks.len(), steps.len());
    assert!(tasks.iter().all(|task| task.status == TaskStatus::Done));
}

#[tokio::test]
async fn dependencies_gate_task_creation() {
    let (store, _bus, engine, _tmp) = engine_fixture().await;
    let project = store.create_project("inbox", &[], &json!({})).await.unwrap();
    let run = store
        .create_run(
            &project.id,
            "разбери файлы в загрузках",
            RunMode::AutopilotSafe,
            None,
            None,
            json!({}),
        )
        .await
        .unwrap();
    let plan = engine.create_plan(&run).await.unwrap();
    engine.start_run(&run.id).await.unwrap();
    assert!(wait_for_status(&store, &run.id, RunStatus::Done).await);

    // Task creation order must follow the dependency chain.
    let tasks = store.list_tasks(&run.id).await.unwrap();
    let order_of = |step_id: &str| {
        tasks
            .iter()
            .position(|task| task.step_id == step_id)
            .unwrap()
    };
    for step in &plan {
        for dep in &step.depends_on {
            assert!(order_of(dep) < order_of(&step.id));
        }
    }
}

#[tokio::test]
async fn cancel_is_idempotent_and_no_op_on_done() {
    let (store, _bus, engine, _tmp) = engine_fixture().await;
    let project = store.create_project("inbox", &[], &json!({})).await.unwrap();
    let run = store
        .create_run(
            &project.id,
            "открой браузер",
            RunMode::AutopilotSafe,
            None,
            None,
            json!({}),
        )
        .await
        .unwrap();
    engine.create_plan(&run).await.unwrap();
    engine.start_run(&run.id).await.unwrap();
    assert!(wait_for_status(&store, &run.id, RunStatus::Done).await);

    // Cancelling a completed run leaves it done.
    let after_cancel = engine.cancel_run(&run.id).await.unwrap();
    assert_eq!(after_cancel.status, RunStatus::Done);
}

#[tokio::test]
async fn retry_step_creates_new_attempt() {
    let (store, _bus, engine, _tmp) = engine_fixture().await;
    let project = store.create_project("inbox", &[], &json!({})).await.unwrap();
    let run = store
        .create_run(
            &project.id,
            "открой браузер",
            RunMode::AutopilotSafe,
            None,
            None,
            json!({}),
        )
        .await
        .unwrap();
    let plan = engine.create_plan(&run).await.unwrap();
    engine.start_run(&run.id).await.unwrap();
    assert!(wait_for_status(&store, &run.id, RunStatus::Done).await);

    let step = plan.first().unwrap();
    engine.retry_step(&run.id, &step.id).await.unwrap();
    assert!(wait_for_status(&store, &run.id, RunStatus::Done).await);

    let attempts: Vec<i64> = store
        .list_tasks(&run.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|task| task.step_id == step.id)
        .map(|task| task.attempt)
        .collect();
    assert!(attempts.contains(&1));
    assert!(attempts.contains(&2));
}
