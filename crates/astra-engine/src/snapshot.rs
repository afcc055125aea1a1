// Snapshot Builder
// Sequential reads into one aggregate; not transactional, but monotonic with
// respect to emitted events.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use astra_core::SqliteStore;
use astra_types::{
    Approval, Artifact, Conflict, ConflictStatus, Event, Fact, PlanStep, Run, Source, StepStatus,
    Task, TaskStatus,
};

use crate::error::{EngineError, Result};

pub const SNAPSHOT_EVENT_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub plan: Vec<PlanStep>,
    pub tasks: Vec<Task>,
    pub sources: Vec<Source>,
    pub facts: Vec<Fact>,
    pub conflicts: Vec<Conflict>,
    pub artifacts: Vec<Artifact>,
    pub approvals: Vec<Approval>,
    pub metrics: Value,
    pub last_events: Vec<Event>,
}

pub async fn build_snapshot(store: &Arc<SqliteStore>, run_id: &str) -> Result<RunSnapshot> {
    let run = store
        .get_run(run_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {}", run_id)))?;
    let plan = store.list_plan_steps(run_id).await?;
    let tasks = store.list_tasks(run_id).await?;
    let sources = store.list_sources(run_id).await?;
    let facts = store.list_facts(run_id).await?;
    let conflicts = store.list_conflicts(run_id).await?;
    let artifacts = store.list_artifacts(run_id).await?;
    let approvals = store.list_approvals(run_id).await?;
    let last_events = store.list_events(run_id, SNAPSHOT_EVENT_LIMIT).await?;

    let (done, total) = if plan.is_empty() {
        (
            tasks.iter().filter(|task| task.status == TaskStatus::Done).count(),
            tasks.len(),
        )
    } else {
        (
            plan.iter().filter(|step| step.status == StepStatus::Done).count(),
            plan.len(),
        )
    };

    let open_conflicts = conflicts
        .iter()
        .filter(|conflict| conflict.status == ConflictStatus::Open)
        .count();

    let timestamps: Vec<_> = sources.iter().map(|source| source.retrieved_at).collect();
    let freshness = if timestamps.is_empty() {
        Value::Null
    } else {
        json!({
            "min": timestamps.iter().min(),
            "max": timestamps.iter().max(),
            "count": timestamps.len(),
        })
    };

    let metrics = json!({
        "coverage": { "done": done, "total": total },
        "conflicts": open_conflicts,
        "freshness": freshness,
    });

    Ok(RunSnapshot {
        run,
        plan,
        tasks,
        sources,
        facts,
        conflicts,
        artifacts,
        approvals,
        metrics,
        last_events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use astra_types::{EventLevel, EventType, RunMode};
    use chrono::Utc;

    #[tokio::test]
    async fn snapshot_aggregates_metrics() {
        let store = Arc::new(SqliteStore::open_in_memory(4000).unwrap());
        let project = store
            .create_project("inbox", &[], &json!({}))
            .await
            .unwrap();
        let run = store
            .create_run(&project.id, "найди новости", RunMode::Research, None, None, json!({}))
            .await
            .unwrap();
        store
            .append_event(
                &run.id,
                EventType::RunCreated,
                "Запуск создан",
                &json!({}),
                EventLevel::Info,
                None,
                None,
            )
            .await
            .unwrap();
        let source = Source {
            id: astra_types::new_id(),
            run_id: run.id.clone(),
            url: "https://example.org/a".to_string(),
            title: None,
            domain: None,
            quality: None,
            retrieved_at: Utc::now(),
            snippet: None,
            pinned: false,
        };
        store.insert_sources(&run.id, &[source]).await.unwrap();
        store.create_conflict(&run.id, "даты расходятся", None).await.unwrap();

        let snapshot = build_snapshot(&store, &run.id).await.unwrap();
        assert_eq!(snapshot.metrics["conflicts"], 1);
        assert_eq!(snapshot.metrics["freshness"]["count"], 1);
        assert_eq!(snapshot.last_events.len(), 1);
        assert_eq!(snapshot.sources.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_unknown_run_is_not_found() {
        let store = Arc::new(SqliteStore::open_in_memory(4000).unwrap());
        assert!(matches!(
            build_snapshot(&store, "missing").await,
            Err(EngineError::NotFound(_))
        ));
    }
}
