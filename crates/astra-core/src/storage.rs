// SQLite persistence port. One connection behind an async mutex, WAL mode,
// schema created on open. Writes are row-granular; callers never assume
// cross-row transactions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tokio::sync::Mutex;

use astra_types::{
    Approval, ApprovalStatus, Artifact, ChatTurn, Conflict, ConflictStatus, Event, EventLevel,
    EventType, Fact, MemoryMeta, PlanStep, Project, Run, RunMode, RunStatus, SessionTokenHash,
    Source, StepKind, StepStatus, Task, TaskStatus, UserMemory,
};

use crate::error::{AstraError, Result};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    max_memory_chars: usize,
}

impl SqliteStore {
    pub fn open(db_path: &Path, max_memory_chars: usize) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn, max_memory_chars)
    }

    pub fn open_in_memory(max_memory_chars: usize) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, max_memory_chars)
    }

    fn from_connection(conn: Connection, max_memory_chars: usize) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())).ok();
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            max_memory_chars,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.try_lock().map_err(|_| {
            AstraError::InvalidOperation("store initialized while already locked".to_string())
        })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                tags_json TEXT NOT NULL DEFAULT '[]',
                settings_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                query_text TEXT NOT NULL,
                mode TEXT NOT NULL,
                purpose TEXT,
                parent_run_id TEXT,
                status TEXT NOT NULL,
                meta_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS plan_steps (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                skill_name TEXT NOT NULL,
                title TEXT,
                inputs_json TEXT NOT NULL DEFAULT '{}',
                depends_on_json TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                success_criteria TEXT,
                danger_flags_json TEXT NOT NULL DEFAULT '[]',
                requires_approval INTEGER NOT NULL DEFAULT 0,
                artifacts_expected_json TEXT NOT NULL DEFAULT '[]',
                UNIQUE(run_id, step_index)
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                task_id TEXT,
                step_id TEXT,
                type TEXT NOT NULL,
                message TEXT NOT NULL,
                payload_json TEXT NOT NULL DEFAULT '{}',
                level TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, id);
            CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                proposed_actions_json TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                decision TEXT,
                decided_by TEXT,
                decided_at TEXT
            );
            CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT,
                domain TEXT,
                quality REAL,
                retrieved_at TEXT NOT NULL,
                snippet TEXT,
                pinned INTEGER NOT NULL DEFAULT 0,
                UNIQUE(run_id, url)
            );
            CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                statement TEXT NOT NULL,
                confidence REAL,
                source_ids_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS conflicts (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                detail TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS artifacts (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                type TEXT NOT NULL,
                title TEXT NOT NULL,
                content_uri TEXT NOT NULL,
                created_at TEXT NOT NULL,
                meta_json TEXT NOT NULL DEFAULT '{}'
            );
            CREATE TABLE IF NOT EXISTS user_memories (
                id TEXT PRIMARY KEY,
                title TEXT,
                content TEXT NOT NULL,
                tags_json TEXT NOT NULL DEFAULT '[]',
                pinned INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL,
                meta_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS session_token (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                token_hash TEXT NOT NULL,
                salt TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // ========================================================================
    // Projects
    // ========================================================================

    pub async fn create_project(&self, name: &str, tags: &[String], settings: &Value) -> Result<Project> {
        let project = Project {
            id: astra_types::new_id(),
            name: name.to_string(),
            tags: tags.to_vec(),
            settings: settings.clone(),
            created_at: Utc::now(),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO projects (id, name, tags_json, settings_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project.id,
                project.name,
                serde_json::to_string(&project.tags)?,
                serde_json::to_string(&project.settings)?,
                project.created_at.to_rfc3339(),
            ],
        )?;
        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock().await;
        let project = conn
            .query_row(
                "SELECT id, name, tags_json, settings_json, created_at FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, tags_json, settings_json, created_at FROM projects ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], project_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ========================================================================
    // Runs
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    pub async fn create_run(
        &self,
        project_id: &str,
        query_text: &str,
        mode: RunMode,
        parent_run_id: Option<&str>,
        purpose: Option<&str>,
        meta: Value,
    ) -> Result<Run> {
        let run = Run {
            id: astra_types::new_id(),
            project_id: project_id.to_string(),
            query_text: query_text.to_string(),
            mode,
            purpose: purpose.map(str::to_string),
            parent_run_id: parent_run_id.map(str::to_string),
            status: RunStatus::Created,
            meta,
            created_at: Utc::now(),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO runs (id, project_id, query_text, mode, purpose, parent_run_id, status, meta_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id,
                run.project_id,
                run.query_text,
                run.mode.as_str(),
                run.purpose,
                run.parent_run_id,
                run.status.as_str(),
                serde_json::to_string(&run.meta)?,
                run.created_at.to_rfc3339(),
            ],
        )?;
        Ok(run)
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let conn = self.conn.lock().await;
        let run = conn
            .query_row(
                "SELECT id, project_id, query_text, mode, purpose, parent_run_id, status, meta_json, created_at
                 FROM runs WHERE id = ?1",
                params![id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub async fn update_run_status(&self, id: &str, status: RunStatus) -> Result<Option<Run>> {
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE runs SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
        }
        self.get_run(id).await
    }

    pub async fn update_run_meta_and_mode(
        &self,
        id: &str,
        mode: RunMode,
        purpose: Option<&str>,
        meta: Value,
    ) -> Result<Option<Run>> {
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE runs SET mode = ?1, purpose = ?2, meta_json = ?3 WHERE id = ?4",
                params![mode.as_str(), purpose, serde_json::to_string(&meta)?, id],
            )?;
        }
        self.get_run(id).await
    }

    /// Merge additional keys into run meta without clobbering existing ones.
    pub async fn merge_run_meta(&self, id: &str, patch: &Value) -> Result<Option<Run>> {
        let Some(run) = self.get_run(id).await? else {
            return Ok(None);
        };
        let mut meta = run.meta.clone();
        if let (Some(base), Some(extra)) = (meta.as_object_mut(), patch.as_object()) {
            for (key, value) in extra {
                base.insert(key.clone(), value.clone());
            }
        }
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE runs SET meta_json = ?1 WHERE id = ?2",
                params![serde_json::to_string(&meta)?, id],
            )?;
        }
        self.get_run(id).await
    }

    pub async fn list_runs_for_project(&self, project_id: &str, limit: usize) -> Result<Vec<Run>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, query_text, mode, purpose, parent_run_id, status, meta_json, created_at
             FROM runs WHERE project_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit as i64], run_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Reconstruct the recent chat history of a project from its runs: the
    /// query text is the user turn, the final `chat_response_generated`
    /// payload the assistant turn. Oldest first.
    pub async fn list_recent_chat_turns(
        &self,
        project_id: &str,
        limit_turns: usize,
    ) -> Result<Vec<ChatTurn>> {
        let runs = self.list_runs_for_project(project_id, limit_turns).await?;
        let mut turns: Vec<ChatTurn> = Vec::new();
        for run in runs.into_iter().rev() {
            turns.push(ChatTurn::user(run.query_text.clone()));
            let reply = {
                let conn = self.conn.lock().await;
                conn.query_row(
                    "SELECT payload_json FROM events
                     WHERE run_id = ?1 AND type = 'chat_response_generated'
                     ORDER BY id DESC LIMIT 1",
                    params![run.id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
            };
            if let Some(payload_json) = reply {
                if let Ok(payload) = serde_json::from_str::<Value>(&payload_json) {
                    if let Some(text) = payload.get("text").and_then(Value::as_str) {
                        if !text.trim().is_empty() {
                            turns.push(ChatTurn::assistant(text.to_string()));
                        }
                    }
                }
            }
        }
        if turns.len() > limit_turns * 2 {
            turns = turns.split_off(turns.len() - limit_turns * 2);
        }
        Ok(turns)
    }

    // ========================================================================
    // Plan steps
    // ========================================================================

    pub async fn insert_plan_steps(&self, steps: &[PlanStep]) -> Result<()> {
        let conn = self.conn.lock().await;
        for step in steps {
            conn.execute(
                "INSERT INTO plan_steps (id, run_id, step_index, kind, skill_name, title, inputs_json,
                    depends_on_json, status, success_criteria, danger_flags_json, requires_approval,
                    artifacts_expected_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    step.id,
                    step.run_id,
                    step.step_index,
                    step.kind.as_str(),
                    step.skill_name,
                    step.title,
                    serde_json::to_string(&step.inputs)?,
                    serde_json::to_string(&step.depends_on)?,
                    step.status.as_str(),
                    step.success_criteria,
                    serde_json::to_string(&step.danger_flags)?,
                    step.requires_approval as i64,
                    serde_json::to_string(&step.artifacts_expected)?,
                ],
            )?;
        }
        Ok(())
    }

    pub async fn list_plan_steps(&self, run_id: &str) -> Result<Vec<PlanStep>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, step_index, kind, skill_name, title, inputs_json, depends_on_json,
                    status, success_criteria, danger_flags_json, requires_approval, artifacts_expected_json
             FROM plan_steps WHERE run_id = ?1 ORDER BY step_index",
        )?;
        let rows = stmt.query_map(params![run_id], step_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn get_plan_step(&self, step_id: &str) -> Result<Option<PlanStep>> {
        let conn = self.conn.lock().await;
        let step = conn
            .query_row(
                "SELECT id, run_id, step_index, kind, skill_name, title, inputs_json, depends_on_json,
                        status, success_criteria, danger_flags_json, requires_approval, artifacts_expected_json
                 FROM plan_steps WHERE id = ?1",
                params![step_id],
                step_from_row,
            )
            .optional()?;
        Ok(step)
    }

    pub async fn update_step_status(&self, step_id: &str, status: StepStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE plan_steps SET status = ?1 WHERE id = ?2",
            params![status.as_str(), step_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Create a new task attempt for a step. Fails when a non-terminal task
    /// already exists for the `(run_id, step_id)` pair.
    pub async fn create_task(&self, run_id: &str, step_id: &str) -> Result<Task> {
        let conn = self.conn.lock().await;
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE run_id = ?1 AND step_id = ?2 AND status IN ('created', 'running', 'waiting_approval')",
            params![run_id, step_id],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Err(AstraError::Conflict(format!(
                "step {} already has a non-terminal task",
                step_id
            )));
        }
        let attempt: i64 = conn.query_row(
            "SELECT COALESCE(MAX(attempt), 0) + 1 FROM tasks WHERE run_id = ?1 AND step_id = ?2",
            params![run_id, step_id],
            |row| row.get(0),
        )?;
        let task = Task {
            id: astra_types::new_id(),
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            attempt,
            status: TaskStatus::Created,
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO tasks (id, run_id, step_id, attempt, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task.id,
                task.run_id,
                task.step_id,
                task.attempt,
                task.status.as_str(),
                task.created_at.to_rfc3339(),
            ],
        )?;
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                "SELECT id, run_id, step_id, attempt, status, created_at FROM tasks WHERE id = ?1",
                params![task_id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub async fn list_tasks(&self, run_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, step_id, attempt, status, created_at FROM tasks
             WHERE run_id = ?1 ORDER BY created_at, attempt",
        )?;
        let rows = stmt.query_map(params![run_id], task_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![status.as_str(), task_id],
        )?;
        Ok(())
    }

    pub async fn cancel_open_tasks(&self, run_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count = conn.execute(
            "UPDATE tasks SET status = 'canceled'
             WHERE run_id = ?1 AND status IN ('created', 'running', 'waiting_approval')",
            params![run_id],
        )?;
        Ok(count)
    }

    // ========================================================================
    // Events
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    pub async fn append_event(
        &self,
        run_id: &str,
        event_type: EventType,
        message: &str,
        payload: &Value,
        level: EventLevel,
        task_id: Option<&str>,
        step_id: Option<&str>,
    ) -> Result<Event> {
        let ts = Utc::now();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (run_id, task_id, step_id, type, message, payload_json, level, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                task_id,
                step_id,
                event_type.as_str(),
                message,
                serde_json::to_string(payload)?,
                level.as_str(),
                ts.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Event {
            id,
            run_id: run_id.to_string(),
            task_id: task_id.map(str::to_string),
            step_id: step_id.map(str::to_string),
            event_type,
            message: message.to_string(),
            payload: payload.clone(),
            level,
            ts,
        })
    }

    /// Last `limit` events in append order.
    pub async fn list_events(&self, run_id: &str, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, task_id, step_id, type, message, payload_json, level, ts
             FROM (SELECT * FROM events WHERE run_id = ?1 ORDER BY id DESC LIMIT ?2)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id, limit as i64], event_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn list_events_after(&self, run_id: &str, after_id: i64) -> Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, task_id, step_id, type, message, payload_json, level, ts
             FROM events WHERE run_id = ?1 AND id > ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id, after_id], event_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ========================================================================
    // Approvals
    // ========================================================================

    pub async fn create_approval(
        &self,
        run_id: &str,
        task_id: &str,
        scope: &str,
        title: &str,
        description: &str,
        proposed_actions: &[Value],
    ) -> Result<Approval> {
        let approval = Approval {
            id: astra_types::new_id(),
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            scope: scope.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            proposed_actions: proposed_actions.to_vec(),
            status: ApprovalStatus::Pending,
            decision: None,
            decided_by: None,
            decided_at: None,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO approvals (id, run_id, task_id, scope, title, description, proposed_actions_json, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                approval.id,
                approval.run_id,
                approval.task_id,
                approval.scope,
                approval.title,
                approval.description,
                serde_json::to_string(&approval.proposed_actions)?,
                approval.status.as_str(),
            ],
        )?;
        Ok(approval)
    }

    pub async fn get_approval(&self, id: &str) -> Result<Option<Approval>> {
        let conn = self.conn.lock().await;
        let approval = conn
            .query_row(
                "SELECT id, run_id, task_id, scope, title, description, proposed_actions_json,
                        status, decision, decided_by, decided_at
                 FROM approvals WHERE id = ?1",
                params![id],
                approval_from_row,
            )
            .optional()?;
        Ok(approval)
    }

    pub async fn list_approvals(&self, run_id: &str) -> Result<Vec<Approval>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, task_id, scope, title, description, proposed_actions_json,
                    status, decision, decided_by, decided_at
             FROM approvals WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![run_id], approval_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Decide an approval. Terminal approvals are never modified; the stored
    /// row is returned unchanged so a second decision is a no-op.
    pub async fn update_approval_status(
        &self,
        id: &str,
        status: ApprovalStatus,
        decided_by: &str,
    ) -> Result<Option<Approval>> {
        let Some(existing) = self.get_approval(id).await? else {
            return Ok(None);
        };
        if existing.status.is_terminal() {
            return Ok(Some(existing));
        }
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE approvals SET status = ?1, decision = ?2, decided_by = ?3, decided_at = ?4
                 WHERE id = ?5 AND status = 'pending'",
                params![
                    status.as_str(),
                    status.as_str(),
                    decided_by,
                    Utc::now().to_rfc3339(),
                    id,
                ],
            )?;
        }
        self.get_approval(id).await
    }

    /// Run cancellation expires every pending approval of the run.
    pub async fn expire_pending_approvals(&self, run_id: &str) -> Result<Vec<Approval>> {
        let pending: Vec<String> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn
                .prepare("SELECT id FROM approvals WHERE run_id = ?1 AND status = 'pending'")?;
            let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        let mut expired = Vec::new();
        for id in pending {
            if let Some(approval) = self
                .update_approval_status(&id, ApprovalStatus::Expired, "system")
                .await?
            {
                expired.push(approval);
            }
        }
        Ok(expired)
    }

    // ========================================================================
    // Sources / facts / conflicts / artifacts
    // ========================================================================

    /// Insert sources, skipping URLs the run already has.
    pub async fn insert_sources(&self, run_id: &str, sources: &[Source]) -> Result<usize> {
        let conn = self.conn.lock().await;
        let mut inserted = 0;
        for source in sources {
            let count = conn.execute(
                "INSERT OR IGNORE INTO sources (id, run_id, url, title, domain, quality, retrieved_at, snippet, pinned)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    source.id,
                    run_id,
                    source.url,
                    source.title,
                    source.domain,
                    source.quality,
                    source.retrieved_at.to_rfc3339(),
                    source.snippet,
                    source.pinned as i64,
                ],
            )?;
            inserted += count;
        }
        Ok(inserted)
    }

    pub async fn list_sources(&self, run_id: &str) -> Result<Vec<Source>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, url, title, domain, quality, retrieved_at, snippet, pinned
             FROM sources WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![run_id], source_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn insert_facts(&self, run_id: &str, facts: &[Fact]) -> Result<()> {
        let conn = self.conn.lock().await;
        for fact in facts {
            conn.execute(
                "INSERT INTO facts (id, run_id, statement, confidence, source_ids_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    fact.id,
                    run_id,
                    fact.statement,
                    fact.confidence,
                    serde_json::to_string(&fact.source_ids)?,
                    fact.created_at.to_rfc3339(),
                ],
            )?;
        }
        Ok(())
    }

    pub async fn list_facts(&self, run_id: &str) -> Result<Vec<Fact>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, statement, confidence, source_ids_json, created_at
             FROM facts WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![run_id], fact_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn create_conflict(&self, run_id: &str, topic: &str, detail: Option<&str>) -> Result<Conflict> {
        let conflict = Conflict {
            id: astra_types::new_id(),
            run_id: run_id.to_string(),
            topic: topic.to_string(),
            detail: detail.map(str::to_string),
            status: ConflictStatus::Open,
            created_at: Utc::now(),
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO conflicts (id, run_id, topic, detail, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conflict.id,
                conflict.run_id,
                conflict.topic,
                conflict.detail,
                conflict.status.as_str(),
                conflict.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conflict)
    }

    pub async fn get_conflict(&self, id: &str) -> Result<Option<Conflict>> {
        let conn = self.conn.lock().await;
        let conflict = conn
            .query_row(
                "SELECT id, run_id, topic, detail, status, created_at FROM conflicts WHERE id = ?1",
                params![id],
                conflict_from_row,
            )
            .optional()?;
        Ok(conflict)
    }

    pub async fn update_conflict_status(&self, id: &str, status: ConflictStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE conflicts SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub async fn list_conflicts(&self, run_id: &str) -> Result<Vec<Conflict>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, topic, detail, status, created_at FROM conflicts WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![run_id], conflict_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Insert artifacts, skipping content URIs the run already has.
    pub async fn insert_artifacts(&self, run_id: &str, artifacts: &[Artifact]) -> Result<usize> {
        let existing: Vec<String> = self
            .list_artifacts(run_id)
            .await?
            .into_iter()
            .map(|artifact| artifact.content_uri)
            .collect();
        let conn = self.conn.lock().await;
        let mut inserted = 0;
        for artifact in artifacts {
            if existing.iter().any(|uri| uri == &artifact.content_uri) {
                continue;
            }
            conn.execute(
                "INSERT INTO artifacts (id, run_id, type, title, content_uri, created_at, meta_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    artifact.id,
                    run_id,
                    artifact.artifact_type,
                    artifact.title,
                    artifact.content_uri,
                    artifact.created_at.to_rfc3339(),
                    serde_json::to_string(&artifact.meta)?,
                ],
            )?;
            inserted += 1;
        }
        Ok(inserted)
    }

    pub async fn list_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, type, title, content_uri, created_at, meta_json
             FROM artifacts WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![run_id], artifact_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ========================================================================
    // User memories
    // ========================================================================

    pub async fn create_user_memory(
        &self,
        title: Option<&str>,
        content: &str,
        tags: &[String],
        source: &str,
        meta: Option<MemoryMeta>,
    ) -> Result<UserMemory> {
        if content.chars().count() > self.max_memory_chars {
            return Err(AstraError::Validation("content_too_long".to_string()));
        }
        let memory = UserMemory {
            id: astra_types::new_id(),
            title: title.map(str::to_string),
            content: content.to_string(),
            tags: tags.to_vec(),
            pinned: false,
            source: source.to_string(),
            meta: meta.unwrap_or_default(),
            created_at: Utc::now(),
            is_deleted: false,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO user_memories (id, title, content, tags_json, pinned, source, meta_json, created_at, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                memory.id,
                memory.title,
                memory.content,
                serde_json::to_string(&memory.tags)?,
                memory.pinned as i64,
                memory.source,
                serde_json::to_string(&memory.meta)?,
                memory.created_at.to_rfc3339(),
            ],
        )?;
        Ok(memory)
    }

    /// Soft-deleted rows never leave this query.
    pub async fn list_user_memories(
        &self,
        limit: usize,
        query: Option<&str>,
    ) -> Result<Vec<UserMemory>> {
        let conn = self.conn.lock().await;
        let pattern = query.map(|q| format!("%{}%", q.trim()));
        let mut stmt = conn.prepare(
            "SELECT id, title, content, tags_json, pinned, source, meta_json, created_at, is_deleted
             FROM user_memories
             WHERE is_deleted = 0 AND (?1 IS NULL OR content LIKE ?1 OR COALESCE(title, '') LIKE ?1)
             ORDER BY pinned DESC, created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, limit as i64], memory_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub async fn delete_user_memory(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count = conn.execute(
            "UPDATE user_memories SET is_deleted = 1 WHERE id = ?1 AND is_deleted = 0",
            params![id],
        )?;
        Ok(count > 0)
    }

    // ========================================================================
    // Session token
    // ========================================================================

    pub async fn get_session_token_hash(&self) -> Result<Option<SessionTokenHash>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT token_hash, salt FROM session_token WHERE id = 1",
                [],
                |row| {
                    Ok(SessionTokenHash {
                        token_hash: row.get(0)?,
                        salt: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub async fn set_session_token_hash(&self, token_hash: &str, salt: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO session_token (id, token_hash, salt) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET token_hash = excluded.token_hash, salt = excluded.salt",
            params![token_hash, salt],
        )?;
        Ok(())
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_json(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::Null)
}

fn parse_string_list(raw: String) -> Vec<String> {
    serde_json::from_str(&raw).unwrap_or_default()
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        tags: parse_string_list(row.get(2)?),
        settings: parse_json(row.get(3)?),
        created_at: parse_ts(row.get(4)?)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let mode: String = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(Run {
        id: row.get(0)?,
        project_id: row.get(1)?,
        query_text: row.get(2)?,
        mode: RunMode::parse(&mode).unwrap_or(RunMode::PlanOnly),
        purpose: row.get(4)?,
        parent_run_id: row.get(5)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Created),
        meta: parse_json(row.get(7)?),
        created_at: parse_ts(row.get(8)?)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<PlanStep> {
    let kind: String = row.get(3)?;
    let status: String = row.get(8)?;
    let requires_approval: i64 = row.get(11)?;
    Ok(PlanStep {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_index: row.get(2)?,
        kind: StepKind::parse(&kind).unwrap_or(StepKind::ChatResponse),
        skill_name: row.get(4)?,
        title: row.get(5)?,
        inputs: parse_json(row.get(6)?),
        depends_on: parse_string_list(row.get(7)?),
        status: StepStatus::parse(&status).unwrap_or(StepStatus::Created),
        success_criteria: row.get(9)?,
        danger_flags: parse_string_list(row.get(10)?),
        requires_approval: requires_approval != 0,
        artifacts_expected: parse_string_list(row.get(12)?),
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    Ok(Task {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        attempt: row.get(3)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Created),
        created_at: parse_ts(row.get(5)?)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let ty: String = row.get(4)?;
    let level: String = row.get(7)?;
    let event_type = ty.parse::<EventType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Event {
        id: row.get(0)?,
        run_id: row.get(1)?,
        task_id: row.get(2)?,
        step_id: row.get(3)?,
        event_type,
        message: row.get(5)?,
        payload: parse_json(row.get(6)?),
        level: EventLevel::parse(&level).unwrap_or(EventLevel::Info),
        ts: parse_ts(row.get(8)?)?,
    })
}

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<Approval> {
    let status: String = row.get(7)?;
    let decided_at: Option<String> = row.get(10)?;
    Ok(Approval {
        id: row.get(0)?,
        run_id: row.get(1)?,
        task_id: row.get(2)?,
        scope: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        proposed_actions: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        status: ApprovalStatus::parse(&status).unwrap_or(ApprovalStatus::Pending),
        decision: row.get(8)?,
        decided_by: row.get(9)?,
        decided_at: decided_at.map(parse_ts).transpose()?,
    })
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    let pinned: i64 = row.get(8)?;
    Ok(Source {
        id: row.get(0)?,
        run_id: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        domain: row.get(4)?,
        quality: row.get(5)?,
        retrieved_at: parse_ts(row.get(6)?)?,
        snippet: row.get(7)?,
        pinned: pinned != 0,
    })
}

fn fact_from_row(row: &Row<'_>) -> rusqlite::Result<Fact> {
    Ok(Fact {
        id: row.get(0)?,
        run_id: row.get(1)?,
        statement: row.get(2)?,
        confidence: row.get(3)?,
        source_ids: parse_string_list(row.get(4)?),
        created_at: parse_ts(row.get(5)?)?,
    })
}

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<Conflict> {
    let status: String = row.get(4)?;
    Ok(Conflict {
        id: row.get(0)?,
        run_id: row.get(1)?,
        topic: row.get(2)?,
        detail: row.get(3)?,
        status: ConflictStatus::parse(&status).unwrap_or(ConflictStatus::Open),
        created_at: parse_ts(row.get(5)?)?,
    })
}

fn artifact_from_row(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        id: row.get(0)?,
        run_id: row.get(1)?,
        artifact_type: row.get(2)?,
        title: row.get(3)?,
        content_uri: row.get(4)?,
        created_at: parse_ts(row.get(5)?)?,
        meta: parse_json(row.get(6)?),
    })
}

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<UserMemory> {
    let pinned: i64 = row.get(4)?;
    let is_deleted: i64 = row.get(8)?;
    Ok(UserMemory {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        tags: parse_string_list(row.get(3)?),
        pinned: pinned != 0,
        source: row.get(5)?,
        meta: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        created_at: parse_ts(row.get(7)?)?,
        is_deleted: is_deleted != 0,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(4000).unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_run() {
        let store = store();
        let project = store.create_project("inbox", &[], &json!({})).await.unwrap();
        let run = store
            .create_run(&project.id, "привет", RunMode::PlanOnly, None, None, json!({}))
            .await
            .unwrap();

        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.query_text, "привет");
        assert_eq!(loaded.status, RunStatus::Created);

        let updated = store
            .update_run_status(&run.id, RunStatus::Running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn events_keep_append_order() {
        let store = store();
        for i in 0..5 {
            store
                .append_event(
                    "run-1",
                    EventType::TaskProgress,
                    &format!("msg {}", i),
                    &json!({"i": i}),
                    EventLevel::Info,
                    None,
                    None,
                )
                .await
                .unwrap();
        }
        let events = store.list_events("run-1", 3).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|pair| pair[0].id < pair[1].id));
        assert_eq!(events[2].message, "msg 4");
    }

    #[tokio::test]
    async fn single_non_terminal_task_per_step() {
        let store = store();
        let task = store.create_task("run-1", "step-1").await.unwrap();
        assert_eq!(task.attempt, 1);

        assert!(store.create_task("run-1", "step-1").await.is_err());

        store
            .update_task_status(&task.id, TaskStatus::Failed)
            .await
            .unwrap();
        let retry = store.create_task("run-1", "step-1").await.unwrap();
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn terminal_approval_is_immutable() {
        let store = store();
        let approval = store
            .create_approval("run-1", "task-1", "computer_step", "t", "d", &[])
            .await
            .unwrap();

        let rejected = store
            .update_approval_status(&approval.id, ApprovalStatus::Rejected, "owner")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rejected.status, ApprovalStatus::Rejected);
        assert!(rejected.decided_at.is_some());

        // Second decision is a no-op.
        let again = store
            .update_approval_status(&approval.id, ApprovalStatus::Approved, "owner")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.status, ApprovalStatus::Rejected);
        assert_eq!(again.decided_at, rejected.decided_at);
    }

    #[tokio::test]
    async fn duplicate_source_urls_are_ignored_per_run() {
        let store = store();
        let source = Source {
            id: astra_types::new_id(),
            run_id: "run-1".to_string(),
            url: "https://example.org/a".to_string(),
            title: None,
            domain: Some("example.org".to_string()),
            quality: None,
            retrieved_at: Utc::now(),
            snippet: None,
            pinned: false,
        };
        let mut dup = source.clone();
        dup.id = astra_types::new_id();

        let inserted = store.insert_sources("run-1", &[source, dup]).await.unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.list_sources("run-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn soft_deleted_memories_never_listed() {
        let store = store();
        let memory = store
            .create_user_memory(Some("профиль"), "Зовут Ира", &[], "auto", None)
            .await
            .unwrap();
        assert_eq!(store.list_user_memories(10, None).await.unwrap().len(), 1);

        assert!(store.delete_user_memory(&memory.id).await.unwrap());
        assert!(store.list_user_memories(10, None).await.unwrap().is_empty());
        // Double delete reports nothing to do.
        assert!(!store.delete_user_memory(&memory.id).await.unwrap());
    }

    #[tokio::test]
    async fn oversized_memory_content_is_rejected() {
        let store = SqliteStore::open_in_memory(10).unwrap();
        let err = store
            .create_user_memory(None, "очень длинное содержимое памяти", &[], "auto", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AstraError::Validation(ref code) if code == "content_too_long"));
    }
}
