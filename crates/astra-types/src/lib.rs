// Shared Astra data types
// Entities mirror the relational store tables; serde shapes are the wire contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod event;
mod intent;
mod skill;

pub use event::{Event, EventLevel, EventType, UnknownEventType};
pub use intent::{ActHint, DecisionPath, Intent, IntentDecision, IntentKind};
pub use skill::{ArtifactCandidate, SkillEvent, SkillResult, SourceCandidate};

// ============================================================================
// Projects & Runs
// ============================================================================

/// A project groups runs and carries open key/value settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub settings: Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Run execution mode requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    PlanOnly,
    Research,
    ExecuteConfirm,
    AutopilotSafe,
}

impl RunMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plan_only" => Some(Self::PlanOnly),
            "research" => Some(Self::Research),
            "execute_confirm" => Some(Self::ExecuteConfirm),
            "autopilot_safe" => Some(Self::AutopilotSafe),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanOnly => "plan_only",
            Self::Research => "research",
            Self::ExecuteConfirm => "execute_confirm",
            Self::AutopilotSafe => "autopilot_safe",
        }
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Planning,
    Running,
    WaitingApproval,
    Paused,
    Done,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "planning" => Some(Self::Planning),
            "running" => Some(Self::Running),
            "waiting_approval" => Some(Self::WaitingApproval),
            "paused" => Some(Self::Paused),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// A single user-initiated request with a lifecycle and plan.
/// Immutable after creation except `status`, `mode`, `purpose`, and `meta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub query_text: String,
    pub mode: RunMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub meta: Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Run {
    pub fn qa_mode(&self) -> bool {
        self.meta
            .get("qa_mode")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// ============================================================================
// Plan steps & tasks
// ============================================================================

/// Declarative step kind; selects the skill that executes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    ChatResponse,
    WebResearch,
    ComputerActions,
    BrowserResearchUi,
    FileOrganize,
    CodeAssist,
    MemoryCommit,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatResponse => "CHAT_RESPONSE",
            Self::WebResearch => "WEB_RESEARCH",
            Self::ComputerActions => "COMPUTER_ACTIONS",
            Self::BrowserResearchUi => "BROWSER_RESEARCH_UI",
            Self::FileOrganize => "FILE_ORGANIZE",
            Self::CodeAssist => "CODE_ASSIST",
            Self::MemoryCommit => "MEMORY_COMMIT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CHAT_RESPONSE" => Some(Self::ChatResponse),
            "WEB_RESEARCH" => Some(Self::WebResearch),
            "COMPUTER_ACTIONS" => Some(Self::ComputerActions),
            "BROWSER_RESEARCH_UI" => Some(Self::BrowserResearchUi),
            "FILE_ORGANIZE" => Some(Self::FileOrganize),
            "CODE_ASSIST" => Some(Self::CodeAssist),
            "MEMORY_COMMIT" => Some(Self::MemoryCommit),
            _ => None,
        }
    }

    /// Kinds driven by the computer executor's micro-action loop.
    pub fn is_computer_kind(self) -> bool {
        matches!(
            self,
            Self::BrowserResearchUi | Self::ComputerActions | Self::FileOrganize | Self::CodeAssist
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Created,
    Running,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// A declarative unit of work inside a run plan.
/// `step_index` is unique per run; `depends_on` must form an acyclic graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub run_id: String,
    pub step_index: i64,
    pub kind: StepKind,
    pub skill_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_criteria: Option<String>,
    #[serde(default)]
    pub danger_flags: Vec<String>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub artifacts_expected: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Running,
    WaitingApproval,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "waiting_approval" => Some(Self::WaitingApproval),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// One execution attempt of a plan step. Retries increment `attempt`; for a
/// given `(run_id, step_id)` at most one task is non-terminal at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub attempt: i64,
    pub status: TaskStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// Approvals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A typed user decision gate that suspends a task until resolved.
/// Terminal approvals are immutable; deciding them again is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub run_id: String,
    pub task_id: String,
    pub scope: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub proposed_actions: Vec<Value>,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<chrono::DateTime<chrono::Utc>>,
}

// ============================================================================
// Derived records
// ============================================================================

/// A web source attached to a run. `url` is normalized; duplicates within a
/// run are rejected on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub run_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    pub retrieved_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub run_id: String,
    pub statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub source_ids: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub run_id: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub status: ConflictStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub title: String,
    pub content_uri: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub meta: Value,
}

// ============================================================================
// User memories
// ============================================================================

/// Structured metadata carried inside a user memory row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub facts: Vec<Value>,
    #[serde(default)]
    pub preferences: Vec<Value>,
    #[serde(default)]
    pub possible_facts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// A long-term user memory. Soft-deleted rows never appear in list APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMemory {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pinned: bool,
    pub source: String,
    #[serde(default)]
    pub meta: MemoryMeta,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

/// The single persisted session-token row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokenHash {
    pub token_hash: String,
    pub salt: String,
}

/// One reconstructed chat turn used as history tail for prompt assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_round_trip() {
        for mode in [
            RunMode::PlanOnly,
            RunMode::Research,
            RunMode::ExecuteConfirm,
            RunMode::AutopilotSafe,
        ] {
            assert_eq!(RunMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(RunMode::parse("autopilot_unsafe"), None);
    }

    #[test]
    fn step_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&StepKind::BrowserResearchUi).unwrap();
        assert_eq!(json, "\"BROWSER_RESEARCH_UI\"");
        assert_eq!(StepKind::parse("MEMORY_COMMIT"), Some(StepKind::MemoryCommit));
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::WaitingApproval.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::WaitingApproval.is_terminal());
        assert!(ApprovalStatus::Expired.is_terminal());
        assert!(!ApprovalStatus::Pending.is_terminal());
    }
}
