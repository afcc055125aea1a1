// Closed event vocabulary. The bus rejects anything that does not parse into
// this enum, and the SSE schema mirrors it one-to-one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunCreated,
    RunFailed,
    IntentDecided,
    ClarifyRequested,
    LlmRouteDecided,
    LlmRequestStarted,
    LlmRequestSucceeded,
    LlmRequestFailed,
    LlmBudgetExceeded,
    ChatResponseGenerated,
    MemorySaveRequested,
    MemorySaved,
    TaskProgress,
    StepExecutionStarted,
    StepExecutionFinished,
    StepPausedForApproval,
    StepRetrying,
    StepWaiting,
    StepCancelledByUser,
    UserActionRequired,
    ObservationCaptured,
    MicroActionProposed,
    MicroActionExecuted,
    VerificationResult,
    ApprovalRequested,
    ApprovalApproved,
    ApprovalRejected,
    ApprovalResolved,
    LocalLlmHttpError,
}

pub const ALL_EVENT_TYPES: &[EventType] = &[
    EventType::RunCreated,
    EventType::RunFailed,
    EventType::IntentDecided,
    EventType::ClarifyRequested,
    EventType::LlmRouteDecided,
    EventType::LlmRequestStarted,
    EventType::LlmRequestSucceeded,
    EventType::LlmRequestFailed,
    EventType::LlmBudgetExceeded,
    EventType::ChatResponseGenerated,
    EventType::MemorySaveRequested,
    EventType::MemorySaved,
    EventType::TaskProgress,
    EventType::StepExecutionStarted,
    EventType::StepExecutionFinished,
    EventType::StepPausedForApproval,
    EventType::StepRetrying,
    EventType::StepWaiting,
    EventType::StepCancelledByUser,
    EventType::UserActionRequired,
    EventType::ObservationCaptured,
    EventType::MicroActionProposed,
    EventType::MicroActionExecuted,
    EventType::VerificationResult,
    EventType::ApprovalRequested,
    EventType::ApprovalApproved,
    EventType::ApprovalRejected,
    EventType::ApprovalResolved,
    EventType::LocalLlmHttpError,
];

/// Error returned when a string does not name a known event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventType(pub String);

impl std::fmt::Display for UnknownEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for UnknownEventType {}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::RunFailed => "run_failed",
            Self::IntentDecided => "intent_decided",
            Self::ClarifyRequested => "clarify_requested",
            Self::LlmRouteDecided => "llm_route_decided",
            Self::LlmRequestStarted => "llm_request_started",
            Self::LlmRequestSucceeded => "llm_request_succeeded",
            Self::LlmRequestFailed => "llm_request_failed",
            Self::LlmBudgetExceeded => "llm_budget_exceeded",
            Self::ChatResponseGenerated => "chat_response_generated",
            Self::MemorySaveRequested => "memory_save_requested",
            Self::MemorySaved => "memory_saved",
            Self::TaskProgress => "task_progress",
            Self::StepExecutionStarted => "step_execution_started",
            Self::StepExecutionFinished => "step_execution_finished",
            Self::StepPausedForApproval => "step_paused_for_approval",
            Self::StepRetrying => "step_retrying",
            Self::StepWaiting => "step_waiting",
            Self::StepCancelledByUser => "step_cancelled_by_user",
            Self::UserActionRequired => "user_action_required",
            Self::ObservationCaptured => "observation_captured",
            Self::MicroActionProposed => "micro_action_proposed",
            Self::MicroActionExecuted => "micro_action_executed",
            Self::VerificationResult => "verification_result",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalApproved => "approval_approved",
            Self::ApprovalRejected => "approval_rejected",
            Self::ApprovalResolved => "approval_resolved",
            Self::LocalLlmHttpError => "local_llm_http_error",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ALL_EVENT_TYPES
            .iter()
            .copied()
            .find(|ty| ty.as_str() == value)
            .ok_or_else(|| UnknownEventType(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One append-only event row. Ordered per run by insertion id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    #[serde(default)]
    pub payload: Value,
    pub level: EventLevel,
    pub ts: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn every_type_round_trips_through_its_name() {
        for ty in ALL_EVENT_TYPES {
            assert_eq!(EventType::from_str(ty.as_str()).unwrap(), *ty);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(EventType::from_str("totally_new_event").is_err());
    }

    #[test]
    fn enum_matches_serde_names() {
        for ty in ALL_EVENT_TYPES {
            let json = serde_json::to_string(ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }
}
