use thiserror::Error;

/// Provider failure classes. The `error_type` strings are part of the event
/// payload contract and the chat-loop remediation table.
#[derive(Error, Debug)]
pub enum BrainError {
    #[error("local LLM request failed: {0}")]
    Connection(String),

    #[error("local LLM HTTP {status}")]
    Http { status: u16 },

    #[error("local LLM returned invalid JSON")]
    InvalidJson,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("local LLM returned empty response")]
    EmptyResponse,

    #[error("LLM budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("unhandled LLM error: {0}")]
    Unhandled(String),
}

impl BrainError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection_error",
            Self::Http { .. } => "http_error",
            Self::InvalidJson => "invalid_json",
            Self::ModelNotFound(_) => "model_not_found",
            Self::EmptyResponse => "empty_response",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::Unhandled(_) => "unhandled_error",
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status } => Some(*status),
            _ => None,
        }
    }

    /// Tier fallback applies only to failures that can be model-specific.
    pub fn is_tier_fallback_eligible(&self) -> bool {
        matches!(
            self,
            Self::ModelNotFound(_) | Self::Connection(_) | Self::Http { .. } | Self::InvalidJson
        )
    }

    /// Transient failures the run engine may retry within the step budget.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Http { status } => *status >= 500,
            _ => false,
        }
    }
}
