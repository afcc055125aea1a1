use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] astra_core::AstraError),

    #[error(transparent)]
    Llm(#[from] astra_brain::BrainError),

    #[error(transparent)]
    Skill(#[from] astra_skills::SkillError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
