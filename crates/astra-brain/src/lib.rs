pub mod config;
pub mod error;
pub mod provider;
pub mod queue;
pub mod router;
pub mod types;

pub use config::BrainConfig;
pub use error::BrainError;
pub use queue::BrainQueue;
pub use router::BrainRouter;
pub use types::{ChatMessage, LlmRequest, LlmResponse, ModelKind, ResponseStatus};

use async_trait::async_trait;

/// The narrow seam the rest of the kernel talks to. The production
/// implementation is [`BrainRouter`]; tests inject stubs.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(&self, request: LlmRequest) -> Result<LlmResponse, BrainError>;
}
