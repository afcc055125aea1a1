pub mod approvals;
pub mod chat;
pub mod engine;
pub mod error;
pub mod executor;
pub mod intent;
pub mod interpreter;
pub mod orchestrate;
pub mod planner;
pub mod research;
pub mod snapshot;
pub mod success;

pub use approvals::ApprovalGate;
pub use engine::RunEngine;
pub use error::{EngineError, Result};
pub use executor::{Capture, ComputerExecutor, DesktopBridge, ExecutorConfig, MicroAction};
pub use orchestrate::{CreateRunKind, CreateRunOutcome, Kernel};
pub use planner::Planner;
pub use snapshot::{build_snapshot, RunSnapshot};
