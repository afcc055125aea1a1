pub mod auth;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod privacy;
pub mod storage;
pub mod vault;

pub use error::{AstraError, Result};
pub use event_bus::EventBus;
pub use storage::SqliteStore;
