// src/utils/mod.rs
//! Common utilities: errors, configuration, retry, clock

pub mod clock;
pub mod config;
pub mod errors;
pub mod retry;

pub use config::AppConfig;
pub use errors::{OrchestratorError, Result};
pub use retry::RetryPolicy;
