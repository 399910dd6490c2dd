//! AI Orchestrator: task lifecycle, worker pool and manager loop.

pub mod actions;
pub mod config;
pub mod cron;
pub mod error;
pub mod llm;
pub mod manager;
pub mod orchestrator;
pub mod runtime;
pub mod signal;
pub mod tasks;
pub mod window;
pub mod worker;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorEvent};
