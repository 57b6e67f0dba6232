//! packrun-jo library interface
//!
//! Tracks uploaded Sources through extraction, the credit gate and
//! analysis until they reach a terminal stage. The binary is a thin CLI
//! over `JobOrchestrator`; integration tests drive the same type against a
//! scripted backend.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

pub use crate::config::{ApiSettings, OrchestratorSettings};
pub use crate::error::{OrchestratorError, OrchestratorResult};
pub use crate::orchestrator::{JobOrchestrator, OrchestratorEvent, TrackedSource};
pub use crate::services::{
    CancellationController, CreditGate, HttpPipelineClient, PipelineApi, PollingEngine,
    SessionStore, StartResult,
};

/// Module name used for config file and root folder resolution
pub const MODULE_NAME: &str = "packrun-jo";
