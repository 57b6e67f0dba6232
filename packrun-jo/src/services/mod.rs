//! Orchestrator services
//!
//! Each service owns one concern; `JobOrchestrator` composes them.

pub mod activity_log;
pub mod api_client;
pub mod cancellation;
pub mod credit_gate;
pub mod polling_engine;
pub mod session_store;

#[cfg(test)]
pub(crate) mod fake_api;

pub use activity_log::ActivityLog;
pub use api_client::{
    CancelAck, CredentialProvider, HttpPipelineClient, PipelineApi, PollTarget, StartAnalysisAccepted,
    StartAnalysisRequest, StaticToken,
};
pub use cancellation::{CancelReport, CancelRequest, CancellationController};
pub use credit_gate::{CreditGate, GateDecision, StartResult};
pub use polling_engine::{
    BackoffPolicy, PollClass, PollHandle, PollOutcome, PollUpdate, PollingEngine, PollingSettings,
};
pub use session_store::SessionStore;
