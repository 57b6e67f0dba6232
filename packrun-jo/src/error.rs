//! Error types for packrun-jo
//!
//! Propagation policy:
//! - `Transport` and `Server` are retried by the polling engine's backoff
//!   up to the failure ceiling, then surfaced
//! - `Auth` is surfaced immediately so the caller can refresh credentials
//! - `InsufficientCredits` re-opens the credit gate instead of failing the Source
//! - `Timeout` means "still processing, check back later", never job failure
//! - `CancelUncertain` parks the Source in an unknown state

use packrun_common::human_time::format_duration;
use packrun_common::{SourceId, Stage};
use std::time::Duration;
use thiserror::Error;

/// Orchestrator error type
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Network or connectivity failure (includes per-request timeouts)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credentials expired or rejected (401/403)
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Non-2xx response or job-level failure reported by the backend
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Backend refused to start analysis (402)
    #[error("Insufficient credits: {detail}")]
    InsufficientCredits { detail: String },

    /// Local wall-clock polling ceiling exceeded
    #[error("Still {stage} after {}; check back later", format_duration(.elapsed.as_secs()))]
    Timeout { stage: Stage, elapsed: Duration },

    /// Cancel command failed; server-side state unknown
    #[error("Cancel not confirmed: {0}")]
    CancelUncertain(String),

    /// Source is not in the working set
    #[error("Unknown source: {0}")]
    UnknownSource(SourceId),

    /// Operation not valid for the Source's current stage
    #[error("Source {source_id} is {stage}: {message}")]
    InvalidStage {
        source_id: SourceId,
        stage: Stage,
        message: String,
    },

    /// Response body could not be decoded
    #[error("Malformed response: {0}")]
    Decode(String),

    /// packrun-common error (config, database, io)
    #[error("Common error: {0}")]
    Common(#[from] packrun_common::Error),
}

impl OrchestratorError {
    /// Whether the polling engine may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Transport(_) | OrchestratorError::Server { .. }
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, OrchestratorError::Auth(_))
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::Common(packrun_common::Error::Database(err))
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
