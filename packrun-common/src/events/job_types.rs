//! Job lifecycle type definitions
//!
//! Supporting types for Source stages, connection health and cancel billing.

use serde::{Deserialize, Serialize};

/// Processing stage of one Source
///
/// Wire names are snake_case and match the backend `status` field.
/// `Cancelled` and `CancelUncertain` are set from cancel command results,
/// never from a status poll's own vocabulary alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Uploading,
    Extracting,
    ReadyForAnalysis,
    Analyzing,
    /// Large job the server finishes without aggressive polling
    BackgroundMode,
    Completed,
    Partial,
    LimitReached,
    Failed,
    Cancelled,
    /// Cancel command failed; server-side state unknown
    CancelUncertain,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Uploading,
        Stage::Extracting,
        Stage::ReadyForAnalysis,
        Stage::Analyzing,
        Stage::BackgroundMode,
        Stage::Completed,
        Stage::Partial,
        Stage::LimitReached,
        Stage::Failed,
        Stage::Cancelled,
        Stage::CancelUncertain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Uploading => "uploading",
            Stage::Extracting => "extracting",
            Stage::ReadyForAnalysis => "ready_for_analysis",
            Stage::Analyzing => "analyzing",
            Stage::BackgroundMode => "background_mode",
            Stage::Completed => "completed",
            Stage::Partial => "partial",
            Stage::LimitReached => "limit_reached",
            Stage::Failed => "failed",
            Stage::Cancelled => "cancelled",
            Stage::CancelUncertain => "cancel_uncertain",
        }
    }

    pub fn from_wire(value: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.as_str() == value)
    }

    /// Terminal stages are never overwritten by later poll responses
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Stage::Completed
                | Stage::Partial
                | Stage::LimitReached
                | Stage::Failed
                | Stage::Cancelled
        )
    }

    /// Stages that keep the polling engine on its fast interval
    pub fn is_active_processing(&self) -> bool {
        matches!(self, Stage::Extracting | Stage::Analyzing)
    }

    /// Stages a restarted caller resumes polling for
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Stage::Extracting | Stage::Analyzing | Stage::BackgroundMode
        )
    }

    /// Stages reached only once analysis has been accepted
    pub fn is_analysis_phase(&self) -> bool {
        matches!(self, Stage::Analyzing | Stage::BackgroundMode) || self.is_terminal()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of the status polling connection for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Last status fetch succeeded
    Connected,
    /// Last status fetch failed, retry scheduled
    Warning,
    /// Failure ceiling reached, polling halted
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Warning => write!(f, "warning"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Billing result of a cancel request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Units processed before the cancel were billed and leave the pool
    PartialCharge { billed_units: u64 },
    /// Too little work was done to bill
    NoCharge,
    /// The cancel command failed; the Source may still be running
    CancelUncertain { reason: String },
}

impl CancelOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CancelOutcome::PartialCharge { .. } => "partial_charge",
            CancelOutcome::NoCharge => "no_charge",
            CancelOutcome::CancelUncertain { .. } => "cancel_uncertain",
        }
    }
}
