//! Stage state machine
//!
//! # State Progression
//! uploading → extracting → ready_for_analysis → analyzing → {completed | partial | limit_reached | failed}
//!
//! `analyzing` may branch into `background_mode` before completing.
//! Cancellation adds `cancelled` (terminal, backend acknowledged) and
//! `cancel_uncertain` (cancel command failed, waits for the next poll).
//!
//! Rules:
//! - Only `Submitted` moves a Source on a local decision (uploading → extracting)
//! - Every other move comes from a backend answer: a status poll, the
//!   start-analysis acceptance or the cancel command result
//! - Unrecognized status values are a no-op
//! - A pre-analysis status never moves an analyzing Source back
//! - Terminal stages are never left

use crate::models::{Source, StatusReport};
use packrun_common::{JobId, Stage};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The backend `status` field, parsed into a closed set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Known(Stage),
    /// Forward-compatible backend addition; ignored
    Unrecognized(String),
}

impl RemoteStatus {
    pub fn parse(value: &str) -> RemoteStatus {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "canceled" => RemoteStatus::Known(Stage::Cancelled),
            // local-only stage, never accepted from the wire
            "cancel_uncertain" => RemoteStatus::Unrecognized(normalized),
            other => match Stage::from_wire(other) {
                Some(stage) => RemoteStatus::Known(stage),
                None => RemoteStatus::Unrecognized(value.to_string()),
            },
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RemoteStatus::Known(stage) => stage.as_str(),
            RemoteStatus::Unrecognized(raw) => raw,
        }
    }
}

impl From<Stage> for RemoteStatus {
    fn from(stage: Stage) -> Self {
        RemoteStatus::Known(stage)
    }
}

impl Serialize for RemoteStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RemoteStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(RemoteStatus::parse(&raw))
    }
}

/// Inputs to the stage machine
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    /// Upload/ingest call succeeded (optimistic, before any poll)
    Submitted,
    /// Authoritative status poll response
    Polled(StatusReport),
    /// Backend accepted start-analysis and returned a job
    AnalysisAccepted { job_id: JobId },
    /// Backend acknowledged a cancel command
    CancelAcknowledged { processed_units: Option<u64> },
    /// Cancel command failed; server state unknown
    CancelUnconfirmed,
}

impl StageEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StageEvent::Submitted => "submitted",
            StageEvent::Polled(_) => "polled",
            StageEvent::AnalysisAccepted { .. } => "analysis_accepted",
            StageEvent::CancelAcknowledged { .. } => "cancel_acknowledged",
            StageEvent::CancelUnconfirmed => "cancel_unconfirmed",
        }
    }
}

/// Why an event did not change the Source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Source already finished
    Terminal(Stage),
    /// Poll reported a status outside the known set
    Unrecognized(String),
    /// Event makes no sense in the current stage
    NotApplicable { stage: Stage, event: &'static str },
}

/// Result of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Moved { from: Stage, to: Stage },
    /// Same stage; counters may have changed
    Stayed { stage: Stage },
    Ignored(IgnoreReason),
}

impl Transition {
    pub fn moved(&self) -> Option<(Stage, Stage)> {
        match self {
            Transition::Moved { from, to } => Some((*from, *to)),
            _ => None,
        }
    }
}

/// Pure transition table
pub fn next_stage(current: Stage, event: &StageEvent) -> Result<Stage, IgnoreReason> {
    if current.is_terminal() {
        return Err(IgnoreReason::Terminal(current));
    }

    let not_applicable = || IgnoreReason::NotApplicable {
        stage: current,
        event: event.name(),
    };

    match event {
        StageEvent::Submitted => match current {
            Stage::Uploading => Ok(Stage::Extracting),
            _ => Err(not_applicable()),
        },
        StageEvent::Polled(report) => match &report.status {
            RemoteStatus::Unrecognized(raw) => Err(IgnoreReason::Unrecognized(raw.clone())),
            // backend has not caught up with the optimistic submit yet
            RemoteStatus::Known(Stage::Uploading) if current == Stage::Extracting => {
                Ok(Stage::Extracting)
            }
            RemoteStatus::Known(stage) if lags_analysis(current, *stage) => Ok(current),
            RemoteStatus::Known(stage) => Ok(*stage),
        },
        StageEvent::AnalysisAccepted { .. } => match current {
            Stage::ReadyForAnalysis => Ok(Stage::Analyzing),
            // a retried confirm after a lost response
            Stage::Analyzing => Ok(Stage::Analyzing),
            _ => Err(not_applicable()),
        },
        StageEvent::CancelAcknowledged { .. } => Ok(Stage::Cancelled),
        StageEvent::CancelUnconfirmed => Ok(Stage::CancelUncertain),
    }
}

/// Job status lags behind the start-analysis acceptance
fn lags_analysis(current: Stage, reported: Stage) -> bool {
    current.is_analysis_phase() && !reported.is_analysis_phase()
}

/// Apply an event to a Source (the reducer)
///
/// Counters follow the stage: progress never decreases while the stage is
/// unchanged, `processed_units` never exceeds a known `total_units`, and
/// `error_message` exists only in `failed`.
pub fn apply(source: &mut Source, event: StageEvent) -> Transition {
    let from = source.stage;
    let to = match next_stage(from, &event) {
        Ok(to) => to,
        Err(reason) => return Transition::Ignored(reason),
    };

    match event {
        StageEvent::Submitted => {
            source.progress = 0;
        }
        StageEvent::Polled(report) => {
            if let RemoteStatus::Known(reported) = &report.status {
                if lags_analysis(from, *reported) {
                    return Transition::Stayed { stage: from };
                }
            }
            if let Some(total) = report.total_chunks {
                source.total_units = Some(total);
            }
            if let Some(processed) = report.processed_chunks {
                source.processed_units = processed;
            }
            if source.job_id.is_none() {
                source.job_id = report.job_id.clone();
            }

            let reported = report.progress_percent();
            source.progress = if to == from {
                reported.map_or(source.progress, |p| p.max(source.progress))
            } else {
                reported.unwrap_or(0)
            };

            source.error_message = if to == Stage::Failed {
                Some(
                    report
                        .error
                        .clone()
                        .unwrap_or_else(|| "Processing failed".to_string()),
                )
            } else {
                None
            };
        }
        StageEvent::AnalysisAccepted { job_id } => {
            source.job_id = Some(job_id);
            if to != from {
                source.progress = 0;
            }
        }
        StageEvent::CancelAcknowledged { processed_units } => {
            if let Some(processed) = processed_units {
                source.processed_units = processed;
            }
        }
        StageEvent::CancelUnconfirmed => {}
    }

    if let Some(total) = source.total_units {
        source.processed_units = source.processed_units.min(total);
    }
    if to == Stage::Completed {
        source.progress = 100;
    }
    if to != Stage::Failed {
        source.error_message = None;
    }
    source.stage = to;

    if to == from {
        Transition::Stayed { stage: to }
    } else {
        Transition::Moved { from, to }
    }
}
