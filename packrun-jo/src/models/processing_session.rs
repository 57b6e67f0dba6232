//! Persisted processing session
//!
//! One `ProcessingSession` per tracked Source. The session store always
//! writes the whole `SessionSnapshot` so a restarted caller sees a
//! consistent picture of every Source at once.

use crate::models::Source;
use chrono::{DateTime, Utc};
use packrun_common::{JobId, PackId, SourceId, Stage};
use serde::{Deserialize, Serialize};

/// Snapshot of one Source's in-flight state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSession {
    pub source_id: SourceId,
    pub pack_id: Option<PackId>,
    pub stage: Stage,
    pub job_id: Option<JobId>,
    /// Epoch milliseconds
    pub started_at: i64,
    pub estimated_seconds: u64,
    pub processed_units: u64,
    pub total_units: Option<u64>,
    pub progress: u8,
}

impl ProcessingSession {
    pub fn from_source(source: &Source, started_at: i64, seconds_per_unit: u64) -> Self {
        Self {
            source_id: source.id.clone(),
            pack_id: source.pack_id.clone(),
            stage: source.stage,
            job_id: source.job_id.clone(),
            started_at,
            estimated_seconds: source.remaining_units().saturating_mul(seconds_per_unit),
            processed_units: source.processed_units,
            total_units: source.total_units,
            progress: source.progress,
        }
    }

    /// Seed a working-set Source from the persisted record
    pub fn to_source(&self) -> Source {
        Source {
            id: self.source_id.clone(),
            pack_id: self.pack_id.clone(),
            job_id: self.job_id.clone(),
            stage: self.stage,
            progress: self.progress,
            processed_units: self.processed_units,
            total_units: self.total_units,
            error_message: None,
        }
    }

    /// Active stage with a job to poll
    pub fn is_resumable(&self) -> bool {
        self.stage.is_resumable() && self.job_id.is_some()
    }
}

/// Severity of an activity log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(value: &str) -> LogLevel {
        match value {
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// One human-readable history line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub source_id: Option<SourceId>,
    pub level: LogLevel,
    pub message: String,
}

/// Everything the session store persists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub sessions: Vec<ProcessingSession>,
    pub log_tail: Vec<LogEntry>,
    pub saved_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn new(sessions: Vec<ProcessingSession>, log_tail: Vec<LogEntry>) -> Self {
        Self {
            sessions,
            log_tail,
            saved_at: Utc::now(),
        }
    }

    pub fn session(&self, source_id: &SourceId) -> Option<&ProcessingSession> {
        self.sessions.iter().find(|s| &s.source_id == source_id)
    }

    pub fn resumable(&self) -> impl Iterator<Item = &ProcessingSession> {
        self.sessions.iter().filter(|s| s.is_resumable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzing_source() -> Source {
        let mut source = Source::new(SourceId::new("src-1"), Some(PackId::new("pack-1")));
        source.stage = Stage::Analyzing;
        source.job_id = Some(JobId::new("job-9"));
        source.total_units = Some(50);
        source.processed_units = 20;
        source.progress = 40;
        source
    }

    #[test]
    fn test_estimate_uses_remaining_units() {
        let session = ProcessingSession::from_source(&analyzing_source(), 1_700_000_000_000, 60);
        assert_eq!(session.estimated_seconds, 30 * 60);
        assert!(session.is_resumable());
    }

    #[test]
    fn test_source_round_trip_keeps_counters() {
        let source = analyzing_source();
        let session = ProcessingSession::from_source(&source, 0, 60);
        assert_eq!(session.to_source(), source);
    }

    #[test]
    fn test_terminal_or_jobless_sessions_not_resumable() {
        let mut session = ProcessingSession::from_source(&analyzing_source(), 0, 60);
        session.stage = Stage::Completed;
        assert!(!session.is_resumable());

        session.stage = Stage::Analyzing;
        session.job_id = None;
        assert!(!session.is_resumable());
    }

    #[test]
    fn test_session_json_field_names() {
        let session = ProcessingSession::from_source(&analyzing_source(), 42, 60);
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["jobId"], "job-9");
        assert_eq!(json["startedAt"], 42);
        assert_eq!(json["estimatedSeconds"], 1800);
        assert_eq!(json["stage"], "analyzing");
    }
}
