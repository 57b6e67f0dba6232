//! Source and Pack entities
//!
//! A Source is mutated only through stage machine transitions; nothing
//! else writes its fields.

use crate::workflow::RemoteStatus;
use packrun_common::{JobId, PackId, SourceId, Stage};
use serde::{Deserialize, Serialize};

/// One unit of ingestible content tracked through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub pack_id: Option<PackId>,
    /// Analysis job, known once start-analysis was accepted (or after resume)
    pub job_id: Option<JobId>,
    pub stage: Stage,
    /// Percent complete within the current stage (0-100)
    pub progress: u8,
    pub processed_units: u64,
    /// Unknown until the backend reports a chunk count
    pub total_units: Option<u64>,
    /// Present only while `stage == Failed`
    pub error_message: Option<String>,
}

impl Source {
    /// Freshly created by an upload/ingest call
    pub fn new(id: SourceId, pack_id: Option<PackId>) -> Self {
        Self {
            id,
            pack_id,
            job_id: None,
            stage: Stage::Uploading,
            progress: 0,
            processed_units: 0,
            total_units: None,
            error_message: None,
        }
    }

    pub fn remaining_units(&self) -> u64 {
        self.total_units
            .map(|total| total.saturating_sub(self.processed_units))
            .unwrap_or(0)
    }
}

/// Named collection of Sources plus an optional custom instruction string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pack {
    pub id: PackId,
    pub name: String,
    pub custom_instructions: Option<String>,
    pub source_ids: Vec<SourceId>,
}

impl Pack {
    pub fn new(id: PackId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            custom_instructions: None,
            source_ids: Vec::new(),
        }
    }

    pub fn with_sources(mut self, source_ids: impl IntoIterator<Item = SourceId>) -> Self {
        self.source_ids.extend(source_ids);
        self
    }

    pub fn contains(&self, source_id: &SourceId) -> bool {
        self.source_ids.contains(source_id)
    }
}

/// Body of `GET /sources/{id}/status` and `GET /jobs/{job_id}/status`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatusReport {
    pub status: RemoteStatus,
    /// Some backends report fractional percentages
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub processed_chunks: Option<u64>,
    #[serde(default)]
    pub total_chunks: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub job_id: Option<JobId>,
}

impl StatusReport {
    pub fn new(status: RemoteStatus) -> Self {
        Self {
            status,
            progress: None,
            processed_chunks: None,
            total_chunks: None,
            error: None,
            job_id: None,
        }
    }

    /// Progress clamped to 0..=100
    pub fn progress_percent(&self) -> Option<u8> {
        self.progress
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0).round() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_report_tolerates_missing_fields() {
        let report: StatusReport = serde_json::from_str(r#"{"status":"extracting"}"#).unwrap();
        assert_eq!(report.status, RemoteStatus::Known(Stage::Extracting));
        assert_eq!(report.progress_percent(), None);
        assert_eq!(report.total_chunks, None);
    }

    #[test]
    fn test_status_report_unknown_status_is_kept() {
        let report: StatusReport = serde_json::from_str(
            r#"{"status":"vectorizing","progress":41.6,"processed_chunks":3,"total_chunks":9}"#,
        )
        .unwrap();
        assert_eq!(report.status, RemoteStatus::Unrecognized("vectorizing".into()));
        assert_eq!(report.progress_percent(), Some(42));
    }

    #[test]
    fn test_progress_clamped() {
        let mut report = StatusReport::new(RemoteStatus::Known(Stage::Analyzing));
        report.progress = Some(140.0);
        assert_eq!(report.progress_percent(), Some(100));
        report.progress = Some(-3.0);
        assert_eq!(report.progress_percent(), Some(0));
    }

    #[test]
    fn test_remaining_units() {
        let mut source = Source::new(SourceId::new("s"), None);
        assert_eq!(source.remaining_units(), 0);
        source.total_units = Some(50);
        source.processed_units = 20;
        assert_eq!(source.remaining_units(), 30);
    }
}
