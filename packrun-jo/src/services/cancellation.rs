//! Cancellation controller
//!
//! Local polling stops before the backend is contacted and is never
//! resumed automatically. The outcome decides billing:
//! `processed >= threshold` bills the processed units, anything below is
//! free. A failed cancel command leaves the server state unknown.

use crate::error::OrchestratorError;
use crate::services::api_client::PipelineApi;
use crate::services::polling_engine::PollHandle;
use packrun_common::{CancelOutcome, JobId, SourceId};
use std::sync::Arc;
use tracing::{error, info};

/// What the controller needs to know about the Source being cancelled
#[derive(Debug, Clone)]
pub struct CancelRequest<'a> {
    pub source_id: &'a SourceId,
    pub job_id: Option<&'a JobId>,
    /// Last locally known processed units
    pub processed_units: u64,
}

/// Outcome plus the processed figure the backend reported, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReport {
    pub outcome: CancelOutcome,
    pub reported_units: Option<u64>,
}

pub struct CancellationController {
    api: Arc<dyn PipelineApi>,
    partial_billing_threshold: u64,
}

impl CancellationController {
    pub fn new(api: Arc<dyn PipelineApi>, partial_billing_threshold: u64) -> Self {
        Self {
            api,
            partial_billing_threshold,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.partial_billing_threshold
    }

    /// Billing outcome for units processed at cancel time
    pub fn classify(&self, processed_units: u64) -> CancelOutcome {
        if processed_units >= self.partial_billing_threshold {
            CancelOutcome::PartialCharge {
                billed_units: processed_units,
            }
        } else {
            CancelOutcome::NoCharge
        }
    }

    /// Stop local polling, send the cancel command and classify the result
    pub async fn cancel(&self, request: CancelRequest<'_>, poll: Option<PollHandle>) -> CancelReport {
        if let Some(handle) = poll {
            handle.stop();
        }

        match self.api.cancel(request.source_id, request.job_id).await {
            Ok(ack) => {
                let processed = ack.processed_chunks.unwrap_or(request.processed_units);
                let outcome = self.classify(processed);
                info!(
                    source_id = %request.source_id,
                    processed_units = processed,
                    outcome = outcome.label(),
                    "Cancel acknowledged"
                );
                CancelReport {
                    outcome,
                    reported_units: ack.processed_chunks,
                }
            }
            Err(e) => {
                let uncertain = OrchestratorError::CancelUncertain(e.to_string());
                error!(source_id = %request.source_id, error = %uncertain, "Server state unknown");
                CancelReport {
                    outcome: CancelOutcome::CancelUncertain {
                        reason: uncertain.to_string(),
                    },
                    reported_units: None,
                }
            }
        }
    }
}
