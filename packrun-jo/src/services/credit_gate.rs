//! Credit gate
//!
//! Advisory on the client, authoritative on the server: the gate decides
//! whether to offer analysis, but analysis only ever starts through the
//! start-analysis command, which may still answer 402. A 402 refetches the
//! credit check and re-presents the gate instead of failing the Source.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::CreditCheck;
use crate::services::api_client::PipelineApi;
use packrun_common::{JobId, SourceId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// What the gate allows for a given check and request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed { units: u64 },
    Deny { credits_needed: u64 },
    /// Zero units, or zero units requested
    NothingToAnalyze,
}

impl GateDecision {
    /// A request below `allowed_units` is honored; above it is clamped
    pub fn evaluate(check: &CreditCheck, requested_units: Option<u64>) -> Self {
        if check.is_empty() || requested_units == Some(0) {
            return GateDecision::NothingToAnalyze;
        }
        if !check.can_proceed {
            return GateDecision::Deny {
                credits_needed: check.credits_needed,
            };
        }
        let units = requested_units
            .map(|requested| requested.min(check.allowed_units))
            .unwrap_or(check.allowed_units);
        GateDecision::Proceed { units }
    }
}

/// Result of confirming the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartResult {
    Started { job_id: JobId, units: u64 },
    Denied { check: CreditCheck },
    NothingToAnalyze,
    /// Backend rejected the start with insufficient credits; `check` is fresh
    GateReopened { check: CreditCheck, detail: String },
}

/// Credit checks per Source plus the confirm protocol
pub struct CreditGate {
    api: Arc<dyn PipelineApi>,
    checks: HashMap<SourceId, CreditCheck>,
}

impl CreditGate {
    pub fn new(api: Arc<dyn PipelineApi>) -> Self {
        Self {
            api,
            checks: HashMap::new(),
        }
    }

    /// Fetch and cache the check for a Source
    pub async fn check_credits(&mut self, source_id: &SourceId) -> OrchestratorResult<CreditCheck> {
        let check = CreditCheck::from(self.api.fetch_credit_check(source_id).await?);
        info!(
            source_id = %source_id,
            total_units = check.total_units,
            user_credits = check.user_credits,
            has_unlimited = check.has_unlimited,
            allowed_units = check.allowed_units,
            can_proceed = check.can_proceed,
            "Credit check"
        );
        self.checks.insert(source_id.clone(), check);
        Ok(check)
    }

    pub fn cached(&self, source_id: &SourceId) -> Option<&CreditCheck> {
        self.checks.get(source_id)
    }

    pub fn forget(&mut self, source_id: &SourceId) {
        self.checks.remove(source_id);
    }

    /// Start analysis through the gate
    ///
    /// Uses the cached check when it allows analysis and refetches
    /// otherwise. `max_chunks` is only sent when fewer than all units are
    /// started.
    pub async fn confirm(
        &mut self,
        source_id: &SourceId,
        requested_units: Option<u64>,
    ) -> OrchestratorResult<StartResult> {
        let check = match self.checks.get(source_id) {
            Some(check) if check.can_proceed => *check,
            // a cached denial may predate a top-up
            _ => self.check_credits(source_id).await?,
        };

        let units = match GateDecision::evaluate(&check, requested_units) {
            GateDecision::NothingToAnalyze => {
                info!(source_id = %source_id, "Nothing to analyze");
                return Ok(StartResult::NothingToAnalyze);
            }
            GateDecision::Deny { credits_needed } => {
                info!(source_id = %source_id, credits_needed, "Analysis denied by credit gate");
                return Ok(StartResult::Denied { check });
            }
            GateDecision::Proceed { units } => units,
        };

        let max_chunks = (units < check.total_units).then_some(units);
        match self.api.start_analysis(source_id, max_chunks).await {
            Ok(accepted) => {
                info!(source_id = %source_id, job_id = %accepted.job_id, units, "Analysis started");
                self.forget(source_id);
                Ok(StartResult::Started {
                    job_id: accepted.job_id,
                    units,
                })
            }
            Err(OrchestratorError::InsufficientCredits { detail }) => {
                warn!(source_id = %source_id, detail = %detail, "Backend refused start, re-presenting credit gate");
                let check = self.check_credits(source_id).await?;
                Ok(StartResult::GateReopened { check, detail })
            }
            Err(e) => Err(e),
        }
    }
}
