//! Scripted `PipelineApi` for unit tests

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{CreditCheckResponse, StatusReport};
use crate::services::api_client::{CancelAck, PipelineApi, PollTarget, StartAnalysisAccepted};
use crate::workflow::RemoteStatus;
use async_trait::async_trait;
use packrun_common::{JobId, SourceId, Stage};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Default)]
pub(crate) struct FakeApi {
    pub status: Mutex<VecDeque<OrchestratorResult<StatusReport>>>,
    pub credit: Mutex<VecDeque<OrchestratorResult<CreditCheckResponse>>>,
    pub start: Mutex<VecDeque<OrchestratorResult<StartAnalysisAccepted>>>,
    pub cancel: Mutex<VecDeque<OrchestratorResult<CancelAck>>>,
    /// One entry per call, e.g. `start:src-1:Some(20)`
    pub calls: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn push_credit(&self, total: u64, credits: u64, unlimited: bool) {
        self.credit.lock().unwrap().push_back(Ok(CreditCheckResponse {
            total_units: total,
            user_credits: credits,
            has_unlimited: unlimited,
        }));
    }

    pub fn push_start(&self, result: OrchestratorResult<&str>) {
        self.start
            .lock()
            .unwrap()
            .push_back(result.map(|id| StartAnalysisAccepted { job_id: JobId::new(id) }));
    }

    pub fn push_cancel(&self, result: OrchestratorResult<Option<u64>>) {
        self.cancel
            .lock()
            .unwrap()
            .push_back(result.map(|processed_chunks| CancelAck { processed_chunks }));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn exhausted(what: &str) -> OrchestratorError {
    OrchestratorError::Transport(format!("no scripted {} response", what))
}

#[async_trait]
impl PipelineApi for FakeApi {
    async fn fetch_status(&self, target: &PollTarget) -> OrchestratorResult<StatusReport> {
        self.record(format!("status:{}", target));
        let next = self.status.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(StatusReport::new(RemoteStatus::Known(Stage::Extracting))))
    }

    async fn probe_health(&self) -> OrchestratorResult<()> {
        self.record("probe".to_string());
        Ok(())
    }

    async fn fetch_credit_check(&self, source_id: &SourceId) -> OrchestratorResult<CreditCheckResponse> {
        self.record(format!("credit:{}", source_id));
        let next = self.credit.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(exhausted("credit-check")))
    }

    async fn start_analysis(
        &self,
        source_id: &SourceId,
        max_chunks: Option<u64>,
    ) -> OrchestratorResult<StartAnalysisAccepted> {
        self.record(format!("start:{}:{:?}", source_id, max_chunks));
        let next = self.start.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(exhausted("start-analysis")))
    }

    async fn cancel(&self, source_id: &SourceId, job_id: Option<&JobId>) -> OrchestratorResult<CancelAck> {
        match job_id {
            Some(job_id) => self.record(format!("cancel:job:{}", job_id)),
            None => self.record(format!("cancel:source:{}", source_id)),
        }
        let next = self.cancel.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(exhausted("cancel")))
    }
}
