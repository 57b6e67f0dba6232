//! Shared test helpers
//!
//! - `ScriptedApi`: in-process `PipelineApi` answering from queues
//! - `FakeBackend`: axum server on an ephemeral port for HTTP client tests
//! - orchestrator setup over a temp session database

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use packrun_common::events::EventBus;
use packrun_common::{JobId, SourceId, Stage};
use packrun_jo::models::{CreditCheckResponse, StatusReport};
use packrun_jo::services::{CancelAck, PipelineApi, PollTarget, StartAnalysisAccepted};
use packrun_jo::workflow::RemoteStatus;
use packrun_jo::{JobOrchestrator, OrchestratorError, OrchestratorResult, OrchestratorSettings, SessionStore};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Status answered when the status queue is empty
const IDLE_STAGE: Stage = Stage::Extracting;

/// Backend double that answers from per-operation queues and logs every call
#[derive(Default)]
pub struct ScriptedApi {
    status: Mutex<VecDeque<OrchestratorResult<StatusReport>>>,
    credit: Mutex<VecDeque<OrchestratorResult<CreditCheckResponse>>>,
    start: Mutex<VecDeque<OrchestratorResult<StartAnalysisAccepted>>>,
    cancel: Mutex<VecDeque<OrchestratorResult<CancelAck>>>,
    start_delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_stage(&self, stage: Stage) {
        self.push_report(report(stage));
    }

    pub fn push_report(&self, report: StatusReport) {
        self.status.lock().unwrap().push_back(Ok(report));
    }

    pub fn push_status_error(&self, error: OrchestratorError) {
        self.status.lock().unwrap().push_back(Err(error));
    }

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

    /// Hold every start-analysis call for `delay` before answering
    pub fn delay_start(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = Some(delay);
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

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn unscripted(what: &str) -> OrchestratorError {
    OrchestratorError::Transport(format!("no scripted {} response", what))
}

#[async_trait]
impl PipelineApi for ScriptedApi {
    async fn fetch_status(&self, target: &PollTarget) -> OrchestratorResult<StatusReport> {
        self.record(format!("status:{}", target));
        let next = self.status.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(report(IDLE_STAGE)))
    }

    async fn probe_health(&self) -> OrchestratorResult<()> {
        self.record("probe".to_string());
        Ok(())
    }

    async fn fetch_credit_check(&self, source_id: &SourceId) -> OrchestratorResult<CreditCheckResponse> {
        self.record(format!("credit:{}", source_id));
        let next = self.credit.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(unscripted("credit-check")))
    }

    async fn start_analysis(
        &self,
        source_id: &SourceId,
        max_chunks: Option<u64>,
    ) -> OrchestratorResult<StartAnalysisAccepted> {
        self.record(format!("start:{}:{:?}", source_id, max_chunks));
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.start.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(unscripted("start-analysis")))
    }

    async fn cancel(&self, source_id: &SourceId, job_id: Option<&JobId>) -> OrchestratorResult<CancelAck> {
        match job_id {
            Some(job_id) => self.record(format!("cancel:job:{}", job_id)),
            None => self.record(format!("cancel:source:{}", source_id)),
        }
        let next = self.cancel.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(unscripted("cancel")))
    }
}

pub fn report(stage: Stage) -> StatusReport {
    StatusReport::new(RemoteStatus::Known(stage))
}

pub fn analyzing(processed: u64, total: u64) -> StatusReport {
    let mut report = report(Stage::Analyzing);
    report.processed_chunks = Some(processed);
    report.total_chunks = Some(total);
    report.progress = Some(processed as f64 * 100.0 / total as f64);
    report
}

/// Settings for orchestrator tests; the long debounce keeps the session
/// writer quiet while the clock is paused
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        session_debounce: Duration::from_secs(24 * 3600),
        ..OrchestratorSettings::default()
    }
}

pub async fn open_store(dir: &TempDir) -> SessionStore {
    SessionStore::open(&dir.path().join("packrun.db"), Duration::from_millis(50))
        .await
        .unwrap()
}

pub async fn orchestrator(api: Arc<ScriptedApi>, dir: &TempDir) -> JobOrchestrator {
    let settings = test_settings();
    let store = SessionStore::open(&dir.path().join("packrun.db"), settings.session_debounce)
        .await
        .unwrap();
    JobOrchestrator::new(api, store, EventBus::new(100), settings)
}

/// Axum app bound to 127.0.0.1 on an ephemeral port
pub struct FakeBackend {
    pub base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeBackend {
    pub async fn spawn(app: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { base_url, handle }
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
