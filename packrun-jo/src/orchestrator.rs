//! Job status orchestrator
//!
//! Owns the working set of Sources and is the only thing that mutates
//! them. Poll tasks forward their updates through one channel and
//! `next_event` applies them in arrival order, one at a time.
//!
//! # Flow
//! uploading → extracting (optimistic on submit, extraction-class polling)
//! → ready_for_analysis (poll loop hands off, credit gate opens)
//! → analyzing (confirmed; analysis-class polling on the job)
//! → terminal
//!
//! Every transition is written to the activity log, published on the
//! event bus and persisted as a full snapshot.

use crate::config::OrchestratorSettings;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{CreditCheck, LogEntry, Pack, ProcessingSession, SessionSnapshot, Source};
use crate::services::{
    ActivityLog, CancelRequest, CancellationController, CreditGate, PipelineApi, PollClass,
    PollHandle, PollOutcome, PollTarget, PollUpdate, PollingEngine, SessionStore, StartResult,
};
use crate::workflow::{apply, IgnoreReason, StageEvent, Transition};
use chrono::Utc;
use packrun_common::events::{EventBus, PackrunEvent};
use packrun_common::human_time::format_duration;
use packrun_common::{CancelOutcome, ConnectionStatus, JobId, PackId, SourceId, Stage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// What the caller needs to react to
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    StageChanged {
        source_id: SourceId,
        from: Stage,
        to: Stage,
    },
    /// Counters moved within the same stage
    Progress {
        source_id: SourceId,
        stage: Stage,
        progress: u8,
        processed_units: u64,
        total_units: Option<u64>,
    },
    Connection {
        source_id: SourceId,
        status: ConnectionStatus,
        consecutive_failures: u32,
        next_retry: Option<Duration>,
    },
    /// Source is ready; confirm with `confirm_analysis`
    CreditGateOpened { source_id: SourceId, check: CreditCheck },
    NothingToAnalyze { source_id: SourceId },
    /// Still processing server-side; check back later
    TimedOut {
        source_id: SourceId,
        stage: Stage,
        elapsed: Duration,
    },
    /// Refresh credentials and call `retry`
    AuthRequired { source_id: SourceId },
    PollingEnded {
        source_id: SourceId,
        outcome: PollOutcome,
    },
}

struct ActivePoll {
    handle: PollHandle,
    generation: u64,
}

/// One Source in the working set
pub struct TrackedSource {
    pub source: Source,
    /// Epoch milliseconds
    pub started_at: i64,
    pub connection: ConnectionStatus,
    pub consecutive_failures: u32,
    pub cancel_outcome: Option<CancelOutcome>,
    poll: Option<ActivePoll>,
}

impl TrackedSource {
    fn new(source: Source, started_at: i64) -> Self {
        Self {
            source,
            started_at,
            connection: ConnectionStatus::Connected,
            consecutive_failures: 0,
            cancel_outcome: None,
            poll: None,
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poll.is_some()
    }

    fn stop_polling(&mut self) {
        if let Some(active) = self.poll.take() {
            active.handle.stop();
        }
    }
}

struct PollMessage {
    source_id: SourceId,
    generation: u64,
    update: PollUpdate,
}

/// Single owner of all per-Source state
pub struct JobOrchestrator {
    engine: PollingEngine,
    gate: CreditGate,
    canceller: CancellationController,
    store: SessionStore,
    events: EventBus,
    log: ActivityLog,
    settings: OrchestratorSettings,
    sources: HashMap<SourceId, TrackedSource>,
    packs: HashMap<PackId, Pack>,
    updates_tx: mpsc::UnboundedSender<PollMessage>,
    updates_rx: mpsc::UnboundedReceiver<PollMessage>,
    next_generation: u64,
}

impl JobOrchestrator {
    pub fn new(
        api: Arc<dyn PipelineApi>,
        store: SessionStore,
        events: EventBus,
        settings: OrchestratorSettings,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            engine: PollingEngine::new(Arc::clone(&api), settings.polling.clone()),
            gate: CreditGate::new(Arc::clone(&api)),
            canceller: CancellationController::new(api, settings.partial_billing_threshold),
            store,
            events,
            log: ActivityLog::default(),
            settings,
            sources: HashMap::new(),
            packs: HashMap::new(),
            updates_tx,
            updates_rx,
            next_generation: 0,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn source(&self, source_id: &SourceId) -> Option<&Source> {
        self.sources.get(source_id).map(|t| &t.source)
    }

    pub fn tracked(&self, source_id: &SourceId) -> Option<&TrackedSource> {
        self.sources.get(source_id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values().map(|t| &t.source)
    }

    pub fn pack(&self, pack_id: &PackId) -> Option<&Pack> {
        self.packs.get(pack_id)
    }

    pub fn credit_check(&self, source_id: &SourceId) -> Option<&CreditCheck> {
        self.gate.cached(source_id)
    }

    pub fn activity(&self) -> Vec<LogEntry> {
        self.log.entries()
    }

    /// Whether any poll loop is running; `next_event` waits forever otherwise
    pub fn has_active_polling(&self) -> bool {
        self.sources.values().any(TrackedSource::is_polling)
    }

    /// Current state as it would be persisted
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut sessions: Vec<ProcessingSession> = self
            .sources
            .values()
            .map(|t| ProcessingSession::from_source(&t.source, t.started_at, self.settings.seconds_per_unit))
            .collect();
        sessions.sort_by(|a, b| (a.started_at, &a.source_id).cmp(&(b.started_at, &b.source_id)));
        SessionSnapshot::new(sessions, self.log.entries())
    }

    /// A Source was just created by a successful upload
    pub fn track_submitted(&mut self, source_id: SourceId, pack_id: Option<PackId>) -> OrchestratorResult<()> {
        if let Some(existing) = self.sources.get(&source_id) {
            if !existing.source.stage.is_terminal() {
                return Err(OrchestratorError::InvalidStage {
                    source_id,
                    stage: existing.source.stage,
                    message: "already tracked".to_string(),
                });
            }
        }

        let pack_id = pack_id.or_else(|| self.pack_containing(&source_id));
        let mut source = Source::new(source_id.clone(), pack_id.clone());
        let transition = apply(&mut source, StageEvent::Submitted);

        if let Some(pack_id) = &pack_id {
            if let Some(pack) = self.packs.get_mut(pack_id) {
                if !pack.contains(&source_id) {
                    pack.source_ids.push(source_id.clone());
                }
            }
        }

        if let Some(mut previous) = self
            .sources
            .insert(source_id.clone(), TrackedSource::new(source, Utc::now().timestamp_millis()))
        {
            previous.stop_polling();
        }

        self.log.info(Some(&source_id), "Upload accepted, extraction started");
        self.record_transition(&source_id, &transition);
        self.start_polling(&source_id, PollTarget::Source(source_id.clone()), PollClass::Extraction);
        self.persist();
        Ok(())
    }

    /// Restore the persisted snapshot and restart polling where it makes sense
    ///
    /// Never re-issues start-analysis. Sessions with a job id are polled by
    /// job; terminal sessions are kept as history only.
    pub async fn resume(&mut self) -> OrchestratorResult<Vec<SourceId>> {
        self.restore_sessions(true).await
    }

    /// Restore the persisted snapshot without polling anything
    pub async fn restore(&mut self) -> OrchestratorResult<usize> {
        self.restore_sessions(false).await.map(|_| self.sources.len())
    }

    async fn restore_sessions(&mut self, start_polling: bool) -> OrchestratorResult<Vec<SourceId>> {
        let Some(snapshot) = self.store.load().await? else {
            debug!("No persisted session");
            return Ok(Vec::new());
        };

        if self.log.is_empty() {
            self.log.restore(snapshot.log_tail);
        }
        let mut resumed = Vec::new();

        for session in snapshot.sessions {
            let source_id = session.source_id.clone();
            if !self.sources.contains_key(&source_id) {
                self.sources.insert(
                    source_id.clone(),
                    TrackedSource::new(session.to_source(), session.started_at),
                );
            } else if !start_polling || self.sources.get(&source_id).is_some_and(TrackedSource::is_polling) {
                continue;
            }
            if !start_polling {
                continue;
            }

            match resume_plan(&session) {
                Some((target, class)) => {
                    if let (PollTarget::Job(job_id), true) = (&target, session.is_resumable()) {
                        self.log.info(
                            Some(&source_id),
                            format!("Resuming {} job {} from saved session", session.stage, job_id),
                        );
                        self.events.emit_lossy(PackrunEvent::SessionResumed {
                            source_id: source_id.clone(),
                            job_id: job_id.clone(),
                            stage: session.stage,
                            timestamp: Utc::now(),
                        });
                    } else {
                        self.log.info(
                            Some(&source_id),
                            format!("Resuming {} from saved session", session.stage),
                        );
                    }
                    self.start_polling(&source_id, target, class);
                    resumed.push(source_id);
                }
                None if session.stage.is_terminal() => {
                    debug!(source_id = %source_id, stage = %session.stage, "Restored finished session");
                }
                None => {
                    self.log.warn(
                        Some(&source_id),
                        format!("Restored in {}; use retry to poll again", session.stage),
                    );
                }
            }
        }

        self.persist();
        Ok(resumed)
    }

    /// Wait for the next poll update and apply it
    ///
    /// Updates that change nothing the caller cares about are absorbed.
    pub async fn next_event(&mut self) -> OrchestratorResult<OrchestratorEvent> {
        loop {
            let Some(message) = self.updates_rx.recv().await else {
                return Err(OrchestratorError::Common(packrun_common::Error::Internal(
                    "poll update channel closed".to_string(),
                )));
            };

            let current = self
                .sources
                .get(&message.source_id)
                .and_then(|t| t.poll.as_ref())
                .map(|p| p.generation);
            if current != Some(message.generation) {
                debug!(source_id = %message.source_id, "Discarding late poll update");
                continue;
            }

            if let Some(event) = self.handle_update(message.source_id, message.update).await? {
                return Ok(event);
            }
        }
    }

    async fn handle_update(
        &mut self,
        source_id: SourceId,
        update: PollUpdate,
    ) -> OrchestratorResult<Option<OrchestratorEvent>> {
        match update {
            PollUpdate::Report(report) => {
                let Some(tracked) = self.sources.get_mut(&source_id) else {
                    return Ok(None);
                };
                let before = tracked.source.clone();
                let transition = apply(&mut tracked.source, StageEvent::Polled(report));

                let event = match &transition {
                    Transition::Moved { from, to } => Some(OrchestratorEvent::StageChanged {
                        source_id: source_id.clone(),
                        from: *from,
                        to: *to,
                    }),
                    Transition::Stayed { stage } if tracked.source != before => {
                        Some(OrchestratorEvent::Progress {
                            source_id: source_id.clone(),
                            stage: *stage,
                            progress: tracked.source.progress,
                            processed_units: tracked.source.processed_units,
                            total_units: tracked.source.total_units,
                        })
                    }
                    _ => None,
                };

                self.record_transition(&source_id, &transition);
                if event.is_some() {
                    self.persist();
                }
                Ok(event)
            }
            PollUpdate::Connection {
                status,
                consecutive_failures,
                next_retry,
            } => {
                let Some(tracked) = self.sources.get_mut(&source_id) else {
                    return Ok(None);
                };
                let previous = tracked.connection;
                tracked.connection = status;
                tracked.consecutive_failures = consecutive_failures;

                if status == ConnectionStatus::Connected && previous == ConnectionStatus::Connected {
                    return Ok(None);
                }

                match status {
                    ConnectionStatus::Connected => {
                        self.log.info(Some(&source_id), "Connection restored");
                    }
                    ConnectionStatus::Warning => {
                        let retry_in = next_retry.map(|d| format_duration(d.as_secs())).unwrap_or_default();
                        self.log.warn(
                            Some(&source_id),
                            format!(
                                "Status check failed ({} in a row), retrying in {}",
                                consecutive_failures, retry_in
                            ),
                        );
                    }
                    ConnectionStatus::Disconnected => {
                        self.log.error(
                            Some(&source_id),
                            format!(
                                "Connection lost after {} failed status checks; retry manually",
                                consecutive_failures
                            ),
                        );
                    }
                }

                self.events.emit_lossy(PackrunEvent::ConnectionStatusChanged {
                    source_id: source_id.clone(),
                    status,
                    consecutive_failures,
                    timestamp: Utc::now(),
                });
                self.persist();

                Ok(Some(OrchestratorEvent::Connection {
                    source_id,
                    status,
                    consecutive_failures,
                    next_retry,
                }))
            }
            PollUpdate::AuthRequired => {
                self.log.warn(Some(&source_id), "Session expired; sign in again and retry");
                self.events.emit_lossy(PackrunEvent::AuthenticationRequired {
                    source_id: source_id.clone(),
                    timestamp: Utc::now(),
                });
                self.persist();
                Ok(Some(OrchestratorEvent::AuthRequired { source_id }))
            }
            PollUpdate::TimedOut { elapsed } => {
                let stage = self
                    .source(&source_id)
                    .map(|s| s.stage)
                    .unwrap_or(Stage::Extracting);
                let timeout = OrchestratorError::Timeout { stage, elapsed };
                self.log.info(Some(&source_id), timeout.to_string());
                self.events.emit_lossy(PackrunEvent::PollingTimedOut {
                    source_id: source_id.clone(),
                    stage,
                    elapsed_seconds: elapsed.as_secs(),
                    timestamp: Utc::now(),
                });
                self.persist();
                Ok(Some(OrchestratorEvent::TimedOut {
                    source_id,
                    stage,
                    elapsed,
                }))
            }
            PollUpdate::Ended(outcome) => self.handle_poll_ended(source_id, outcome).await,
        }
    }

    async fn handle_poll_ended(
        &mut self,
        source_id: SourceId,
        outcome: PollOutcome,
    ) -> OrchestratorResult<Option<OrchestratorEvent>> {
        let Some(tracked) = self.sources.get_mut(&source_id) else {
            return Ok(None);
        };
        tracked.poll = None;
        let job_id = tracked.source.job_id.clone();

        match outcome {
            PollOutcome::HandedOff(Stage::ReadyForAnalysis) => self.open_credit_gate(&source_id).await.map(Some),
            PollOutcome::HandedOff(stage) => {
                // analysis already running, possibly started elsewhere
                let class = PollClass::for_stage(stage).unwrap_or(PollClass::Analysis);
                let target = match job_id {
                    Some(job_id) => PollTarget::Job(job_id),
                    None => PollTarget::Source(source_id.clone()),
                };
                self.start_polling(&source_id, target, class);
                Ok(None)
            }
            outcome => Ok(Some(OrchestratorEvent::PollingEnded { source_id, outcome })),
        }
    }

    /// Fetch the credit check and present the gate
    pub async fn open_credit_gate(&mut self, source_id: &SourceId) -> OrchestratorResult<OrchestratorEvent> {
        self.require_stage(source_id, Stage::ReadyForAnalysis)?;

        let check = match self.gate.check_credits(source_id).await {
            Ok(check) => check,
            Err(e) => {
                self.log.error(Some(source_id), format!("Credit check failed: {}", e));
                self.persist();
                return Err(e);
            }
        };

        if check.is_empty() {
            self.log.info(Some(source_id), "Nothing to analyze");
            self.persist();
            return Ok(OrchestratorEvent::NothingToAnalyze {
                source_id: source_id.clone(),
            });
        }

        self.present_gate(source_id, &check);
        self.persist();
        Ok(OrchestratorEvent::CreditGateOpened {
            source_id: source_id.clone(),
            check,
        })
    }

    fn present_gate(&mut self, source_id: &SourceId, check: &CreditCheck) {
        let message = if check.has_unlimited {
            format!("Ready to analyze {} units (unlimited plan)", check.total_units)
        } else if check.can_proceed {
            format!(
                "Ready to analyze {} of {} units with {} credits",
                check.allowed_units, check.total_units, check.user_credits
            )
        } else {
            format!(
                "Ready to analyze {} units; {} more credits needed",
                check.total_units, check.credits_needed
            )
        };
        self.log.info(Some(source_id), message);

        self.events.emit_lossy(PackrunEvent::CreditGateOpened {
            source_id: source_id.clone(),
            total_units: check.total_units,
            user_credits: check.user_credits,
            has_unlimited: check.has_unlimited,
            allowed_units: check.allowed_units,
            can_proceed: check.can_proceed,
            credits_needed: check.credits_needed,
            timestamp: Utc::now(),
        });
    }

    /// Confirm the credit gate and start analysis
    pub async fn confirm_analysis(
        &mut self,
        source_id: &SourceId,
        requested_units: Option<u64>,
    ) -> OrchestratorResult<StartResult> {
        self.require_stage(source_id, Stage::ReadyForAnalysis)?;

        let result = match self.gate.confirm(source_id, requested_units).await {
            Ok(result) => result,
            Err(e) => {
                self.log.error(Some(source_id), format!("Could not start analysis: {}", e));
                self.persist();
                return Err(e);
            }
        };

        match &result {
            StartResult::Started { job_id, units } => {
                self.start_analysis_polling(source_id, job_id.clone(), *units);
            }
            StartResult::Denied { check } => {
                self.log.warn(
                    Some(source_id),
                    format!("Not enough credits: {} more needed", check.credits_needed),
                );
            }
            StartResult::NothingToAnalyze => {
                self.log.info(Some(source_id), "Nothing to analyze");
            }
            StartResult::GateReopened { check, detail } => {
                self.log.warn(Some(source_id), format!("Analysis refused: {}", detail));
                let check = *check;
                self.present_gate(source_id, &check);
            }
        }

        self.persist();
        Ok(result)
    }

    fn start_analysis_polling(&mut self, source_id: &SourceId, job_id: JobId, units: u64) {
        let Some(tracked) = self.sources.get_mut(source_id) else {
            return;
        };
        let transition = apply(
            &mut tracked.source,
            StageEvent::AnalysisAccepted {
                job_id: job_id.clone(),
            },
        );

        self.log.info(
            Some(source_id),
            format!("Analysis started on {} units (job {})", units, job_id),
        );
        self.events.emit_lossy(PackrunEvent::AnalysisStarted {
            source_id: source_id.clone(),
            job_id: job_id.clone(),
            units,
            timestamp: Utc::now(),
        });
        self.record_transition(source_id, &transition);
        self.start_polling(source_id, PollTarget::Job(job_id), PollClass::Analysis);
    }

    /// Cancel a Source: stop polling, tell the backend, settle billing
    pub async fn cancel(&mut self, source_id: &SourceId) -> OrchestratorResult<CancelOutcome> {
        let tracked = self
            .sources
            .get_mut(source_id)
            .ok_or_else(|| OrchestratorError::UnknownSource(source_id.clone()))?;
        if tracked.source.stage.is_terminal() {
            return Err(OrchestratorError::InvalidStage {
                source_id: source_id.clone(),
                stage: tracked.source.stage,
                message: "nothing to cancel".to_string(),
            });
        }

        let poll = tracked.poll.take().map(|active| active.handle);
        let job_id = tracked.source.job_id.clone();
        let request = CancelRequest {
            source_id,
            job_id: job_id.as_ref(),
            processed_units: tracked.source.processed_units,
        };
        let report = self.canceller.cancel(request, poll).await;

        let event = match report.outcome {
            CancelOutcome::CancelUncertain { .. } => StageEvent::CancelUnconfirmed,
            _ => StageEvent::CancelAcknowledged {
                processed_units: report.reported_units,
            },
        };

        let Some(tracked) = self.sources.get_mut(source_id) else {
            return Ok(report.outcome);
        };
        let transition = apply(&mut tracked.source, event);
        tracked.cancel_outcome = Some(report.outcome.clone());

        match &report.outcome {
            CancelOutcome::PartialCharge { billed_units } => self.log.info(
                Some(source_id),
                format!(
                    "Cancelled; {} processed units billed and removed from the remaining pool",
                    billed_units
                ),
            ),
            CancelOutcome::NoCharge => self.log.info(Some(source_id), "Cancelled; no charge"),
            CancelOutcome::CancelUncertain { reason } => self.log.error(
                Some(source_id),
                format!("{}; server state unknown", reason),
            ),
        }

        self.events.emit_lossy(PackrunEvent::CancelResolved {
            source_id: source_id.clone(),
            outcome: report.outcome.clone(),
            timestamp: Utc::now(),
        });
        self.record_transition(source_id, &transition);
        self.persist();
        Ok(report.outcome)
    }

    /// Restart polling by hand (after disconnect, timeout, auth refresh or
    /// an uncertain cancel)
    pub fn retry(&mut self, source_id: &SourceId) -> OrchestratorResult<()> {
        let tracked = self
            .sources
            .get_mut(source_id)
            .ok_or_else(|| OrchestratorError::UnknownSource(source_id.clone()))?;
        let stage = tracked.source.stage;
        if stage.is_terminal() {
            return Err(OrchestratorError::InvalidStage {
                source_id: source_id.clone(),
                stage,
                message: "already finished".to_string(),
            });
        }
        if tracked.is_polling() {
            return Ok(());
        }

        tracked.connection = ConnectionStatus::Connected;
        tracked.consecutive_failures = 0;
        let (target, class) = retry_plan(&tracked.source);

        self.log.info(Some(source_id), format!("Retrying status checks ({})", stage));
        self.start_polling(source_id, target, class);
        self.persist();
        Ok(())
    }

    pub fn register_pack(&mut self, pack: Pack) {
        for source_id in &pack.source_ids {
            if let Some(tracked) = self.sources.get_mut(source_id) {
                tracked.source.pack_id = Some(pack.id.clone());
            }
        }
        self.packs.insert(pack.id.clone(), pack);
        self.persist();
    }

    /// Delete a pack: stop polling for and drop every one of its Sources
    pub fn delete_pack(&mut self, pack_id: &PackId) -> OrchestratorResult<Vec<SourceId>> {
        let pack = self.packs.remove(pack_id);
        let mut doomed: Vec<SourceId> = self
            .sources
            .values()
            .filter(|t| t.source.pack_id.as_ref() == Some(pack_id))
            .map(|t| t.source.id.clone())
            .collect();
        if let Some(pack) = &pack {
            doomed.extend(pack.source_ids.iter().filter(|id| self.sources.contains_key(*id)).cloned());
        }
        doomed.sort();
        doomed.dedup();

        if pack.is_none() && doomed.is_empty() {
            return Err(OrchestratorError::Common(packrun_common::Error::NotFound(format!(
                "pack {}",
                pack_id
            ))));
        }

        for source_id in &doomed {
            self.drop_source(source_id);
        }
        self.log.info(
            None,
            format!("Pack {} deleted ({} sources removed)", pack_id, doomed.len()),
        );
        self.persist();
        Ok(doomed)
    }

    /// Stop tracking one Source
    pub fn remove_source(&mut self, source_id: &SourceId) -> OrchestratorResult<()> {
        if !self.sources.contains_key(source_id) {
            return Err(OrchestratorError::UnknownSource(source_id.clone()));
        }
        self.drop_source(source_id);
        for pack in self.packs.values_mut() {
            pack.source_ids.retain(|id| id != source_id);
        }
        self.log.info(Some(source_id), "Removed from the working set");
        self.persist();
        Ok(())
    }

    fn drop_source(&mut self, source_id: &SourceId) {
        if let Some(mut tracked) = self.sources.remove(source_id) {
            tracked.stop_polling();
        }
        self.gate.forget(source_id);
    }

    /// Stop everything and forget the persisted session
    pub async fn reset(&mut self) -> OrchestratorResult<()> {
        for tracked in self.sources.values_mut() {
            tracked.stop_polling();
        }
        let ids: Vec<SourceId> = self.sources.keys().cloned().collect();
        for id in &ids {
            self.gate.forget(id);
        }
        self.sources.clear();
        self.packs.clear();
        self.log.clear();
        self.store.clear().await?;
        tracing::info!("Session reset");
        Ok(())
    }

    /// Stop all polling and write the session synchronously
    pub async fn shutdown(mut self) -> OrchestratorResult<()> {
        for tracked in self.sources.values_mut() {
            tracked.stop_polling();
        }
        self.store.save(self.snapshot());
        self.store.close().await?;
        tracing::info!("Orchestrator stopped, session saved");
        Ok(())
    }

    /// Write the pending session now without stopping
    pub async fn flush(&self) -> OrchestratorResult<()> {
        self.store.save(self.snapshot());
        self.store.flush().await?;
        Ok(())
    }

    fn start_polling(&mut self, source_id: &SourceId, target: PollTarget, class: PollClass) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let tx = self.updates_tx.clone();
        let id = source_id.clone();
        let handle = self.engine.start_polling(target, class, move |update| {
            let _ = tx.send(PollMessage {
                source_id: id.clone(),
                generation,
                update,
            });
        });

        if let Some(tracked) = self.sources.get_mut(source_id) {
            tracked.stop_polling();
            tracked.poll = Some(ActivePoll { handle, generation });
        }
    }

    fn record_transition(&mut self, source_id: &SourceId, transition: &Transition) {
        match transition {
            Transition::Moved { from, to } => {
                let Some(source) = self.sources.get(source_id).map(|t| t.source.clone()) else {
                    return;
                };
                match (to, &source.error_message) {
                    (Stage::Failed, Some(error)) => {
                        self.log.error(Some(source_id), format!("{} → failed: {}", from, error))
                    }
                    _ => self.log.info(Some(source_id), format!("{} → {}", from, to)),
                }
                self.events.emit_lossy(PackrunEvent::SourceStageChanged {
                    source_id: source_id.clone(),
                    old_stage: *from,
                    new_stage: *to,
                    progress: source.progress,
                    processed_units: source.processed_units,
                    total_units: source.total_units.unwrap_or(0),
                    timestamp: Utc::now(),
                });
            }
            Transition::Stayed { .. } => {}
            Transition::Ignored(IgnoreReason::Unrecognized(status)) => {
                debug!(source_id = %source_id, status = %status, "Unrecognized status, stage unchanged");
            }
            Transition::Ignored(reason) => {
                debug!(source_id = %source_id, ?reason, "Event ignored");
            }
        }
    }

    fn persist(&self) {
        self.store.save(self.snapshot());
    }

    fn require_stage(&self, source_id: &SourceId, expected: Stage) -> OrchestratorResult<()> {
        let source = self
            .source(source_id)
            .ok_or_else(|| OrchestratorError::UnknownSource(source_id.clone()))?;
        if source.stage != expected {
            return Err(OrchestratorError::InvalidStage {
                source_id: source_id.clone(),
                stage: source.stage,
                message: format!("expected {}", expected),
            });
        }
        Ok(())
    }

    fn pack_containing(&self, source_id: &SourceId) -> Option<PackId> {
        self.packs
            .values()
            .find(|pack| pack.contains(source_id))
            .map(|pack| pack.id.clone())
    }
}

/// Where to poll a restored session, if anywhere
fn resume_plan(session: &ProcessingSession) -> Option<(PollTarget, PollClass)> {
    if session.stage.is_terminal() || session.stage == Stage::CancelUncertain {
        return None;
    }
    Some(poll_plan(&session.source_id, session.job_id.as_ref(), session.stage))
}

fn retry_plan(source: &Source) -> (PollTarget, PollClass) {
    poll_plan(&source.id, source.job_id.as_ref(), source.stage)
}

fn poll_plan(source_id: &SourceId, job_id: Option<&JobId>, stage: Stage) -> (PollTarget, PollClass) {
    let class = match stage {
        Stage::Analyzing | Stage::BackgroundMode => PollClass::for_stage(stage).unwrap_or(PollClass::Analysis),
        Stage::CancelUncertain if job_id.is_some() => PollClass::Analysis,
        _ => PollClass::Extraction,
    };
    let target = match (class, job_id) {
        (PollClass::Analysis | PollClass::Background, Some(job_id)) => PollTarget::Job(job_id.clone()),
        _ => PollTarget::Source(source_id.clone()),
    };
    (target, class)
}
