//! Polling engine
//!
//! One tokio task per polled target. A task issues at most one status
//! request at a time and only schedules the next one after the previous
//! request settled, so responses for a target arrive in order.
//!
//! Interval: fast while any target is in an active-processing stage,
//! slow keepalive otherwise. Failures back off exponentially; the loop
//! halts at the failure ceiling or when the class's wall-clock ceiling
//! is exceeded. Errors that are not retryable halt it at once. Stopping the handle cancels the pending sleep or request
//! and the late response, if any, is discarded.

use crate::error::OrchestratorError;
use crate::models::StatusReport;
use crate::services::api_client::{PipelineApi, PollTarget};
use crate::workflow::RemoteStatus;
use packrun_common::{ConnectionStatus, Stage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// `delay = min(base × multiplier^(failures-1), cap)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry following `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(64) as i32;
        let scaled = self.base.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.cap.as_secs_f64() {
            return self.cap;
        }
        Duration::from_secs_f64(scaled).min(self.cap)
    }
}

/// Polling tunables
#[derive(Debug, Clone, PartialEq)]
pub struct PollingSettings {
    pub fast_interval: Duration,
    pub slow_interval: Duration,
    pub backoff: BackoffPolicy,
    pub max_consecutive_failures: u32,
    pub extraction_ceiling: Duration,
    pub analysis_ceiling: Duration,
    pub background_ceiling: Duration,
    /// Per-request timeout for status polls and health probes
    pub status_timeout: Duration,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(2),
            slow_interval: Duration::from_secs(12),
            backoff: BackoffPolicy::default(),
            max_consecutive_failures: 5,
            extraction_ceiling: Duration::from_secs(10 * 60),
            analysis_ceiling: Duration::from_secs(30 * 60),
            background_ceiling: Duration::from_secs(4 * 60 * 60),
            status_timeout: Duration::from_secs(30),
        }
    }
}

/// Polling class decides the wall-clock ceiling and when the loop hands off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollClass {
    /// Until the Source is ready for analysis
    Extraction,
    /// Until a terminal stage
    Analysis,
    /// Large job finishing server-side; keepalive interval
    Background,
}

impl PollClass {
    /// Class to resume polling with for a persisted stage
    pub fn for_stage(stage: Stage) -> Option<PollClass> {
        match stage {
            Stage::Uploading | Stage::Extracting => Some(PollClass::Extraction),
            Stage::Analyzing => Some(PollClass::Analysis),
            Stage::BackgroundMode => Some(PollClass::Background),
            _ => None,
        }
    }

    pub fn ceiling(&self, settings: &PollingSettings) -> Duration {
        match self {
            PollClass::Extraction => settings.extraction_ceiling,
            PollClass::Analysis => settings.analysis_ceiling,
            PollClass::Background => settings.background_ceiling,
        }
    }

    fn hands_off_at(&self, stage: Stage) -> bool {
        match self {
            PollClass::Extraction => matches!(
                stage,
                Stage::ReadyForAnalysis | Stage::Analyzing | Stage::BackgroundMode
            ),
            PollClass::Analysis | PollClass::Background => false,
        }
    }
}

/// Delivered to the poll callback as things happen
#[derive(Debug, Clone, PartialEq)]
pub enum PollUpdate {
    /// Successful status fetch
    Report(StatusReport),
    Connection {
        status: ConnectionStatus,
        consecutive_failures: u32,
        /// Delay before the next attempt, when one is scheduled
        next_retry: Option<Duration>,
    },
    /// Credentials rejected; polling halted without retry
    AuthRequired,
    /// Wall-clock ceiling exceeded; the job may still be running
    TimedOut { elapsed: Duration },
    /// Last update of a loop that ended on its own (not sent after `stop`)
    Ended(PollOutcome),
}

/// Why a poll loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Backend reported a terminal stage
    Finished(Stage),
    /// Extraction-class polling reached a stage another class handles
    HandedOff(Stage),
    Disconnected,
    AuthRequired,
    TimedOut,
    Stopped,
}

/// Handle to a running poll loop
pub struct PollHandle {
    target: PollTarget,
    token: CancellationToken,
    task: Option<JoinHandle<PollOutcome>>,
}

impl PollHandle {
    pub fn target(&self) -> &PollTarget {
        &self.target
    }

    /// Cancel pending timers and in-flight requests for this target
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Wait for the loop to end
    pub async fn join(mut self) -> PollOutcome {
        let Some(task) = self.task.take() else {
            return PollOutcome::Stopped;
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(poll_target = %self.target, error = %e, "Poll task ended abnormally");
                PollOutcome::Stopped
            }
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawns poll loops that share one interval policy
#[derive(Clone)]
pub struct PollingEngine {
    api: Arc<dyn PipelineApi>,
    settings: PollingSettings,
    /// Targets whose last known stage is active-processing
    active_targets: Arc<AtomicUsize>,
}

impl PollingEngine {
    pub fn new(api: Arc<dyn PipelineApi>, settings: PollingSettings) -> Self {
        Self {
            api,
            settings,
            active_targets: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn settings(&self) -> &PollingSettings {
        &self.settings
    }

    pub fn active_targets(&self) -> usize {
        self.active_targets.load(Ordering::SeqCst)
    }

    /// Start polling `target`; `on_update` runs on the poll task
    pub fn start_polling<F>(&self, target: PollTarget, class: PollClass, on_update: F) -> PollHandle
    where
        F: FnMut(PollUpdate) + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let poll_loop = PollLoop {
            api: Arc::clone(&self.api),
            settings: self.settings.clone(),
            gauge: ActiveGauge::new(Arc::clone(&self.active_targets), class != PollClass::Background),
            target: target.clone(),
            class,
            token: token.clone(),
            on_update,
        };

        info!(poll_target = %target, ?class, "Starting polling");
        let task = tokio::spawn(poll_loop.run());

        PollHandle {
            target,
            token,
            task: Some(task),
        }
    }
}

/// Registration of one target in the shared active gauge
struct ActiveGauge {
    counter: Arc<AtomicUsize>,
    registered: bool,
}

impl ActiveGauge {
    fn new(counter: Arc<AtomicUsize>, active: bool) -> Self {
        let mut gauge = Self {
            counter,
            registered: false,
        };
        gauge.set(active);
        gauge
    }

    fn set(&mut self, active: bool) {
        if active && !self.registered {
            self.counter.fetch_add(1, Ordering::SeqCst);
        } else if !active && self.registered {
            self.counter.fetch_sub(1, Ordering::SeqCst);
        }
        self.registered = active;
    }

    fn any_active(&self) -> bool {
        self.counter.load(Ordering::SeqCst) > 0
    }
}

impl Drop for ActiveGauge {
    fn drop(&mut self) {
        self.set(false);
    }
}

struct PollLoop<F> {
    api: Arc<dyn PipelineApi>,
    settings: PollingSettings,
    gauge: ActiveGauge,
    target: PollTarget,
    class: PollClass,
    token: CancellationToken,
    on_update: F,
}

impl<F> PollLoop<F>
where
    F: FnMut(PollUpdate) + Send + Sync + 'static,
{
    async fn run(mut self) -> PollOutcome {
        let outcome = self.poll_until_done().await;
        if outcome != PollOutcome::Stopped {
            (self.on_update)(PollUpdate::Ended(outcome));
        }
        outcome
    }

    async fn poll_until_done(&mut self) -> PollOutcome {
        let mut started = Instant::now();
        let mut failures: u32 = 0;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.class.ceiling(&self.settings) {
                info!(
                    poll_target = %self.target,
                    class = ?self.class,
                    elapsed_secs = elapsed.as_secs(),
                    "Polling ceiling reached, job may still be running"
                );
                (self.on_update)(PollUpdate::TimedOut { elapsed });
                return PollOutcome::TimedOut;
            }

            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => return PollOutcome::Stopped,
                result = self.fetch_status() => result,
            };

            let delay = match result {
                Ok(report) => {
                    failures = 0;
                    (self.on_update)(PollUpdate::Connection {
                        status: ConnectionStatus::Connected,
                        consecutive_failures: 0,
                        next_retry: None,
                    });

                    let stage = match &report.status {
                        RemoteStatus::Known(stage) => Some(*stage),
                        RemoteStatus::Unrecognized(_) => None,
                    };
                    debug!(poll_target = %self.target, status = %report.status.as_str(), "Poll result");
                    (self.on_update)(PollUpdate::Report(report));

                    if let Some(stage) = stage {
                        if stage.is_terminal() {
                            info!(poll_target = %self.target, stage = %stage, "Polling finished");
                            return PollOutcome::Finished(stage);
                        }
                        if self.class.hands_off_at(stage) {
                            debug!(poll_target = %self.target, stage = %stage, "Handing off");
                            return PollOutcome::HandedOff(stage);
                        }
                        if stage == Stage::BackgroundMode && self.class != PollClass::Background {
                            info!(poll_target = %self.target, "Job moved to background mode");
                            self.class = PollClass::Background;
                            started = Instant::now();
                        }
                        self.gauge.set(stage.is_active_processing());
                    }

                    self.next_interval()
                }
                Err(e) if e.is_auth() => {
                    warn!(poll_target = %self.target, error = %e, "Credentials rejected, polling halted");
                    (self.on_update)(PollUpdate::AuthRequired);
                    return PollOutcome::AuthRequired;
                }
                Err(e) if !e.is_retryable() => {
                    error!(poll_target = %self.target, error = %e, "Status poll failed, polling halted");
                    (self.on_update)(PollUpdate::Connection {
                        status: ConnectionStatus::Disconnected,
                        consecutive_failures: failures + 1,
                        next_retry: None,
                    });
                    return PollOutcome::Disconnected;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.settings.max_consecutive_failures {
                        error!(
                            poll_target = %self.target,
                            failures,
                            error = %e,
                            "Connection lost, polling halted"
                        );
                        (self.on_update)(PollUpdate::Connection {
                            status: ConnectionStatus::Disconnected,
                            consecutive_failures: failures,
                            next_retry: None,
                        });
                        return PollOutcome::Disconnected;
                    }

                    let delay = self.settings.backoff.delay_for(failures);
                    warn!(
                        poll_target = %self.target,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Status poll failed, retrying"
                    );
                    (self.on_update)(PollUpdate::Connection {
                        status: ConnectionStatus::Warning,
                        consecutive_failures: failures,
                        next_retry: Some(delay),
                    });
                    delay
                }
            };

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return PollOutcome::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }

            if failures >= 2 {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return PollOutcome::Stopped,
                    _ = self.probe_health() => {}
                }
            }
        }
    }

    async fn fetch_status(&self) -> Result<StatusReport, OrchestratorError> {
        match tokio::time::timeout(self.settings.status_timeout, self.api.fetch_status(&self.target))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Transport(format!(
                "status request timed out after {:?}",
                self.settings.status_timeout
            ))),
        }
    }

    /// Wake a cold backend; the failure counter is untouched either way
    async fn probe_health(&self) {
        match tokio::time::timeout(self.settings.status_timeout, self.api.probe_health()).await {
            Ok(Ok(())) => debug!(poll_target = %self.target, "Health probe ok"),
            Ok(Err(e)) => debug!(poll_target = %self.target, error = %e, "Health probe failed"),
            Err(_) => debug!(poll_target = %self.target, "Health probe timed out"),
        }
    }

    fn next_interval(&self) -> Duration {
        if self.class != PollClass::Background && self.gauge.any_active() {
            self.settings.fast_interval
        } else {
            self.settings.slow_interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorResult;
    use crate::models::CreditCheckResponse;
    use crate::services::api_client::{CancelAck, StartAnalysisAccepted};
    use async_trait::async_trait;
    use packrun_common::{JobId, SourceId};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves scripted status results, then repeats `fallback`
    struct ScriptedStatus {
        script: Mutex<VecDeque<OrchestratorResult<StatusReport>>>,
        fallback: Stage,
        calls: AtomicUsize,
        probes: AtomicUsize,
    }

    impl ScriptedStatus {
        fn new(script: Vec<OrchestratorResult<StatusReport>>, fallback: Stage) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            })
        }
    }

    fn report(stage: Stage) -> OrchestratorResult<StatusReport> {
        Ok(StatusReport::new(RemoteStatus::Known(stage)))
    }

    fn transport() -> OrchestratorResult<StatusReport> {
        Err(OrchestratorError::Transport("connection refused".into()))
    }

    #[async_trait]
    impl PipelineApi for ScriptedStatus {
        async fn fetch_status(&self, _target: &PollTarget) -> OrchestratorResult<StatusReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| report(self.fallback))
        }

        async fn probe_health(&self) -> OrchestratorResult<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_credit_check(&self, _: &SourceId) -> OrchestratorResult<CreditCheckResponse> {
            unreachable!("not used by the polling engine")
        }

        async fn start_analysis(&self, _: &SourceId, _: Option<u64>) -> OrchestratorResult<StartAnalysisAccepted> {
            unreachable!("not used by the polling engine")
        }

        async fn cancel(&self, _: &SourceId, _: Option<&JobId>) -> OrchestratorResult<CancelAck> {
            unreachable!("not used by the polling engine")
        }
    }

    fn collect() -> (Arc<Mutex<Vec<PollUpdate>>>, impl FnMut(PollUpdate) + Send + Sync + 'static) {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        (updates, move |u| sink.lock().unwrap().push(u))
    }

    fn target() -> PollTarget {
        PollTarget::Source(SourceId::new("src-1"))
    }

    #[test]
    fn test_backoff_sequence_and_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for(2), Duration::from_secs(6));
        assert_eq!(policy.delay_for(3), Duration::from_secs(12));
        assert_eq!(policy.delay_for(4), Duration::from_secs(24));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_monotonic_never_exceeds_cap() {
        for multiplier in [1.0, 1.5, 2.0, 3.7] {
            let policy = BackoffPolicy {
                multiplier,
                ..BackoffPolicy::default()
            };
            let mut previous = Duration::ZERO;
            for failures in 1..200 {
                let delay = policy.delay_for(failures);
                assert!(delay >= previous, "multiplier {} failures {}", multiplier, failures);
                assert!(delay <= policy.cap);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_class_for_stage() {
        assert_eq!(PollClass::for_stage(Stage::Extracting), Some(PollClass::Extraction));
        assert_eq!(PollClass::for_stage(Stage::Analyzing), Some(PollClass::Analysis));
        assert_eq!(PollClass::for_stage(Stage::BackgroundMode), Some(PollClass::Background));
        assert_eq!(PollClass::for_stage(Stage::Completed), None);
        assert_eq!(PollClass::for_stage(Stage::ReadyForAnalysis), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_disconnect() {
        let api = ScriptedStatus::new((0..5).map(|_| transport()).collect(), Stage::Extracting);
        let engine = PollingEngine::new(api.clone(), PollingSettings::default());
        let (updates, sink) = collect();

        let outcome = engine
            .start_polling(target(), PollClass::Extraction, sink)
            .join()
            .await;

        assert_eq!(outcome, PollOutcome::Disconnected);
        assert_eq!(api.calls.load(Ordering::SeqCst), 5);
        // probes before the 3rd, 4th and 5th attempts
        assert_eq!(api.probes.load(Ordering::SeqCst), 3);

        let updates = updates.lock().unwrap();
        let statuses: Vec<_> = updates
            .iter()
            .filter_map(|u| match u {
                PollUpdate::Connection { status, consecutive_failures, .. } => {
                    Some((*status, *consecutive_failures))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                (ConnectionStatus::Warning, 1),
                (ConnectionStatus::Warning, 2),
                (ConnectionStatus::Warning, 3),
                (ConnectionStatus::Warning, 4),
                (ConnectionStatus::Disconnected, 5),
            ]
        );
        assert_eq!(engine.active_targets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_counter() {
        let script = vec![
            transport(),
            transport(),
            report(Stage::Extracting),
            transport(),
            report(Stage::ReadyForAnalysis),
        ];
        let api = ScriptedStatus::new(script, Stage::Extracting);
        let engine = PollingEngine::new(api.clone(), PollingSettings::default());
        let (updates, sink) = collect();

        let outcome = engine
            .start_polling(target(), PollClass::Extraction, sink)
            .join()
            .await;

        assert_eq!(outcome, PollOutcome::HandedOff(Stage::ReadyForAnalysis));
        let updates = updates.lock().unwrap();
        assert!(updates.contains(&PollUpdate::Connection {
            status: ConnectionStatus::Warning,
            consecutive_failures: 1,
            next_retry: Some(Duration::from_secs(3)),
        }));
        // the failure after the reset starts over at 1
        let warnings: Vec<u32> = updates
            .iter()
            .filter_map(|u| match u {
                PollUpdate::Connection { status: ConnectionStatus::Warning, consecutive_failures, .. } => {
                    Some(*consecutive_failures)
                }
                _ => None,
            })
            .collect();
        assert_eq!(warnings, vec![1, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extraction_ceiling_times_out() {
        let api = ScriptedStatus::new(Vec::new(), Stage::Extracting);
        let engine = PollingEngine::new(api.clone(), PollingSettings::default());
        let (updates, sink) = collect();
        let started = Instant::now();

        let outcome = engine
            .start_polling(target(), PollClass::Extraction, sink)
            .join()
            .await;

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(600));
        assert!(started.elapsed() < Duration::from_secs(603));
        // fast interval while extracting
        assert_eq!(api.calls.load(Ordering::SeqCst), 300);
        let updates = updates.lock().unwrap();
        assert!(matches!(
            updates[updates.len() - 2],
            PollUpdate::TimedOut { .. }
        ));
        assert_eq!(updates.last(), Some(&PollUpdate::Ended(PollOutcome::TimedOut)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_report_finishes() {
        let script = vec![report(Stage::Analyzing), report(Stage::Completed)];
        let api = ScriptedStatus::new(script, Stage::Analyzing);
        let engine = PollingEngine::new(api.clone(), PollingSettings::default());
        let (_updates, sink) = collect();

        let outcome = engine
            .start_polling(PollTarget::Job(JobId::new("job-1")), PollClass::Analysis, sink)
            .join()
            .await;
        assert_eq!(outcome, PollOutcome::Finished(Stage::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_halts_without_retry() {
        let api = ScriptedStatus::new(
            vec![Err(OrchestratorError::Auth("expired".into()))],
            Stage::Analyzing,
        );
        let engine = PollingEngine::new(api.clone(), PollingSettings::default());
        let (updates, sink) = collect();

        let outcome = engine
            .start_polling(target(), PollClass::Analysis, sink)
            .join()
            .await;

        assert_eq!(outcome, PollOutcome::AuthRequired);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *updates.lock().unwrap(),
            vec![
                PollUpdate::AuthRequired,
                PollUpdate::Ended(PollOutcome::AuthRequired)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_status_halts_without_retry() {
        let api = ScriptedStatus::new(
            vec![Err(OrchestratorError::Decode("expected value at line 1".into()))],
            Stage::Extracting,
        );
        let engine = PollingEngine::new(api.clone(), PollingSettings::default());
        let (updates, sink) = collect();

        let outcome = engine
            .start_polling(target(), PollClass::Extraction, sink)
            .join()
            .await;

        assert_eq!(outcome, PollOutcome::Disconnected);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.probes.load(Ordering::SeqCst), 0);
        assert_eq!(
            *updates.lock().unwrap(),
            vec![
                PollUpdate::Connection {
                    status: ConnectionStatus::Disconnected,
                    consecutive_failures: 1,
                    next_retry: None,
                },
                PollUpdate::Ended(PollOutcome::Disconnected)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_timer() {
        let api = ScriptedStatus::new(Vec::new(), Stage::Analyzing);
        let engine = PollingEngine::new(api.clone(), PollingSettings::default());
        let (updates, sink) = collect();

        let handle = engine.start_polling(target(), PollClass::Analysis, sink);
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.stop();
        assert_eq!(handle.join().await, PollOutcome::Stopped);
        assert!(!updates
            .lock()
            .unwrap()
            .iter()
            .any(|u| matches!(u, PollUpdate::Ended(_))));

        let calls = api.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), calls);
        assert_eq!(engine.active_targets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_mode_uses_keepalive_interval() {
        let api = ScriptedStatus::new(vec![report(Stage::BackgroundMode)], Stage::BackgroundMode);
        let engine = PollingEngine::new(api.clone(), PollingSettings::default());
        let (_updates, sink) = collect();

        let handle = engine.start_polling(target(), PollClass::Analysis, sink);
        tokio::time::sleep(Duration::from_secs(121)).await;
        handle.stop();

        // one poll at t=0 then every 12s
        let calls = api.calls.load(Ordering::SeqCst);
        assert_eq!(calls, 11);
        assert_eq!(engine.active_targets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_active_target_keeps_fast_interval() {
        let busy = ScriptedStatus::new(Vec::new(), Stage::Analyzing);
        let idle = ScriptedStatus::new(Vec::new(), Stage::Uploading);
        let busy_engine = PollingEngine::new(busy.clone(), PollingSettings::default());
        // same gauge, different api
        let idle_engine = PollingEngine {
            api: idle.clone(),
            ..busy_engine.clone()
        };

        let (_a, sink_a) = collect();
        let (_b, sink_b) = collect();
        let busy_handle = busy_engine.start_polling(target(), PollClass::Analysis, sink_a);
        let idle_handle = idle_engine.start_polling(
            PollTarget::Source(SourceId::new("src-2")),
            PollClass::Extraction,
            sink_b,
        );

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(idle.calls.load(Ordering::SeqCst) >= 10);

        busy_handle.stop();
        let _ = busy_handle.join().await;
        let before = idle.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(24)).await;
        // keepalive once nothing is active
        assert!(idle.calls.load(Ordering::SeqCst) - before <= 3);
        idle_handle.stop();
    }
}
