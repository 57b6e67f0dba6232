//! Event system for packrun
//!
//! Provides shared event definitions and the EventBus used by the
//! orchestrator to publish Source lifecycle changes.

mod job_types;

pub use job_types::{CancelOutcome, ConnectionStatus, Stage};

use crate::ids::{JobId, SourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// packrun event types
///
/// Events are broadcast via EventBus and serialize with a `type` tag so a
/// front end can consume them as JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PackrunEvent {
    /// A Source moved to a new stage
    SourceStageChanged {
        source_id: SourceId,
        old_stage: Stage,
        new_stage: Stage,
        /// Percent complete within the new stage (0-100)
        progress: u8,
        processed_units: u64,
        total_units: u64,
        timestamp: DateTime<Utc>,
    },

    /// Polling connection health changed for a Source
    ConnectionStatusChanged {
        source_id: SourceId,
        status: ConnectionStatus,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// Source reached `ready_for_analysis`; caller must confirm before analysis starts
    CreditGateOpened {
        source_id: SourceId,
        total_units: u64,
        user_credits: u64,
        has_unlimited: bool,
        allowed_units: u64,
        can_proceed: bool,
        credits_needed: u64,
        timestamp: DateTime<Utc>,
    },

    /// Backend accepted a start-analysis command
    AnalysisStarted {
        source_id: SourceId,
        job_id: JobId,
        units: u64,
        timestamp: DateTime<Utc>,
    },

    /// Wall-clock polling ceiling exceeded; job still running server-side
    PollingTimedOut {
        source_id: SourceId,
        stage: Stage,
        elapsed_seconds: u64,
        timestamp: DateTime<Utc>,
    },

    /// Credentials rejected; polling stopped until the caller restarts it
    AuthenticationRequired {
        source_id: SourceId,
        timestamp: DateTime<Utc>,
    },

    /// A cancel request finished
    CancelResolved {
        source_id: SourceId,
        outcome: CancelOutcome,
        timestamp: DateTime<Utc>,
    },

    /// Polling restarted from a persisted session
    SessionResumed {
        source_id: SourceId,
        job_id: JobId,
        stage: Stage,
        timestamp: DateTime<Utc>,
    },
}

impl PackrunEvent {
    pub fn source_id(&self) -> &SourceId {
        match self {
            PackrunEvent::SourceStageChanged { source_id, .. }
            | PackrunEvent::ConnectionStatusChanged { source_id, .. }
            | PackrunEvent::CreditGateOpened { source_id, .. }
            | PackrunEvent::AnalysisStarted { source_id, .. }
            | PackrunEvent::PollingTimedOut { source_id, .. }
            | PackrunEvent::AuthenticationRequired { source_id, .. }
            | PackrunEvent::CancelResolved { source_id, .. }
            | PackrunEvent::SessionResumed { source_id, .. } => source_id,
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use packrun_common::events::{EventBus, PackrunEvent};
/// use packrun_common::SourceId;
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(PackrunEvent::AuthenticationRequired {
///     source_id: SourceId::new("src_1"),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(PackrunEvent::AuthenticationRequired { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PackrunEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// `capacity` is the number of events buffered before the oldest are
    /// dropped for lagging subscribers.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<PackrunEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if nobody is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PackrunEvent,
    ) -> Result<usize, broadcast::error::SendError<PackrunEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PackrunEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
