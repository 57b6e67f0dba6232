//! Human-readable activity history
//!
//! Bounded to the most recent entries. Every entry is mirrored to tracing.
//! Advisory only: nothing reads it back to decide state.

use crate::models::{LogEntry, LogLevel};
use chrono::Utc;
use packrun_common::SourceId;
use std::collections::VecDeque;

pub use crate::db::sessions::LOG_TAIL_LIMIT;

#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(LOG_TAIL_LIMIT)
    }
}

impl ActivityLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn info(&mut self, source_id: Option<&SourceId>, message: impl Into<String>) {
        self.record(LogLevel::Info, source_id, message.into());
    }

    pub fn warn(&mut self, source_id: Option<&SourceId>, message: impl Into<String>) {
        self.record(LogLevel::Warn, source_id, message.into());
    }

    pub fn error(&mut self, source_id: Option<&SourceId>, message: impl Into<String>) {
        self.record(LogLevel::Error, source_id, message.into());
    }

    fn record(&mut self, level: LogLevel, source_id: Option<&SourceId>, message: String) {
        let source = source_id.map(|s| s.as_str()).unwrap_or("-");
        match level {
            LogLevel::Info => tracing::info!(source_id = source, "{}", message),
            LogLevel::Warn => tracing::warn!(source_id = source, "{}", message),
            LogLevel::Error => tracing::error!(source_id = source, "{}", message),
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            at: Utc::now(),
            source_id: source_id.cloned(),
            level,
            message,
        });
    }

    /// Replace contents with a persisted tail (oldest first)
    pub fn restore(&mut self, entries: Vec<LogEntry>) {
        let skip = entries.len().saturating_sub(self.capacity);
        self.entries = entries.into_iter().skip(skip).collect();
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
