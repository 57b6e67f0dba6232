//! Data models for packrun-jo
//!
//! - Source / Pack working-set entities and the polled status report
//! - CreditCheck value object
//! - ProcessingSession persisted snapshot

pub mod credit_check;
pub mod processing_session;
pub mod source;

pub use credit_check::{CreditCheck, CreditCheckResponse};
pub use processing_session::{LogEntry, LogLevel, ProcessingSession, SessionSnapshot};
pub use source::{Pack, Source, StatusReport};
