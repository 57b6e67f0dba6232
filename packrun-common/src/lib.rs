//! # packrun common library
//!
//! Shared code for the packrun crates:
//! - Common error type
//! - Configuration loading and root folder resolution
//! - Opaque backend identifiers
//! - Job event types and the EventBus
//! - Human-readable time formatting

pub mod config;
pub mod error;
pub mod events;
pub mod human_time;
pub mod ids;

pub use error::{Error, Result};
pub use events::{CancelOutcome, ConnectionStatus, Stage};
pub use ids::{JobId, PackId, SourceId};
