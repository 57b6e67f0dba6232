//! Source lifecycle workflow
//!
//! The stage machine is the only code allowed to change a Source's stage
//! or counters. Everything else (polling, credit gate, cancellation)
//! produces `StageEvent`s and hands them to `stage_machine::apply`.

pub mod stage_machine;

pub use stage_machine::{apply, next_stage, IgnoreReason, RemoteStatus, StageEvent, Transition};
