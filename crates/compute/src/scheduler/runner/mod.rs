//! Scheduler runner -- the single-writer event loop of one run.
//!
//! Split into focused submodules:
//! - `core`: Scheduler struct, constructor, report types and accessors
//! - `scheduling`: seeding, placement and dispatch under back-pressure
//! - `execution`: the event loop and completion/failure handling

mod core;
mod execution;
mod scheduling;

pub use self::core::{NodeFailure, Outcome, RunReport, Scheduler};
