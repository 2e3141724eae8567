//! Exactly-once relay of bridge deposits from a source ledger to a destination ledger
//!
//! Burns observed on the source are recorded, fulfilled on the destination and
//! tracked through `Observed → Submitted → {Confirmed | Failed}`.

pub mod api;
pub mod config;
pub mod contracts;
pub mod engine;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod store;
pub mod types;
pub mod watcher;
