//! Workers that drain the task queue.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │  Host Process   │
//!                     │ (pool, reaper)  │
//!                     └────────┬────────┘
//!                              │ creates
//!                     ┌────────▼────────┐
//!                     │  Shared Region  │
//!                     │ header + slots  │
//!                     └────────┬────────┘
//!               ┌──────────────┼──────────────┐
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │ Transform │  │ Transform │  │ Transform │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Workers never talk to the host directly. They poll the region for
//! pending slots and watch its termination flag. The host only spawns,
//! reaps and, past the grace period, kills them.
//!
//! # Features
//!
//! - **Process or thread workers**: processes attach to a file-backed
//!   region; threads share an anonymous one
//! - **Crash recovery**: dead workers are classified and respawned
//! - **Lease reaper**: slots stuck behind a dead worker or an abandoned
//!   wait are failed and later reclaimed

mod pool;
mod proc;
mod signals;
mod spawn;
mod watchdog;
mod worker_main;

pub use pool::{ShutdownReport, WorkerPool, WorkerPoolStats};
pub use signals::{TerminationReason, WorkerFailure};
pub use watchdog::{LeaseWatchdog, scan_interval_for};
pub use worker_main::{WorkerLoop, WorkerSummary, run_worker_main};
