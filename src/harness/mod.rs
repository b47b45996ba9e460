//! Process-supervision core shared by every stressor.
//!
//! Dozens of independent workloads hammer one OS facility each; this
//! module is the machinery they all run on: it forks workers, drives them
//! under a time/op budget, propagates cooperative and forceful stop
//! requests, reaps reliably even while syscalls are being stressed, and
//! aggregates counters across the fork boundary.
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────────────┐
//!                   │  Run supervisor  │  runner: budgets, interrupts,
//!                   │   (main proc)    │  teardown, result collection
//!                   └────────┬─────────┘
//!                            │ fork (one per instance)
//!            ┌───────────────┼───────────────┐
//!      ┌─────▼─────┐   ┌─────▼─────┐   ┌─────▼─────┐
//!      │ Instance 0 │  │ Instance 1 │  │ Instance N │   stressor body;
//!      │ supervisor │  │ supervisor │  │ supervisor │   may fork payload
//!      └─────┬─────┘   └───────────┘   └───────────┘    workers of its own
//!            │
//!       ┌────▼────┐        shared MAP_ANONYMOUS region:
//!       │ workers │  ───►  stop flag + per-instance counters,
//!       └─────────┘        metrics, forced-kill diagnostics
//! ```
//!
//! Cancellation is cooperative: payload loops poll the stop decision at
//! iteration granularity, and a hard escalation path (forced kill after a
//! bounded number of interrupted waits) exists for workers that stop
//! cooperating.

mod control;
mod counter;
mod instance;
mod oomable;
mod reap;
mod runner;
mod spawn;
mod worker;

pub use control::{RunControl, install_interrupt_handlers, interrupt_pending};
pub use counter::{InstanceSlot, MAX_METRICS, Metric, SharedRegion};
pub use instance::Instance;
pub use oomable::run_oomable;
pub use reap::{ProcessOps, ReapOutcome, Reaper, kill_pid};
pub use runner::{InstanceResult, RunConfig, RunResults, STOP_SIGNAL, run};
pub use spawn::{Spawned, parent_died_alarm, spawn_worker};
pub use worker::{ExitStatus, WorkerHandle, WorkerOutcome, WorkerRole, WorkerState};
