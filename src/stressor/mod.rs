//! Stressor payloads.
//!
//! Each stressor exercises one OS facility under load. Payloads consume
//! the supervision core through [`Instance`]: they poll
//! `should_continue()` at loop granularity, count one bogo-operation per
//! unit of work, and record named rate metrics at teardown.

mod flock;
mod mlock;
mod pipe;

use crate::harness::{ExitStatus, Instance};

/// A workload exercising one OS facility. Implementations are
/// discovered through [`REGISTRY`].
pub trait Stressor: Sync {
    /// Registry name, as given on the command line.
    fn name(&self) -> &'static str;

    /// One-line description for `pummel list`.
    fn description(&self) -> &'static str;

    /// The payload body, executed inside a per-instance supervisor
    /// process.
    fn run(&self, instance: &Instance) -> ExitStatus;
}

/// Static registration list of every built-in stressor, in name order.
pub static REGISTRY: &[&'static dyn Stressor] = &[&flock::Flock, &mlock::Mlock, &pipe::Pipe];

/// Look a stressor up by registry name.
pub fn find(name: &str) -> Option<&'static dyn Stressor> {
    REGISTRY.iter().copied().find(|s| s.name() == name)
}
