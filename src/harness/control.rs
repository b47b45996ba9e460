//! Run controller: the merged, monotone stop decision.
//!
//! Payload loops call [`RunControl::should_continue`] every iteration, so
//! the predicate has to stay cheap and must never block. Stop sources are
//! the elapsed-time budget, the per-instance operation budget, an external
//! interrupt (SIGINT/SIGTERM) and the instance-local fatal error flag.
//! Once any source fires, the merged decision never reverts to "continue"
//! for the remainder of the run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use super::counter::{InstanceSlot, SharedRegion};
use crate::error::Result;

/// Shared handle on the run's continuation decision.
///
/// Cheap to clone; clones taken across a fork observe the same stop flag
/// through the shared region.
#[derive(Clone)]
pub struct RunControl {
    shared: Arc<SharedRegion>,
    deadline: Option<Instant>,
    max_ops: Option<u64>,
}

impl RunControl {
    /// Build a controller over a shared region with the given budgets.
    /// `timeout` and `max_ops` of `None` mean unlimited.
    pub fn new(shared: Arc<SharedRegion>, timeout: Option<Duration>, max_ops: Option<u64>) -> Self {
        Self {
            shared,
            deadline: timeout.map(|t| Instant::now() + t),
            max_ops,
        }
    }

    /// Access an instance's counter slot.
    pub fn slot(&self, instance: u32) -> &InstanceSlot {
        self.shared.slot(instance as usize)
    }

    /// The run-global part of the decision: stop flag and time budget.
    ///
    /// A passed deadline is latched into the shared stop flag so every
    /// process converges on "stop" even if only one of them checks the
    /// clock.
    pub fn keep_running(&self) -> bool {
        if self.shared.stop_requested() {
            return false;
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            self.shared.request_stop();
            return false;
        }
        true
    }

    /// The full per-instance decision: global state plus the op budget and
    /// the instance's fatal error flag.
    pub fn should_continue(&self, instance: u32) -> bool {
        if !self.keep_running() {
            return false;
        }
        let slot = self.slot(instance);
        if slot.failed() {
            return false;
        }
        if let Some(max_ops) = self.max_ops
            && slot.counter() >= max_ops
        {
            return false;
        }
        true
    }

    /// Latch the run-global stop flag.
    pub fn request_stop(&self) {
        self.shared.request_stop();
    }
}

/// Set by the signal handler, polled by the supervision loop. The handler
/// does nothing but this store; no non-local control flow.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signo: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that raise the interrupt flag.
///
/// Installed without `SA_RESTART` so that blocking reap waits observe
/// `EINTR` and re-check the stop decision.
pub fn install_interrupt_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Whether an external interrupt has been delivered to this process.
pub fn interrupt_pending() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
