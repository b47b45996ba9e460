//! Per-instance view of the run: the context threaded through every
//! payload loop.

#![allow(dead_code)] // Some accessors exist for payload authors and tests

use super::control::RunControl;
use super::counter::{InstanceSlot, Metric};

/// One stressor instance's handle on its counter slot and the run
/// controller. Cloned into worker processes at fork time; all clones
/// address the same shared slot.
#[derive(Clone)]
pub struct Instance {
    name: &'static str,
    index: u32,
    control: RunControl,
}

impl Instance {
    pub fn new(name: &'static str, index: u32, control: RunControl) -> Self {
        Self {
            name,
            index,
            control,
        }
    }

    /// Stressor name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Instance number within the run.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    fn slot(&self) -> &InstanceSlot {
        self.control.slot(self.index)
    }

    /// Count one bogo-operation.
    #[inline]
    pub fn inc_counter(&self) {
        self.slot().inc_counter();
    }

    /// Read this instance's bogo-operation counter.
    #[inline]
    pub fn counter(&self) -> u64 {
        self.slot().counter()
    }

    /// Accumulate measured payload time for rate metrics.
    pub fn add_duration(&self, seconds: f64) {
        self.slot().add_duration(seconds);
    }

    /// Record a named metric for the end-of-run report.
    pub fn set_metric(&self, index: usize, label: &str, value: f64) {
        self.slot().set_metric(index, label, value);
    }

    /// Metrics recorded so far, in table order.
    pub fn metrics(&self) -> Vec<Metric> {
        self.slot().metrics()
    }

    /// Latch the instance-local fatal error flag; `should_continue`
    /// reports false from here on.
    pub fn fail(&self) {
        self.slot().set_failed();
    }

    /// Whether this instance hit a fatal error.
    pub fn failed(&self) -> bool {
        self.slot().failed()
    }

    /// Forced kills recorded against this instance.
    pub fn forced_kills(&self) -> u64 {
        self.slot().forced_kills()
    }

    /// Run-global continuation check (stop flag and time budget only).
    #[inline]
    pub fn keep_running(&self) -> bool {
        self.control.keep_running()
    }

    /// Full continuation check, including this instance's op budget and
    /// error flag. Payload loops call this once per iteration.
    #[inline]
    pub fn should_continue(&self) -> bool {
        self.control.should_continue(self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::counter::SharedRegion;
    use std::sync::Arc;

    fn instance(max_ops: Option<u64>) -> Instance {
        let shared = Arc::new(SharedRegion::new(1).expect("mmap failed"));
        Instance::new("test", 0, RunControl::new(shared, None, max_ops))
    }

    #[test]
    fn test_counter_accessors() {
        let inst = instance(None);
        assert_eq!(inst.counter(), 0);
        inst.inc_counter();
        inst.inc_counter();
        assert_eq!(inst.counter(), 2);
    }

    #[test]
    fn test_should_continue_honors_op_budget() {
        let inst = instance(Some(2));
        assert!(inst.should_continue());
        inst.inc_counter();
        assert!(inst.should_continue());
        inst.inc_counter();
        assert!(!inst.should_continue());
        // The global flag is untouched by an exhausted op budget
        assert!(inst.keep_running());
    }

    #[test]
    fn test_fail_latches() {
        let inst = instance(None);
        assert!(!inst.failed());
        inst.fail();
        assert!(inst.failed());
        assert!(!inst.should_continue());
    }

    #[test]
    fn test_clones_share_one_slot() {
        let inst = instance(None);
        let other = inst.clone();
        inst.inc_counter();
        other.inc_counter();
        assert_eq!(inst.counter(), 2);
        assert_eq!(other.counter(), 2);
    }
}
