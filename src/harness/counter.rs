//! Fork-shared counter and metrics store.
//!
//! A single anonymous `MAP_SHARED` region is created before any worker is
//! forked. It holds the global stop flag plus one slot per stressor
//! instance: the bogo-operation counter, a duration accumulator, the
//! forced-kill diagnostic counter, a fatal-error flag and a small fixed
//! table of named metrics. Counters stay readable by the supervisor after
//! the worker that incremented them has exited.
//!
//! All fields are relaxed atomics. The contract is single-writer-per-slot
//! (only the process currently doing payload work for an instance
//! increments its counter), so no cross-process locking is imposed; the
//! atomics keep reads tear-free and counters monotone even if that
//! assumption is ever violated. Metric labels are published with a
//! release store and read with an acquire load since they are written once
//! at teardown and consumed after the worker is reaped.

use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use nix::libc::c_void;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

use crate::error::{PummelError, Result};

/// Metric slots available per instance.
pub const MAX_METRICS: usize = 8;

/// Maximum metric label length in bytes; longer labels are truncated.
pub const METRIC_LABEL_LEN: usize = 56;

/// A named rate metric read back from a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub label: String,
    pub value: f64,
}

/// One named metric cell inside a slot.
///
/// Zeroed state (fresh mapping) means "unused".
#[repr(C)]
pub struct MetricCell {
    /// f64 bit pattern of the metric value.
    value_bits: AtomicU64,
    /// Label length in bytes; 0 = unused. Written last with release
    /// ordering to publish the label bytes.
    label_len: AtomicU32,
    label: UnsafeCell<[u8; METRIC_LABEL_LEN]>,
}

impl MetricCell {
    fn set(&self, label: &str, value: f64) {
        let bytes = label.as_bytes();
        let len = bytes.len().min(METRIC_LABEL_LEN);
        // Single writer per slot: the worker doing payload work writes the
        // label bytes, then publishes them through the release store below.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.label.get().cast::<u8>(), len);
        }
        self.value_bits.store(value.to_bits(), Ordering::Relaxed);
        self.label_len.store(len as u32, Ordering::Release);
    }

    fn get(&self) -> Option<Metric> {
        let len = self.label_len.load(Ordering::Acquire) as usize;
        if len == 0 {
            return None;
        }
        let mut buf = [0u8; METRIC_LABEL_LEN];
        unsafe {
            std::ptr::copy_nonoverlapping(self.label.get().cast::<u8>(), buf.as_mut_ptr(), len);
        }
        Some(Metric {
            label: String::from_utf8_lossy(&buf[..len]).into_owned(),
            value: f64::from_bits(self.value_bits.load(Ordering::Relaxed)),
        })
    }
}

/// Per-instance counters and metrics, living in the shared region.
#[repr(C)]
pub struct InstanceSlot {
    counter: AtomicU64,
    duration_ns: AtomicU64,
    forced_kills: AtomicU64,
    failed: AtomicBool,
    metrics: [MetricCell; MAX_METRICS],
}

impl InstanceSlot {
    /// Count one bogo-operation.
    #[inline]
    pub fn inc_counter(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the bogo-operation counter.
    #[inline]
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Accumulate measured payload time.
    pub fn add_duration(&self, seconds: f64) {
        let ns = (seconds * 1e9) as u64;
        self.duration_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Accumulated payload time in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.duration_ns.load(Ordering::Relaxed) as f64 / 1e9
    }

    /// Accumulated duration divided by the op count; zero when no ops were
    /// counted.
    pub fn seconds_per_op(&self) -> f64 {
        let ops = self.counter();
        if ops == 0 {
            0.0
        } else {
            self.duration_secs() / ops as f64
        }
    }

    /// Count a forced kill of a worker belonging to this instance.
    pub fn inc_forced_kills(&self) {
        self.forced_kills.fetch_add(1, Ordering::Relaxed);
    }

    /// Forced kills recorded against this instance.
    pub fn forced_kills(&self) -> u64 {
        self.forced_kills.load(Ordering::Relaxed)
    }

    /// Latch the instance-local fatal error flag.
    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    /// Whether the instance hit a fatal error.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Write a named metric, overwriting any previous value in that slot.
    /// Indexes past the table and over-long labels are clamped.
    pub fn set_metric(&self, index: usize, label: &str, value: f64) {
        if index >= MAX_METRICS {
            tracing::debug!(index, label, "metric index out of range, dropped");
            return;
        }
        self.metrics[index].set(label, value);
    }

    /// Read back every populated metric in table order.
    pub fn metrics(&self) -> Vec<Metric> {
        self.metrics.iter().filter_map(MetricCell::get).collect()
    }
}

/// Run-global state at the start of the shared region.
#[repr(C)]
struct SharedHeader {
    /// Monotone stop flag: once set it is never cleared for the remainder
    /// of the run. Relaxed loads are a deliberate relaxation; approximate
    /// cross-process visibility is all the stop protocol needs.
    stop: AtomicBool,
}

/// The shared mapping: one header plus `instances` slots.
///
/// Created by the top-level supervisor before the first fork so every
/// worker inherits the same physical pages.
pub struct SharedRegion {
    base: NonNull<c_void>,
    len: usize,
    instances: usize,
    slots_offset: usize,
}

// The region is plain shared memory addressed through atomics; the raw
// pointer is valid for the lifetime of the mapping.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map a zeroed shared region sized for `instances` slots.
    pub fn new(instances: usize) -> Result<Self> {
        let header = Layout::new::<SharedHeader>();
        let slots = Layout::array::<InstanceSlot>(instances.max(1))
            .expect("slot layout overflow");
        let (layout, slots_offset) = header.extend(slots).expect("region layout overflow");

        let len = NonZeroUsize::new(layout.size()).expect("region cannot be empty");
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(PummelError::SharedRegion)?;

        Ok(Self {
            base,
            len: len.get(),
            instances: instances.max(1),
            slots_offset,
        })
    }

    fn header(&self) -> &SharedHeader {
        // Anonymous mappings are zero-filled, which is a valid SharedHeader.
        unsafe { &*self.base.as_ptr().cast::<SharedHeader>() }
    }

    /// Access one instance's slot. Panics on an out-of-range index; slot
    /// indexes are assigned by the runner and never exceed the worker count.
    pub fn slot(&self, index: usize) -> &InstanceSlot {
        assert!(index < self.instances, "instance index out of range");
        unsafe {
            let slots = self
                .base
                .as_ptr()
                .cast::<u8>()
                .add(self.slots_offset)
                .cast::<InstanceSlot>();
            &*slots.add(index)
        }
    }

    /// Whether a stop has been requested for the whole run.
    pub fn stop_requested(&self) -> bool {
        self.header().stop.load(Ordering::Relaxed)
    }

    /// Latch the run-global stop flag. Monotone: never cleared.
    pub fn request_stop(&self) {
        self.header().stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // Each process unmaps its own view; the pages persist while any
        // process still maps them.
        unsafe {
            let _ = munmap(self.base, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_monotone() {
        let region = SharedRegion::new(2).expect("mmap failed");
        let slot = region.slot(0);

        let mut last = slot.counter();
        assert_eq!(last, 0);
        for _ in 0..1000 {
            slot.inc_counter();
            let now = slot.counter();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(slot.counter(), 1000);
        // The other slot is untouched
        assert_eq!(region.slot(1).counter(), 0);
    }

    #[test]
    fn test_stop_flag_monotone() {
        let region = SharedRegion::new(1).expect("mmap failed");
        assert!(!region.stop_requested());
        region.request_stop();
        assert!(region.stop_requested());
        region.request_stop();
        assert!(region.stop_requested());
    }

    #[test]
    fn test_metrics_roundtrip() {
        let region = SharedRegion::new(1).expect("mmap failed");
        let slot = region.slot(0);

        assert!(slot.metrics().is_empty());
        slot.set_metric(0, "nanosecs per lock call", 125.5);
        slot.set_metric(1, "MB per sec write rate", 9000.25);

        let metrics = slot.metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].label, "nanosecs per lock call");
        assert_eq!(metrics[0].value, 125.5);
        assert_eq!(metrics[1].label, "MB per sec write rate");
        assert_eq!(metrics[1].value, 9000.25);
    }

    #[test]
    fn test_metric_label_truncated() {
        let region = SharedRegion::new(1).expect("mmap failed");
        let slot = region.slot(0);

        let long = "x".repeat(METRIC_LABEL_LEN + 40);
        slot.set_metric(0, &long, 1.0);

        let metrics = slot.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].label.len(), METRIC_LABEL_LEN);
    }

    #[test]
    fn test_metric_index_out_of_range_dropped() {
        let region = SharedRegion::new(1).expect("mmap failed");
        let slot = region.slot(0);
        slot.set_metric(MAX_METRICS, "dropped", 1.0);
        assert!(slot.metrics().is_empty());
    }

    #[test]
    fn test_seconds_per_op_zero_guard() {
        let region = SharedRegion::new(1).expect("mmap failed");
        let slot = region.slot(0);

        assert_eq!(slot.seconds_per_op(), 0.0);

        slot.add_duration(2.0);
        assert_eq!(slot.seconds_per_op(), 0.0); // still no ops counted

        slot.inc_counter();
        slot.inc_counter();
        let per_op = slot.seconds_per_op();
        assert!((per_op - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_forced_kills_and_failed_flag() {
        let region = SharedRegion::new(1).expect("mmap failed");
        let slot = region.slot(0);

        assert_eq!(slot.forced_kills(), 0);
        slot.inc_forced_kills();
        assert_eq!(slot.forced_kills(), 1);

        assert!(!slot.failed());
        slot.set_failed();
        assert!(slot.failed());
    }

    #[test]
    fn test_counter_visible_across_fork() {
        use nix::sys::wait::{WaitStatus, waitpid};
        use nix::unistd::{ForkResult, fork};

        let region = SharedRegion::new(1).expect("mmap failed");
        let slot = region.slot(0);

        match unsafe { fork() }.expect("fork failed") {
            ForkResult::Child => {
                for _ in 0..5 {
                    slot.inc_counter();
                }
                // _exit: no cleanup in the child, the parent owns the region
                unsafe { libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).expect("waitpid failed");
                assert!(matches!(status, WaitStatus::Exited(_, 0)));
                assert_eq!(slot.counter(), 5);
            }
        }
    }
}
