//! Memory-locking stressor: pin pages until the kernel says no.
//!
//! Runs under the OOM-avoidance wrapper; locking page after page is
//! exactly the kind of work the OOM killer punishes, and the run should
//! survive that.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::time::Instant;

use nix::errno::Errno;
use nix::libc::c_void;
use nix::sys::mman::{MapFlags, ProtFlags, mlock, mmap_anonymous, munlock, munmap};
use nix::sys::resource::{Resource, getrlimit};

use super::Stressor;
use crate::harness::{ExitStatus, Instance, run_oomable};

/// Upper bound on mappings held per pass.
const MLOCK_MAX_MAPPINGS: usize = 8192;

pub struct Mlock;

impl Stressor for Mlock {
    fn name(&self) -> &'static str {
        "mlock"
    }

    fn description(&self) -> &'static str {
        "lock and unlock pages until memory limits push back"
    }

    fn run(&self, instance: &Instance) -> ExitStatus {
        match run_oomable(instance, || mlock_body(instance)) {
            Ok(status) => status,
            Err(error) => {
                tracing::error!(stressor = instance.name(), %error, "mlock worker failed");
                ExitStatus::Failure
            }
        }
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// How many triple-page mappings one pass attempts. Deliberately
/// optimistic: running into ENOMEM is the stress, not an error.
fn max_mappings(page: usize) -> usize {
    let from_rlimit = match getrlimit(Resource::RLIMIT_MEMLOCK) {
        Ok((_, hard)) => (hard as usize / page.max(1)).max(64),
        Err(_) => MLOCK_MAX_MAPPINGS,
    };
    from_rlimit.min(MLOCK_MAX_MAPPINGS)
}

fn mlock_body(instance: &Instance) -> ExitStatus {
    let page = page_size();
    let max = max_mappings(page);
    let mut lock_duration = 0.0f64;
    let mut lock_count = 0.0f64;
    let mut unlock_duration = 0.0f64;
    let mut unlock_count = 0.0f64;

    // Under memory pressure the respawned worker may already be out of
    // budget before doing any work.
    if !instance.should_continue() {
        return ExitStatus::Success;
    }

    let mut mappings: Vec<(NonNull<c_void>, bool)> = Vec::with_capacity(max);
    let map_len = NonZeroUsize::new(page * 3).expect("page size is nonzero");

    loop {
        for _ in 0..max {
            if !instance.should_continue() {
                break;
            }
            let base = match unsafe {
                mmap_anonymous(
                    None,
                    map_len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                )
            } {
                Ok(base) => base,
                Err(_) => break,
            };

            // Lock the middle page only, leaving unlocked guards on both
            // sides of it.
            let middle = unsafe {
                NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(page).cast::<c_void>())
            };
            let start = Instant::now();
            match unsafe { mlock(middle, page) } {
                Ok(()) => {
                    lock_duration += start.elapsed().as_secs_f64();
                    lock_count += 1.0;
                    instance.inc_counter();
                    mappings.push((base, true));
                }
                Err(Errno::EAGAIN) => {
                    mappings.push((base, false));
                }
                Err(Errno::ENOMEM) | Err(Errno::EPERM) => {
                    // The limit pushed back; unwind this pass.
                    mappings.push((base, false));
                    break;
                }
                Err(errno) => {
                    tracing::error!(stressor = instance.name(), %errno, "mlock failed");
                    instance.fail();
                    mappings.push((base, false));
                    break;
                }
            }
        }

        if mappings.is_empty() {
            if instance.should_continue() {
                // Not even one mapping: nothing lockable here at all.
                return ExitStatus::NoResource;
            }
            break;
        }

        for (base, locked) in mappings.drain(..) {
            if locked {
                let middle = unsafe {
                    NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(page).cast::<c_void>())
                };
                let start = Instant::now();
                if unsafe { munlock(middle, page) }.is_ok() {
                    unlock_duration += start.elapsed().as_secs_f64();
                    unlock_count += 1.0;
                }
            }
            unsafe {
                let _ = munmap(base, page * 3);
            }
        }

        if !instance.should_continue() {
            break;
        }
    }

    let rate = if lock_count > 0.0 {
        lock_duration / lock_count
    } else {
        0.0
    };
    instance.set_metric(0, "nanosecs per mlock call", rate * 1e9);
    let rate = if unlock_count > 0.0 {
        unlock_duration / unlock_count
    } else {
        0.0
    };
    instance.set_metric(1, "nanosecs per munlock call", rate * 1e9);

    if instance.failed() {
        ExitStatus::Failure
    } else {
        ExitStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{RunControl, SharedRegion};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_page_size_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_max_mappings_bounded() {
        let max = max_mappings(page_size());
        assert!(max >= 64);
        assert!(max <= MLOCK_MAX_MAPPINGS);
    }

    #[test]
    fn test_mlock_body_bounded_run() {
        let shared = Arc::new(SharedRegion::new(1).expect("mmap failed"));
        let control = RunControl::new(shared, Some(Duration::from_millis(500)), Some(64));
        let instance = Instance::new("mlock", 0, control);

        let status = mlock_body(&instance);
        // Restricted environments may forbid mlock entirely; either way
        // the body must terminate within its budget without failing.
        assert!(matches!(
            status,
            ExitStatus::Success | ExitStatus::NoResource
        ));
        let metrics = instance.metrics();
        if status == ExitStatus::Success {
            assert_eq!(metrics.len(), 2);
        }
    }

    #[test]
    fn test_mlock_body_respects_stop() {
        let shared = Arc::new(SharedRegion::new(1).expect("mmap failed"));
        let control = RunControl::new(shared, None, None);
        control.request_stop();
        let instance = Instance::new("mlock", 0, control);

        assert_eq!(mlock_body(&instance), ExitStatus::Success);
        assert_eq!(instance.counter(), 0);
    }
}
