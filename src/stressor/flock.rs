//! File-lock stressor: several processes contending on one flock.

use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Instant;

use nix::unistd::getpid;

use super::Stressor;
use crate::harness::{
    ExitStatus, Instance, Reaper, STOP_SIGNAL, Spawned, WorkerHandle, WorkerRole, spawn_worker,
};

/// Forked lock contenders in addition to the instance supervisor itself.
const FLOCK_WORKERS: usize = 3;

/// Lock modes cycled by every contender.
const LOCK_OPS: [libc::c_int; 4] = [
    libc::LOCK_EX,
    libc::LOCK_EX | libc::LOCK_NB,
    libc::LOCK_SH,
    libc::LOCK_SH | libc::LOCK_NB,
];

pub struct Flock;

impl Stressor for Flock {
    fn name(&self) -> &'static str {
        "flock"
    }

    fn description(&self) -> &'static str {
        "file lock contention across forked processes"
    }

    fn run(&self, instance: &Instance) -> ExitStatus {
        stress_flock(instance)
    }
}

#[derive(Default)]
struct LockTimings {
    lock_duration: f64,
    lock_count: f64,
    unlock_duration: f64,
    unlock_count: f64,
}

impl LockTimings {
    fn save_metrics(&self, instance: &Instance) {
        let rate = if self.lock_count > 0.0 {
            self.lock_duration / self.lock_count
        } else {
            0.0
        };
        instance.set_metric(0, "nanosecs per flock lock call", rate * 1e9);
        let rate = if self.unlock_count > 0.0 {
            self.unlock_duration / self.unlock_count
        } else {
            0.0
        };
        instance.set_metric(1, "nanosecs per flock unlock call", rate * 1e9);
    }
}

fn stress_flock(instance: &Instance) -> ExitStatus {
    let path = lock_file_path(instance);
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(error) => {
            tracing::error!(
                stressor = instance.name(),
                path = %path.display(),
                %error,
                "cannot create lock file"
            );
            return ExitStatus::NoResource;
        }
    };
    let fd = file.as_raw_fd();

    let mut rc = ExitStatus::Success;
    let mut handles: Vec<WorkerHandle> = Vec::with_capacity(FLOCK_WORKERS);
    for _ in 0..FLOCK_WORKERS {
        let child_instance = instance.clone();
        match spawn_worker(instance, WorkerRole::Worker, move || {
            flock_contender(&child_instance, fd);
            ExitStatus::Success
        }) {
            Ok(Spawned::Worker(mut handle)) => {
                handle.mark_running();
                handles.push(handle);
            }
            Ok(Spawned::Cancelled) => break,
            Err(error) => {
                tracing::error!(stressor = instance.name(), %error, "cannot spawn lock contender");
                rc = ExitStatus::Failure;
                break;
            }
        }
    }

    if rc == ExitStatus::Success {
        // The supervisor contends too, and its timings feed the metrics.
        let timings = flock_contender(instance, fd);
        timings.save_metrics(instance);
    }

    Reaper::new().kill_and_reap_many(instance, &mut handles, STOP_SIGNAL, true);

    drop(file);
    let _ = fs::remove_file(&path);

    rc
}

/// Cycle acquire/release pairs across the lock modes until told to stop.
fn flock_contender(instance: &Instance, fd: i32) -> LockTimings {
    let mut timings = LockTimings::default();

    'outer: loop {
        for op in LOCK_OPS {
            if !instance.should_continue() {
                break 'outer;
            }

            let start = Instant::now();
            if unsafe { libc::flock(fd, op) } != 0 {
                // Non-blocking attempts lose races; that is the point.
                continue;
            }
            timings.lock_duration += start.elapsed().as_secs_f64();
            timings.lock_count += 1.0;

            let cont = instance.should_continue();
            if cont {
                instance.inc_counter();
            }

            let start = Instant::now();
            if unsafe { libc::flock(fd, libc::LOCK_UN) } == 0 {
                timings.unlock_duration += start.elapsed().as_secs_f64();
                timings.unlock_count += 1.0;
            }

            if !cont {
                break 'outer;
            }
        }
    }

    timings
}

fn lock_file_path(instance: &Instance) -> PathBuf {
    std::env::temp_dir().join(format!(
        "pummel-flock-{}-{}",
        getpid().as_raw(),
        instance.index()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{RunControl, SharedRegion};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn budgeted_instance(max_ops: u64) -> Instance {
        let shared = Arc::new(SharedRegion::new(1).expect("mmap failed"));
        let control = RunControl::new(shared, Some(Duration::from_secs(5)), Some(max_ops));
        Instance::new("flock", 0, control)
    }

    #[test]
    fn test_contender_counts_lock_cycles() {
        let file = NamedTempFile::new().expect("tempfile failed");
        let instance = budgeted_instance(100);

        let timings = flock_contender(&instance, file.as_file().as_raw_fd());

        assert!(instance.counter() >= 100);
        assert!(timings.lock_count > 0.0);
        assert!(timings.unlock_count > 0.0);
        // Held locks were all released
        assert!(timings.unlock_count <= timings.lock_count);
    }

    #[test]
    fn test_metrics_zero_guard() {
        let shared = Arc::new(SharedRegion::new(1).expect("mmap failed"));
        let instance = Instance::new("flock", 0, RunControl::new(shared, None, None));

        LockTimings::default().save_metrics(&instance);
        let metrics = instance.metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].value, 0.0);
        assert_eq!(metrics[1].value, 0.0);
    }

    #[test]
    fn test_flock_stressor_short_run() {
        let instance = budgeted_instance(200);
        let status = stress_flock(&instance);
        assert_eq!(status, ExitStatus::Success);
        assert!(instance.counter() >= 200);

        let metrics = instance.metrics();
        assert_eq!(metrics.len(), 2);
        assert!(metrics[0].label.contains("lock"));
    }
}
