//! OOM-avoidance wrapper: keep a workload alive across OOM kills.
//!
//! Memory-hungry payloads run in a disposable worker. When the kernel's
//! out-of-memory killer takes that worker down mid-run, the wrapper
//! respawns the body in a fresh process against the same counter slot, so
//! cumulative progress survives the restart. The worker raises its own
//! OOM score first, making it a better victim than its supervisor.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;

use super::instance::Instance;
use super::spawn::{self, Spawned};
use super::worker::{ExitStatus, WorkerHandle, WorkerOutcome, WorkerRole};
use crate::error::{PummelError, Result};

/// Run `body` in a worker process, restarting it if the worker disappears
/// abnormally while the run should continue.
///
/// Completion, whether success or failure, ends the loop: persistent
/// non-OOM failures are not retried. A clean death by the run's stop
/// signal counts as success.
pub fn run_oomable<F>(instance: &Instance, body: F) -> Result<ExitStatus>
where
    F: Fn() -> ExitStatus,
{
    let mut respawns = 0u32;
    loop {
        let spawned = spawn::spawn_worker(instance, WorkerRole::Worker, || {
            make_oom_preferred();
            body()
        })?;
        let mut handle = match spawned {
            Spawned::Worker(handle) => handle,
            Spawned::Cancelled => return Ok(ExitStatus::Success),
        };
        handle.mark_running();

        match wait_for_worker(&mut handle)? {
            WorkerOutcome::OutOfMemory if instance.keep_running() => {
                respawns += 1;
                tracing::info!(
                    stressor = instance.name(),
                    instance = instance.index(),
                    pid = handle.pid().as_raw(),
                    respawns,
                    "worker killed (likely OOM), respawning"
                );
            }
            WorkerOutcome::OutOfMemory => return Ok(ExitStatus::Success),
            WorkerOutcome::Completed(status) => return Ok(status),
            outcome @ (WorkerOutcome::Crashed(_) | WorkerOutcome::Unknown) => {
                let status = outcome.exit_status(Signal::SIGALRM);
                if status != ExitStatus::Success {
                    tracing::warn!(
                        stressor = instance.name(),
                        instance = instance.index(),
                        pid = handle.pid().as_raw(),
                        ?outcome,
                        "worker died abnormally"
                    );
                }
                return Ok(status);
            }
        }
    }
}

/// Normal (non-forceful) blocking wait, retried across interruptions.
fn wait_for_worker(handle: &mut WorkerHandle) -> Result<WorkerOutcome> {
    loop {
        match waitpid(handle.pid(), None) {
            Ok(status) => {
                handle.mark_reaped();
                return Ok(WorkerOutcome::from_wait_status(status));
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                return Err(PummelError::WaitFailed {
                    pid: handle.pid().as_raw(),
                    errno,
                });
            }
        }
    }
}

/// Make this process the OOM killer's preferred victim. Best effort;
/// raising one's own score needs no privileges.
fn make_oom_preferred() {
    #[cfg(target_os = "linux")]
    {
        let _ = std::fs::write("/proc/self/oom_score_adj", "1000");
    }
}
