//! Worker process creation.
//!
//! Workers are forked, not spawned as threads: address-space isolation and
//! independent crash/OOM semantics are load-bearing for a stress harness.
//! Fork failures that look like transient resource exhaustion (the kernel
//! briefly out of process slots or memory, which is exactly the state this
//! program tries to provoke) are retried in a bounded loop; anything else
//! is fatal and reported with the OS error code.

use nix::errno::Errno;
use nix::sched::sched_yield;
use nix::unistd::{self, ForkResult};

use super::instance::Instance;
use super::worker::{ExitStatus, WorkerHandle, WorkerRole};
use crate::error::{PummelError, Result};

/// Upper bound on transient-failure retries for one spawn attempt.
const SPAWN_RETRY_LIMIT: usize = 128;

/// Result of a spawn attempt.
#[derive(Debug)]
pub enum Spawned {
    /// A worker was created; the handle is used by the reaper.
    Worker(WorkerHandle),
    /// The run stopped while retrying; no worker was created and no error
    /// occurred.
    Cancelled,
}

/// Fork a worker that runs `body` and exits with its status code.
///
/// In the child, a parent-death safety net is installed before the body
/// runs: if the supervising process disappears, the kernel delivers
/// SIGALRM and the orphan terminates instead of stressing the machine
/// unbounded.
pub fn spawn_worker<F>(instance: &Instance, role: WorkerRole, body: F) -> Result<Spawned>
where
    F: FnOnce() -> ExitStatus,
{
    spawn_with(instance, role, body, || unsafe { unistd::fork() })
}

/// Spawn through an injectable process-creation primitive. The retry
/// policy is what is under test here; production use always passes
/// `fork`.
fn spawn_with<F, P>(instance: &Instance, role: WorkerRole, body: F, mut primitive: P) -> Result<Spawned>
where
    F: FnOnce() -> ExitStatus,
    P: FnMut() -> nix::Result<ForkResult>,
{
    let mut attempts = 0usize;
    loop {
        match primitive() {
            Ok(ForkResult::Child) => {
                parent_died_alarm();
                let status = body();
                // _exit: the child must not run the parent's exit handlers
                unsafe { libc::_exit(status.code()) };
            }
            Ok(ForkResult::Parent { child }) => {
                tracing::debug!(
                    stressor = instance.name(),
                    instance = instance.index(),
                    pid = child.as_raw(),
                    retries = attempts,
                    "spawned worker"
                );
                return Ok(Spawned::Worker(WorkerHandle::new(
                    child,
                    role,
                    instance.index(),
                )));
            }
            Err(errno) if is_transient(errno) => {
                attempts += 1;
                if !instance.keep_running() {
                    tracing::debug!(
                        stressor = instance.name(),
                        instance = instance.index(),
                        "run stopped during spawn retries, aborting spawn"
                    );
                    return Ok(Spawned::Cancelled);
                }
                if attempts >= SPAWN_RETRY_LIMIT {
                    return Err(PummelError::SpawnFailed { errno, attempts });
                }
                let _ = sched_yield();
            }
            Err(errno) => {
                return Err(PummelError::SpawnFailed { errno, attempts });
            }
        }
    }
}

/// Transient resource exhaustion worth retrying. Everything else is a
/// real fault.
fn is_transient(errno: Errno) -> bool {
    matches!(errno, Errno::EAGAIN | Errno::ENOMEM)
}

/// Child-side safety net: self-terminate when the parent disappears.
pub fn parent_died_alarm() {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::prctl;
        use nix::sys::signal::Signal;
        let _ = prctl::set_pdeathsig(Signal::SIGALRM);
    }
}
