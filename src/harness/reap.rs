//! Worker termination and reaping.
//!
//! Targets are intentionally stressed processes: they may be blocked in
//! syscalls, slow to act on signals, or already gone. The reap loop
//! therefore treats an interrupted wait as the normal case, probes the
//! target's liveness with the null signal, re-delivers the stop signal
//! once the run is winding down, and escalates to an unconditional kill
//! after roughly two minutes of consecutive interruptions.
//!
//! Pids 0, 1 and the caller's own pid are protected identities: they are
//! never signaled, and any attempt is logged as a no-op.

use std::time::Duration;

use nix::errno::Errno;
use nix::sched::sched_yield;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{Pid, getpid};

use super::control::RunControl;
use super::instance::Instance;
use super::worker::WorkerHandle;

/// Consecutive interrupted waits before the loop starts sleeping between
/// retries instead of just yielding.
const REAP_BACKOFF_THRESHOLD: usize = 10;

/// Consecutive interrupted waits past which the reaper escalates to a
/// forced kill and gives up waiting.
const REAP_FORCE_KILL_THRESHOLD: usize = 120;

/// Kill a process with SIGKILL, trying to release its memory as soon as
/// possible via `process_mrelease` on Linux.
///
/// The pidfd is acquired before the kill signal is sent; once the target
/// is dead its pid may be recycled and a handle would no longer be
/// obtainable. The error code of the kill call is the result of the whole
/// operation regardless of whether the release call succeeds.
pub fn kill_pid(pid: Pid) -> nix::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
        let ret = signal::kill(pid, Signal::SIGKILL);
        if pidfd >= 0 {
            let pidfd = pidfd as libc::c_int;
            if ret.is_ok() {
                unsafe {
                    libc::syscall(libc::SYS_process_mrelease, pidfd, 0);
                }
            }
            unsafe {
                libc::close(pidfd);
            }
        }
        ret
    }
    #[cfg(not(target_os = "linux"))]
    {
        signal::kill(pid, Signal::SIGKILL)
    }
}

/// The OS-facing side of the reaper, split out so call ordering and
/// escalation can be driven by a recording double in tests.
pub trait ProcessOps {
    /// Deliver a signal; `None` is the null-signal liveness probe.
    fn send_signal(&self, pid: Pid, signal: Option<Signal>) -> nix::Result<()>;
    /// Blocking wait on one pid.
    fn wait(&self, pid: Pid) -> nix::Result<WaitStatus>;
    /// Last-resort unconditional termination.
    fn force_kill(&self, pid: Pid) -> nix::Result<()>;
    fn yield_now(&self);
    fn backoff(&self);
}

/// Real syscalls.
pub struct SysOps;

impl ProcessOps for SysOps {
    fn send_signal(&self, pid: Pid, signal: Option<Signal>) -> nix::Result<()> {
        signal::kill(pid, signal)
    }

    fn wait(&self, pid: Pid) -> nix::Result<WaitStatus> {
        waitpid(pid, None)
    }

    fn force_kill(&self, pid: Pid) -> nix::Result<()> {
        kill_pid(pid)
    }

    fn yield_now(&self) {
        let _ = sched_yield();
    }

    fn backoff(&self) {
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// How a termination request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// The wait call confirmed the exit and returned its status.
    Exited(WaitStatus),
    /// The target no longer exists (liveness probe failed, or the wait
    /// reported nothing left to reap).
    AlreadyGone,
    /// The target ignored cooperative signaling; a forced kill was issued
    /// and the reaper gave up waiting.
    ForceKilled,
    /// The pid is a protected identity; nothing was signaled.
    Refused,
}

/// Delivers stop signals and blocks until the OS confirms the targets'
/// exits.
pub struct Reaper<O: ProcessOps = SysOps> {
    ops: O,
}

impl Reaper<SysOps> {
    pub fn new() -> Self {
        Self { ops: SysOps }
    }
}

impl Default for Reaper<SysOps> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: ProcessOps> Reaper<O> {
    #[cfg(test)]
    fn with_ops(ops: O) -> Self {
        Self { ops }
    }

    /// Send `signal` to the worker and block until its exit is confirmed.
    ///
    /// Protected pids are refused and logged. A handle that was already
    /// reaped returns immediately. With `count_forced`, an escalation to
    /// forced kill is recorded in the instance's diagnostic counter.
    pub fn terminate_and_confirm(
        &self,
        instance: &Instance,
        handle: &mut WorkerHandle,
        signal: Signal,
        count_forced: bool,
    ) -> ReapOutcome {
        let pid = handle.pid();
        let mypid = getpid();

        if pid.as_raw() == 0 || pid.as_raw() == 1 || pid == mypid {
            tracing::warn!(
                stressor = instance.name(),
                pid = pid.as_raw(),
                "attempt to kill protected pid ignored"
            );
        }
        if pid.as_raw() <= 1 || pid == mypid {
            return ReapOutcome::Refused;
        }

        if handle.is_reaped() {
            return ReapOutcome::AlreadyGone;
        }

        let _ = self.ops.send_signal(pid, Some(signal));
        handle.mark_stop_requested();
        self.wait_until_reaped(instance.control(), instance.name(), handle, signal, count_forced)
    }

    /// Signal every eligible pid first, then reap them sequentially in
    /// list order. Delivering all signals up front gets every worker
    /// moving toward exit before the first potentially slow blocking wait,
    /// so teardown costs roughly one reap instead of N kill+wait round
    /// trips.
    pub fn kill_and_reap_many(
        &self,
        instance: &Instance,
        handles: &mut [WorkerHandle],
        signal: Signal,
        count_forced: bool,
    ) {
        let mypid = getpid();

        // Kill first
        for handle in handles.iter_mut() {
            let pid = handle.pid();
            if pid.as_raw() > 1 && pid != mypid && !handle.is_reaped() {
                let _ = self.ops.send_signal(pid, Some(signal));
                handle.mark_stop_requested();
            }
        }
        // Then reap
        for handle in handles.iter_mut() {
            self.terminate_and_confirm(instance, handle, signal, count_forced);
        }
    }

    /// The reap loop: retry the blocking wait across interruptions until
    /// the target's status is resolved one way or another.
    fn wait_until_reaped(
        &self,
        control: &RunControl,
        name: &str,
        handle: &mut WorkerHandle,
        signal: Signal,
        count_forced: bool,
    ) -> ReapOutcome {
        let pid = handle.pid();
        let mut interruptions = 0usize;

        loop {
            match self.ops.wait(pid) {
                Ok(status) => {
                    handle.mark_reaped();
                    tracing::trace!(
                        stressor = name,
                        pid = pid.as_raw(),
                        ?status,
                        "worker reaped"
                    );
                    return ReapOutcome::Exited(status);
                }
                Err(Errno::EINTR) => {
                    // A dead target resolves the wait: probe before
                    // retrying.
                    if self.ops.send_signal(pid, None) == Err(Errno::ESRCH) {
                        handle.mark_reaped();
                        return ReapOutcome::AlreadyGone;
                    }

                    interruptions += 1;
                    if !control.keep_running() {
                        // The first delivery may have been lost while the
                        // target sat in a stressed syscall.
                        let _ = self.ops.send_signal(pid, Some(signal));

                        if interruptions > REAP_FORCE_KILL_THRESHOLD {
                            if count_forced {
                                control.slot(handle.instance()).inc_forced_kills();
                            }
                            tracing::warn!(
                                stressor = name,
                                pid = pid.as_raw(),
                                interruptions,
                                "worker ignored cooperative stop, escalating to forced kill"
                            );
                            let _ = self.ops.force_kill(pid);
                            return ReapOutcome::ForceKilled;
                        }
                    }

                    self.ops.yield_now();
                    if interruptions > REAP_BACKOFF_THRESHOLD {
                        self.ops.backoff();
                    }
                }
                Err(errno) => {
                    // ECHILD and friends: the status was resolved
                    // elsewhere; nothing left to wait for.
                    handle.mark_reaped();
                    tracing::debug!(
                        stressor = name,
                        pid = pid.as_raw(),
                        %errno,
                        "wait resolved without a status"
                    );
                    return ReapOutcome::AlreadyGone;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::counter::SharedRegion;
    use std::cell::RefCell;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Signal(i32, Option<Signal>),
        Wait(i32),
        ForceKill(i32),
    }

    /// Recording double. `gone` pids fail probes with ESRCH and waits
    /// with ECHILD; `wait_script` overrides wait results per pid;
    /// otherwise waits report a clean exit (or EINTR forever with
    /// `eintr_forever`).
    #[derive(Default)]
    struct FakeOps {
        events: RefCell<Vec<Event>>,
        gone: HashSet<i32>,
        eintr_forever: bool,
        wait_script: RefCell<VecDeque<nix::Result<WaitStatus>>>,
    }

    impl FakeOps {
        fn events(&self) -> Vec<Event> {
            self.events.borrow().clone()
        }
    }

    impl ProcessOps for FakeOps {
        fn send_signal(&self, pid: Pid, signal: Option<Signal>) -> nix::Result<()> {
            self.events
                .borrow_mut()
                .push(Event::Signal(pid.as_raw(), signal));
            if self.gone.contains(&pid.as_raw()) {
                Err(Errno::ESRCH)
            } else {
                Ok(())
            }
        }

        fn wait(&self, pid: Pid) -> nix::Result<WaitStatus> {
            self.events.borrow_mut().push(Event::Wait(pid.as_raw()));
            if let Some(result) = self.wait_script.borrow_mut().pop_front() {
                return result;
            }
            if self.gone.contains(&pid.as_raw()) {
                return Err(Errno::ECHILD);
            }
            if self.eintr_forever {
                return Err(Errno::EINTR);
            }
            Ok(WaitStatus::Exited(pid, 0))
        }

        fn force_kill(&self, pid: Pid) -> nix::Result<()> {
            self.events
                .borrow_mut()
                .push(Event::ForceKill(pid.as_raw()));
            Ok(())
        }

        fn yield_now(&self) {}

        fn backoff(&self) {}
    }

    fn test_instance() -> Instance {
        let shared = Arc::new(SharedRegion::new(1).expect("mmap failed"));
        Instance::new("test", 0, RunControl::new(shared, None, None))
    }

    #[test]
    fn test_protected_pids_never_signaled() {
        let instance = test_instance();
        let reaper = Reaper::with_ops(FakeOps::default());

        for raw in [0, 1, getpid().as_raw()] {
            let mut handle = WorkerHandle::adopt(Pid::from_raw(raw), 0);
            let outcome = reaper.terminate_and_confirm(&instance, &mut handle, Signal::SIGTERM, false);
            assert_eq!(outcome, ReapOutcome::Refused);
        }
        assert!(reaper.ops.events().is_empty(), "no OS call may be issued");
    }

    #[test]
    fn test_negative_pids_refused() {
        let instance = test_instance();
        let reaper = Reaper::with_ops(FakeOps::default());
        let mut handle = WorkerHandle::adopt(Pid::from_raw(-5), 0);
        let outcome = reaper.terminate_and_confirm(&instance, &mut handle, Signal::SIGTERM, false);
        assert_eq!(outcome, ReapOutcome::Refused);
        assert!(reaper.ops.events().is_empty());
    }

    #[test]
    fn test_kill_many_signals_all_before_first_reap() {
        let instance = test_instance();
        let reaper = Reaper::with_ops(FakeOps::default());

        let pids = [91001, 91002, 91003];
        let mut handles: Vec<WorkerHandle> = pids
            .iter()
            .map(|&p| WorkerHandle::adopt(Pid::from_raw(p), 0))
            .collect();

        reaper.kill_and_reap_many(&instance, &mut handles, Signal::SIGALRM, false);

        let events = reaper.ops.events();
        let first_wait = events
            .iter()
            .position(|e| matches!(e, Event::Wait(_)))
            .expect("someone must be reaped");
        let kills_before: Vec<i32> = events[..first_wait]
            .iter()
            .filter_map(|e| match e {
                Event::Signal(pid, Some(Signal::SIGALRM)) => Some(*pid),
                _ => None,
            })
            .collect();
        // Every pid got the stop signal before the first blocking wait.
        for pid in pids {
            assert!(kills_before.contains(&pid), "pid {pid} not signaled first");
        }
        // Reaps happen in the original list order.
        let waits: Vec<i32> = events
            .iter()
            .filter_map(|e| match e {
                Event::Wait(pid) => Some(*pid),
                _ => None,
            })
            .collect();
        assert_eq!(waits, pids.to_vec());
        assert!(handles.iter().all(WorkerHandle::is_reaped));
    }

    #[test]
    fn test_kill_many_with_one_already_exited() {
        let instance = test_instance();
        let mut ops = FakeOps::default();
        ops.gone.insert(91002);
        let reaper = Reaper::with_ops(ops);

        let mut handles: Vec<WorkerHandle> = [91001, 91002, 91003]
            .iter()
            .map(|&p| WorkerHandle::adopt(Pid::from_raw(p), 0))
            .collect();

        // Must not error or panic; the dead pid resolves as already gone.
        reaper.kill_and_reap_many(&instance, &mut handles, Signal::SIGALRM, false);

        assert!(handles.iter().all(WorkerHandle::is_reaped));
        let waits: Vec<i32> = reaper
            .ops
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Wait(pid) => Some(*pid),
                _ => None,
            })
            .collect();
        assert_eq!(waits, vec![91001, 91002, 91003]);
    }

    #[test]
    fn test_interrupted_wait_with_dead_target_is_reaped() {
        let instance = test_instance();
        let mut ops = FakeOps::default();
        ops.wait_script.borrow_mut().push_back(Err(Errno::EINTR));
        // The probe after the EINTR hits ESRCH
        ops.gone.insert(91001);
        let reaper = Reaper::with_ops(ops);

        let mut handle = WorkerHandle::adopt(Pid::from_raw(91001), 0);
        let outcome = reaper.terminate_and_confirm(&instance, &mut handle, Signal::SIGALRM, false);
        assert_eq!(outcome, ReapOutcome::AlreadyGone);
        assert!(handle.is_reaped());
    }

    #[test]
    fn test_escalates_to_forced_kill_exactly_once() {
        let instance = test_instance();
        // The run is already stopping: the re-delivery + escalation path
        // is armed.
        instance.control().request_stop();

        let ops = FakeOps {
            eintr_forever: true,
            ..FakeOps::default()
        };
        let reaper = Reaper::with_ops(ops);

        let mut handle = WorkerHandle::adopt(Pid::from_raw(91001), 0);
        let outcome = reaper.terminate_and_confirm(&instance, &mut handle, Signal::SIGALRM, true);
        assert_eq!(outcome, ReapOutcome::ForceKilled);

        let events = reaper.ops.events();
        let force_kills = events
            .iter()
            .filter(|e| matches!(e, Event::ForceKill(_)))
            .count();
        assert_eq!(force_kills, 1, "escalation must fire exactly once");

        let waits = events.iter().filter(|e| matches!(e, Event::Wait(_))).count();
        assert!(waits > REAP_FORCE_KILL_THRESHOLD);

        // The diagnostic counter incremented by exactly 1.
        assert_eq!(instance.forced_kills(), 1);
    }

    #[test]
    fn test_no_escalation_without_count_does_not_touch_counter() {
        let instance = test_instance();
        instance.control().request_stop();

        let ops = FakeOps {
            eintr_forever: true,
            ..FakeOps::default()
        };
        let reaper = Reaper::with_ops(ops);

        let mut handle = WorkerHandle::adopt(Pid::from_raw(91001), 0);
        let outcome = reaper.terminate_and_confirm(&instance, &mut handle, Signal::SIGALRM, false);
        assert_eq!(outcome, ReapOutcome::ForceKilled);
        assert_eq!(instance.forced_kills(), 0);
    }

    #[test]
    fn test_second_terminate_returns_immediately() {
        let instance = test_instance();
        let reaper = Reaper::with_ops(FakeOps::default());

        let mut handle = WorkerHandle::adopt(Pid::from_raw(91001), 0);
        let outcome = reaper.terminate_and_confirm(&instance, &mut handle, Signal::SIGALRM, false);
        assert!(matches!(outcome, ReapOutcome::Exited(_)));

        let events_before = reaper.ops.events().len();
        let outcome = reaper.terminate_and_confirm(&instance, &mut handle, Signal::SIGALRM, false);
        assert_eq!(outcome, ReapOutcome::AlreadyGone);
        // No further signaling or waiting happened.
        assert_eq!(reaper.ops.events().len(), events_before);
    }

    #[test]
    fn test_terminate_and_confirm_real_child() {
        use std::process::Command;

        let child = Command::new("sleep")
            .arg("60")
            .spawn()
            .expect("failed to spawn sleep");
        let pid = Pid::from_raw(child.id() as i32);
        let instance = test_instance();
        let mut handle = WorkerHandle::adopt(pid, 0);

        let reaper = Reaper::new();
        let outcome = reaper.terminate_and_confirm(&instance, &mut handle, Signal::SIGTERM, false);
        assert!(matches!(outcome, ReapOutcome::Exited(_)));
        assert!(handle.is_reaped());

        // A liveness probe on the reaped pid fails with "no such process".
        assert_eq!(signal::kill(pid, None), Err(Errno::ESRCH));

        // Idempotence against the real process table as well.
        let outcome = reaper.terminate_and_confirm(&instance, &mut handle, Signal::SIGTERM, false);
        assert_eq!(outcome, ReapOutcome::AlreadyGone);
    }

    #[test]
    fn test_kill_pid_real_child() {
        use std::process::Command;

        let child = Command::new("sleep")
            .arg("60")
            .spawn()
            .expect("failed to spawn sleep");
        let pid = Pid::from_raw(child.id() as i32);

        kill_pid(pid).expect("kill failed");
        let status = waitpid(pid, None).expect("waitpid failed");
        assert!(matches!(
            status,
            WaitStatus::Signaled(_, Signal::SIGKILL, _)
        ));
    }
}
