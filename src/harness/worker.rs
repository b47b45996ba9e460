//! Worker process handles and termination analysis.

#![allow(dead_code)] // Some accessors are for monitoring/diagnostics

use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

/// Exit-status taxonomy surfaced to the caller and across the process
/// boundary as an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The work body ran to completion.
    Success,
    /// The work body hit a fatal error.
    Failure,
    /// Setup or allocation could not proceed.
    NoResource,
    /// The platform lacks a required facility.
    NotImplemented,
}

impl ExitStatus {
    /// Process exit code for this status.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::NoResource => 3,
            Self::NotImplemented => 4,
        }
    }

    /// Recover a status from a worker's exit code. Unknown codes are
    /// failures.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            3 => Self::NoResource,
            4 => Self::NotImplemented,
            _ => Self::Failure,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::NoResource => "no-resource",
            Self::NotImplemented => "not-implemented",
        }
    }

    fn severity(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::NotImplemented => 1,
            Self::NoResource => 2,
            Self::Failure => 3,
        }
    }

    /// Merge two statuses, keeping the more severe one.
    pub fn merge(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a process acts as a per-instance supervisor or as a payload
/// worker under one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Supervisor,
    Worker,
}

/// Lifecycle of a worker process. Transitions only move forward, and
/// `Reaped` is entered exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Spawned,
    Running,
    StopRequested,
    Reaped,
}

/// Handle on one spawned worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Pid,
    role: WorkerRole,
    instance: u32,
    spawned_at: Instant,
    state: WorkerState,
}

impl WorkerHandle {
    /// Wrap a freshly forked child.
    pub fn new(pid: Pid, role: WorkerRole, instance: u32) -> Self {
        Self {
            pid,
            role,
            instance,
            spawned_at: Instant::now(),
            state: WorkerState::Spawned,
        }
    }

    /// Wrap a process that was not spawned through the harness (tests,
    /// externally created children).
    pub fn adopt(pid: Pid, instance: u32) -> Self {
        Self::new(pid, WorkerRole::Worker, instance)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// Index of the counter slot this worker feeds.
    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub fn is_reaped(&self) -> bool {
        self.state == WorkerState::Reaped
    }

    pub fn mark_running(&mut self) {
        self.advance(WorkerState::Running);
    }

    pub fn mark_stop_requested(&mut self) {
        self.advance(WorkerState::StopRequested);
    }

    /// Record that the OS confirmed this worker's exit. Repeat calls are
    /// no-ops, preserving the single-Reaped-transition invariant.
    pub fn mark_reaped(&mut self) {
        self.advance(WorkerState::Reaped);
    }

    fn advance(&mut self, next: WorkerState) {
        if next <= self.state {
            tracing::debug!(
                pid = self.pid.as_raw(),
                from = ?self.state,
                to = ?next,
                "ignoring backward lifecycle transition"
            );
            return;
        }
        self.state = next;
    }

    /// Non-blocking reap attempt. Returns the wait status if the worker
    /// exited, `None` if it is still running or was already reaped.
    pub fn try_wait(&mut self) -> Option<WaitStatus> {
        if self.is_reaped() {
            return None;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(status) => {
                self.mark_reaped();
                Some(status)
            }
            Err(_) => {
                // ECHILD and friends: nothing left to reap.
                self.mark_reaped();
                None
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // No kill-on-drop: the handle may wrap an adopted pid, and the
        // runner always reaps explicitly. Leaks are only logged.
        if !self.is_reaped() {
            tracing::debug!(
                pid = self.pid.as_raw(),
                state = ?self.state,
                "worker handle dropped before reap"
            );
        }
    }
}

/// How a worker left the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Voluntary exit, carrying the decoded exit status.
    Completed(ExitStatus),
    /// SIGKILL: on a loaded box this is almost always the kernel's
    /// out-of-memory killer.
    OutOfMemory,
    /// Killed by some other signal.
    Crashed(Signal),
    /// Status could not be interpreted.
    Unknown,
}

impl WorkerOutcome {
    /// Classify a wait status.
    pub fn from_wait_status(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Completed(ExitStatus::from_code(code)),
            WaitStatus::Signaled(_, Signal::SIGKILL, _) => Self::OutOfMemory,
            WaitStatus::Signaled(_, signal, _) => Self::Crashed(signal),
            _ => Self::Unknown,
        }
    }

    /// Collapse the outcome into an exit status. Death by the run's own
    /// stop signal is a clean, cooperative exit.
    pub fn exit_status(self, stop_signal: Signal) -> ExitStatus {
        match self {
            Self::Completed(status) => status,
            Self::Crashed(signal) if signal == stop_signal => ExitStatus::Success,
            Self::OutOfMemory | Self::Crashed(_) | Self::Unknown => ExitStatus::Failure,
        }
    }
}
