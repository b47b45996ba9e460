//! The outer run loop: spawn instances, supervise, tear down, collect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

use super::control::{self, RunControl};
use super::counter::{Metric, SharedRegion};
use super::instance::Instance;
use super::reap::Reaper;
use super::spawn::{self, Spawned};
use super::worker::{ExitStatus, WorkerHandle, WorkerOutcome, WorkerRole};
use crate::error::{PummelError, Result};
use crate::stressor::Stressor;

/// The cooperative stop signal delivered to instance processes at
/// teardown. Its default action terminates workers stuck in payload
/// syscalls; cooperative workers exit their loops before it ever matters.
pub const STOP_SIGNAL: Signal = Signal::SIGALRM;

/// Supervision poll interval.
const SUPERVISE_TICK: Duration = Duration::from_millis(50);

/// Budgets and sizing for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Instances to spawn.
    pub workers: u32,
    /// Wall-clock budget; `None` runs until the op budget or an interrupt.
    pub timeout: Option<Duration>,
    /// Per-instance bogo-op budget; `None` is unlimited.
    pub max_ops: Option<u64>,
}

/// What one instance produced.
#[derive(Debug)]
pub struct InstanceResult {
    pub instance: u32,
    pub bogo_ops: u64,
    /// Accumulated payload duration over ops; zero when nothing was
    /// counted.
    pub secs_per_op: f64,
    pub forced_kills: u64,
    pub status: ExitStatus,
    pub metrics: Vec<Metric>,
}

/// Everything the run produced, for reporting.
#[derive(Debug)]
pub struct RunResults {
    pub stressor: &'static str,
    pub workers: u32,
    pub wall: Duration,
    pub status: ExitStatus,
    pub instances: Vec<InstanceResult>,
}

/// Run `config.workers` instances of a stressor to completion.
///
/// Each instance is a forked supervisor process executing the stressor
/// body; the body may fork further payload workers of its own. This
/// process polls for voluntary exits, latches external interrupts into
/// the shared stop flag, and finally tears down stragglers with
/// [`STOP_SIGNAL`] using the kill-all-then-reap-all sequence.
pub fn run(stressor: &'static dyn Stressor, config: &RunConfig) -> Result<RunResults> {
    if config.workers == 0 {
        return Err(PummelError::NoWorkers);
    }

    let shared = Arc::new(SharedRegion::new(config.workers as usize)?);
    let ctl = RunControl::new(shared, config.timeout, config.max_ops);
    control::install_interrupt_handlers()?;

    tracing::info!(
        stressor = stressor.name(),
        workers = config.workers,
        timeout_secs = config.timeout.map(|t| t.as_secs()),
        max_ops = config.max_ops,
        "starting run"
    );
    let start = Instant::now();

    let mut handles: Vec<WorkerHandle> = Vec::with_capacity(config.workers as usize);
    let mut statuses: Vec<Option<ExitStatus>> = vec![None; config.workers as usize];
    let mut spawn_error = None;

    for index in 0..config.workers {
        let instance = Instance::new(stressor.name(), index, ctl.clone());
        let body_instance = instance.clone();
        match spawn::spawn_worker(&instance, WorkerRole::Supervisor, move || {
            stressor.run(&body_instance)
        }) {
            Ok(Spawned::Worker(mut handle)) => {
                handle.mark_running();
                handles.push(handle);
            }
            Ok(Spawned::Cancelled) => break,
            Err(error) => {
                spawn_error = Some(error);
                break;
            }
        }
    }

    if spawn_error.is_none() {
        supervise(&ctl, &mut handles, &mut statuses);
    }

    // Teardown: stop everything that is still up, signal-all then reap-all.
    ctl.request_stop();
    let reaper = Reaper::new();
    let teardown_instance = Instance::new(stressor.name(), 0, ctl.clone());
    reaper.kill_and_reap_many(&teardown_instance, &mut handles, STOP_SIGNAL, true);

    if let Some(error) = spawn_error {
        return Err(error);
    }

    let wall = start.elapsed();
    let mut results = Vec::with_capacity(config.workers as usize);
    let mut merged = ExitStatus::Success;
    for index in 0..config.workers {
        let slot = ctl.slot(index);
        let mut status = statuses[index as usize].unwrap_or(ExitStatus::Success);
        if slot.failed() {
            status = status.merge(ExitStatus::Failure);
        }
        merged = merged.merge(status);
        results.push(InstanceResult {
            instance: index,
            bogo_ops: slot.counter(),
            secs_per_op: slot.seconds_per_op(),
            forced_kills: slot.forced_kills(),
            status,
            metrics: slot.metrics(),
        });
    }

    tracing::info!(
        stressor = stressor.name(),
        wall_secs = format!("{:.2}", wall.as_secs_f64()),
        total_bogo_ops = results.iter().map(|r| r.bogo_ops).sum::<u64>(),
        status = merged.as_str(),
        "run complete"
    );

    Ok(RunResults {
        stressor: stressor.name(),
        workers: config.workers,
        wall,
        status: merged,
        instances: results,
    })
}

/// Poll until the budget runs out, an interrupt arrives, or every
/// instance exits on its own.
fn supervise(
    ctl: &RunControl,
    handles: &mut [WorkerHandle],
    statuses: &mut [Option<ExitStatus>],
) {
    loop {
        if control::interrupt_pending() {
            tracing::info!("interrupt received, stopping run");
            ctl.request_stop();
        }

        let mut live = 0usize;
        for handle in handles.iter_mut() {
            if handle.is_reaped() {
                continue;
            }
            match handle.try_wait() {
                Some(status) => {
                    let exit = WorkerOutcome::from_wait_status(status).exit_status(STOP_SIGNAL);
                    tracing::debug!(
                        pid = handle.pid().as_raw(),
                        instance = handle.instance(),
                        status = exit.as_str(),
                        "instance exited"
                    );
                    statuses[handle.instance() as usize] = Some(exit);
                }
                None if handle.is_reaped() => {}
                None => live += 1,
            }
        }

        if live == 0 || !ctl.keep_running() {
            return;
        }
        std::thread::sleep(SUPERVISE_TICK);
    }
}
