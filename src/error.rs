//! Error types for pummel.

use nix::errno::Errno;
use thiserror::Error;

/// Main error type for pummel.
#[derive(Error, Debug)]
pub enum PummelError {
    #[error("unknown stressor '{0}'. Run 'pummel list' to see what is available.")]
    UnknownStressor(String),

    #[error("cannot map shared counter region: {0}")]
    SharedRegion(Errno),

    #[error("process creation failed after {attempts} attempts: {errno}")]
    SpawnFailed { errno: Errno, attempts: usize },

    #[error("worker count cannot be zero")]
    NoWorkers,

    #[error("wait on pid {pid} failed: {errno}")]
    WaitFailed { pid: i32, errno: Errno },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system error: {0}")]
    Sys(#[from] Errno),
}

/// Result type alias for pummel operations.
pub type Result<T> = std::result::Result<T, PummelError>;
