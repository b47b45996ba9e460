//! Pipe I/O stressor: a writer/reader process pair hammering one pipe.

use std::time::Instant;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::os::fd::IntoRawFd;

use super::Stressor;
use crate::harness::{ExitStatus, Instance, Reaper, Spawned, WorkerRole, spawn_worker};

/// Bytes per pipe write.
const PIPE_DATA_SIZE: usize = 512;

pub struct Pipe;

impl Stressor for Pipe {
    fn name(&self) -> &'static str {
        "pipe"
    }

    fn description(&self) -> &'static str {
        "heavy pipe I/O between a writer and a forked reader process"
    }

    fn run(&self, instance: &Instance) -> ExitStatus {
        stress_pipe(instance)
    }
}

fn stress_pipe(instance: &Instance) -> ExitStatus {
    let mut buf = vec![0u8; PIPE_DATA_SIZE];
    fill_pattern(&mut buf);

    let (read_fd, write_fd) = match create_pipe() {
        Ok(fds) => fds,
        Err(errno) => {
            tracing::error!(stressor = instance.name(), %errno, "pipe creation failed");
            return ExitStatus::Failure;
        }
    };

    // The reader gets its own buffer copy; allocation happens before the
    // fork.
    let mut reader_buf = buf.clone();
    let reader_instance = instance.clone();
    let spawned = spawn_worker(instance, WorkerRole::Worker, move || {
        // Reader keeps only the read end.
        unsafe { libc::close(write_fd) };
        reader_loop(&reader_instance, read_fd, &mut reader_buf)
    });

    let mut handle = match spawned {
        Ok(Spawned::Worker(handle)) => handle,
        Ok(Spawned::Cancelled) => {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return ExitStatus::Success;
        }
        Err(error) => {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            tracing::error!(stressor = instance.name(), %error, "cannot spawn pipe reader");
            return ExitStatus::Failure;
        }
    };
    handle.mark_running();

    // Writer keeps only the write end.
    unsafe { libc::close(read_fd) };

    let mut rc = ExitStatus::Success;
    let mut bytes = 0.0f64;
    let mut sequence: u32 = 0;
    let start = Instant::now();

    while instance.should_continue() {
        buf[..4].copy_from_slice(&sequence.to_ne_bytes());
        sequence = sequence.wrapping_add(1);

        let n = unsafe { libc::write(write_fd, buf.as_ptr().cast(), PIPE_DATA_SIZE) };
        if n <= 0 {
            match Errno::last() {
                Errno::EAGAIN | Errno::EINTR => continue,
                Errno::EPIPE => break,
                errno => {
                    tracing::error!(stressor = instance.name(), %errno, "pipe write failed");
                    instance.fail();
                    rc = ExitStatus::Failure;
                    break;
                }
            }
        }
        bytes += n as f64;
        instance.inc_counter();
    }

    let duration = start.elapsed().as_secs_f64();
    instance.add_duration(duration);
    let rate = if duration > 0.0 {
        (bytes / duration) / (1024.0 * 1024.0)
    } else {
        0.0
    };
    instance.set_metric(0, "MB per sec pipe write rate", rate);

    unsafe { libc::close(write_fd) };
    Reaper::new().terminate_and_confirm(instance, &mut handle, Signal::SIGPIPE, false);

    rc
}

/// Reader side: drain the pipe until stopped or the writer goes away.
fn reader_loop(instance: &Instance, fd: i32, buf: &mut [u8]) -> ExitStatus {
    while instance.keep_running() {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            if n == 0 {
                break; // writer closed its end
            }
            match Errno::last() {
                Errno::EAGAIN | Errno::EINTR => continue,
                Errno::EPIPE => break,
                errno => {
                    tracing::error!(stressor = instance.name(), %errno, "pipe read failed");
                    instance.fail();
                    unsafe { libc::close(fd) };
                    return ExitStatus::Failure;
                }
            }
        }
    }
    unsafe { libc::close(fd) };
    ExitStatus::Success
}

/// Create the pipe, preferring packet mode (`O_DIRECT`) where the kernel
/// supports it, exactly because that path is less travelled.
fn create_pipe() -> Result<(i32, i32), Errno> {
    #[cfg(target_os = "linux")]
    {
        use nix::fcntl::OFlag;
        if let Ok((read_fd, write_fd)) = nix::unistd::pipe2(OFlag::O_DIRECT) {
            return Ok((read_fd.into_raw_fd(), write_fd.into_raw_fd()));
        }
    }
    let (read_fd, write_fd) = nix::unistd::pipe()?;
    Ok((read_fd.into_raw_fd(), write_fd.into_raw_fd()))
}

/// Deterministic non-uniform fill so writes aren't all-zero pages.
fn fill_pattern(buf: &mut [u8]) {
    let mut state: u32 = 0x9e37_79b9;
    for byte in buf.iter_mut() {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        *byte = (state >> 24) as u8;
    }
}
