//! Single-instance guard
//!
//! A pid file at a well-known path enforces one running instance per host.
//! The file is created exclusively; on conflict the recorded pid is probed
//! for liveness, and only a verifiably dead owner lets the stale file be
//! reclaimed (once). The file is removed when the guard drops at normal
//! process exit.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::warn;

use crate::error::{AppError, Result};

/// Well-known pid file path
pub const DEFAULT_PID_PATH: &str = "/tmp/vidlink.pid";

pub struct InstanceGuard {
    path: PathBuf,
}

impl InstanceGuard {
    /// Claim the pid file, refusing when another live instance holds it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut retried = false;

        loop {
            if try_create_pid_file(&path)? {
                return Ok(Self { path });
            }

            if let Some(pid) = read_recorded_pid(&path) {
                if process_alive(pid) {
                    return Err(AppError::AlreadyRunning(format!(
                        "pid {pid} holds {}",
                        path.display()
                    )));
                }
            }

            if retried {
                return Err(AppError::AlreadyRunning(format!(
                    "could not claim {}",
                    path.display()
                )));
            }

            warn!("Removing stale pid file {}", path.display());
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
            retried = true;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove {}: {e}", self.path.display());
            }
        }
    }
}

/// Exclusive create; `Ok(false)` when the file already exists.
fn try_create_pid_file(path: &Path) -> Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = writeln!(file, "{}", std::process::id()) {
        let _ = fs::remove_file(path);
        return Err(e.into());
    }
    Ok(true)
}

fn read_recorded_pid(path: &Path) -> Option<i32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

/// Zero-signal liveness probe. A permission error counts as alive: we
/// cannot rule out a running instance we are not allowed to signal.
fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
