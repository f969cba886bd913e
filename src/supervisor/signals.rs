//! Signal handling
//!
//! Signals are never handled asynchronously: the watched set is blocked
//! process-wide before any other thread spawns, and one dedicated thread
//! turns synchronous `sigwait` deliveries into [`ControlFlags`] updates.
//! The flags are the only state shared between signal context and the
//! control loop.

use std::io;
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::sys::pthread::pthread_kill;
use nix::sys::signal::{SigSet, Signal};
use tracing::{info, warn};

use crate::error::Result;

/// Control flags written by the signal watcher and consumed by the
/// supervisor's control loop.
///
/// The recording counters coalesce: rapid repeated signals amount to a
/// single action per control-loop iteration.
#[derive(Debug, Default)]
pub struct ControlFlags {
    exit: AtomicBool,
    restart: AtomicBool,
    start_record: AtomicU32,
    stop_record: AtomicU32,
}

impl ControlFlags {
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::SeqCst);
    }

    /// Consume a pending restart request
    pub fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::SeqCst)
    }

    pub fn signal_start_record(&self) {
        self.start_record.fetch_add(1, Ordering::SeqCst);
    }

    /// Consume pending start-recording signals, returning how many arrived
    pub fn take_start_record(&self) -> u32 {
        self.start_record.swap(0, Ordering::SeqCst)
    }

    pub fn signal_stop_record(&self) {
        self.stop_record.fetch_add(1, Ordering::SeqCst);
    }

    pub fn take_stop_record(&self) -> u32 {
        self.stop_record.swap(0, Ordering::SeqCst)
    }
}

fn watched_signals() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGHUP);
    mask.add(Signal::SIGUSR1);
    mask.add(Signal::SIGUSR2);
    mask
}

/// Dedicated signal-wait thread
pub struct SignalWatcher {
    handle: JoinHandle<()>,
    flags: Arc<ControlFlags>,
}

impl SignalWatcher {
    /// Block the watched signal set on the calling thread and start the
    /// watcher. Must run before any other thread spawns so the mask is
    /// inherited everywhere.
    pub fn spawn(flags: Arc<ControlFlags>) -> Result<Self> {
        let mask = watched_signals();
        mask.thread_block().map_err(io::Error::from)?;

        let thread_flags = flags.clone();
        let handle = thread::Builder::new()
            .name("signal-watcher".into())
            .spawn(move || watch_loop(mask, thread_flags))?;
        Ok(Self { handle, flags })
    }

    /// Unwind the watcher deterministically: request exit, force a TERM
    /// delivery to the thread, and join it.
    pub fn shutdown(self) {
        self.flags.request_exit();
        if let Err(e) = pthread_kill(self.handle.as_pthread_t(), Signal::SIGTERM) {
            warn!("Failed to signal watcher thread: {e}");
        }
        let _ = self.handle.join();
    }
}

fn watch_loop(mask: SigSet, flags: Arc<ControlFlags>) {
    loop {
        let sig = match mask.wait() {
            Ok(sig) => sig,
            Err(e) => {
                warn!("Signal watcher: sigwait failed: {e}");
                continue;
            }
        };

        match sig {
            Signal::SIGINT => {
                info!("SIGINT received; shutting down");
                flags.request_exit();
            }
            Signal::SIGTERM => {
                info!("SIGTERM received; shutting down");
                flags.request_exit();
            }
            Signal::SIGHUP => {
                info!("SIGHUP received; scheduling pipeline restart");
                flags.request_restart();
            }
            Signal::SIGUSR1 => {
                info!("SIGUSR1 received; enabling recording");
                flags.signal_start_record();
            }
            Signal::SIGUSR2 => {
                info!("SIGUSR2 received; disabling recording");
                flags.signal_stop_record();
            }
            other => warn!("Signal watcher: unhandled signal {other:?}"),
        }

        // TERM while exit is already pending is the unwind handshake
        if sig == Signal::SIGTERM && flags.exit_requested() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_counters_coalesce() {
        let flags = ControlFlags::default();
        flags.signal_start_record();
        flags.signal_start_record();
        flags.signal_start_record();
        assert_eq!(flags.take_start_record(), 3);
        assert_eq!(flags.take_start_record(), 0);

        flags.signal_stop_record();
        assert_eq!(flags.take_stop_record(), 1);
        assert_eq!(flags.take_stop_record(), 0);
    }

    #[test]
    fn restart_flag_is_consumed_once() {
        let flags = ControlFlags::default();
        assert!(!flags.take_restart());
        flags.request_restart();
        assert!(flags.take_restart());
        assert!(!flags.take_restart());
    }

    #[test]
    fn exit_is_sticky() {
        let flags = ControlFlags::default();
        assert!(!flags.exit_requested());
        flags.request_exit();
        assert!(flags.exit_requested());
        assert!(flags.exit_requested());
    }

    #[test]
    fn watched_set_covers_the_contract() {
        let mask = watched_signals();
        for sig in [
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGHUP,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
        ] {
            assert!(mask.contains(sig));
        }
        assert!(!mask.contains(Signal::SIGALRM));
    }
}
