//! Process supervision
//!
//! The supervisor owns the control loop that turns signal-derived flags
//! into pipeline commands, watches for unplanned pipeline death, and
//! performs bounded-time shutdown. Every blocking wait on the shutdown
//! path has a bound; the 5 s outer deadline with forced process exit is
//! the single last-resort escape hatch.

mod instance;
mod signals;

pub use instance::{InstanceGuard, DEFAULT_PID_PATH};
pub use signals::{ControlFlags, SignalWatcher};

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::display::DisplayTarget;
use crate::pipeline::{Pipeline, PipelineState};

/// Control loop cadence
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Advisory wait passed to pipeline stops
const STOP_WAIT: Duration = Duration::from_millis(700);
/// Hard outer deadline for the shutdown worker
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
/// Process status when teardown exceeds the deadline
const SHUTDOWN_TIMEOUT_STATUS: i32 = 128;

pub struct Supervisor {
    pipeline: Arc<Pipeline>,
    flags: Arc<ControlFlags>,
    target: DisplayTarget,
    drm_fd: RawFd,
}

impl Supervisor {
    pub fn new(
        pipeline: Arc<Pipeline>,
        flags: Arc<ControlFlags>,
        target: DisplayTarget,
        drm_fd: RawFd,
    ) -> Self {
        Self {
            pipeline,
            flags,
            target,
            drm_fd,
        }
    }

    /// Run the control loop until exit is requested or the pipeline stops
    /// on its own. Recording toggles are coalesced to one action per
    /// iteration; a restart failure or unplanned stop requests exit.
    pub fn run(&self, cfg: &mut AppConfig) {
        loop {
            thread::sleep(POLL_INTERVAL);

            if self.flags.exit_requested() {
                info!("Exit requested; preparing to stop pipeline");
                break;
            }

            if self.flags.take_start_record() > 0 {
                if !cfg.record.enable {
                    cfg.record.enable = true;
                    info!("Enabling recording");
                } else {
                    info!("Recording already enabled");
                }
                if self.pipeline.is_running() {
                    if let Err(e) = self.pipeline.enable_recording(&cfg.record) {
                        warn!("Failed to enable recording on running pipeline: {e}");
                    }
                }
            }

            if self.flags.take_stop_record() > 0 {
                if cfg.record.enable {
                    cfg.record.enable = false;
                    info!("Disabling recording");
                } else {
                    info!("Recording already disabled");
                }
                if self.pipeline.is_running() {
                    self.pipeline.disable_recording();
                }
            }

            if self.flags.take_restart() {
                info!("Restarting pipeline");
                self.pipeline.stop(STOP_WAIT);
                if let Err(e) = self.pipeline.start(cfg, &self.target, self.drm_fd) {
                    error!("Pipeline restart failed: {e}");
                    self.flags.request_exit();
                } else if cfg.record.enable {
                    if let Err(e) = self.pipeline.enable_recording(&cfg.record) {
                        warn!("Failed to re-enable recording after restart: {e}");
                    }
                }
            }

            self.pipeline.poll_child();
            if self.pipeline.state() == PipelineState::Stopped {
                info!("Pipeline stopped; exiting main loop");
                self.flags.request_exit();
                break;
            }
        }
    }

    /// Stop the pipeline on a worker thread so a stuck teardown cannot hang
    /// the process: if the worker misses the outer deadline the process is
    /// terminated immediately, with no further cleanup attempted.
    pub fn shutdown(&self) {
        info!("Stopping pipeline");

        let (done_tx, done_rx) = bounded::<()>(1);
        let pipeline = self.pipeline.clone();
        let worker = thread::Builder::new().name("pipeline-stop".into()).spawn(move || {
            pipeline.stop(STOP_WAIT);
            let _ = done_tx.send(());
        });

        match worker {
            Ok(handle) => {
                if done_rx.recv_timeout(SHUTDOWN_DEADLINE).is_err() {
                    error!("Pipeline stop timed out; forcing process exit");
                    std::process::exit(SHUTDOWN_TIMEOUT_STATUS);
                }
                let _ = handle.join();
            }
            Err(e) => {
                warn!("Failed to spawn pipeline stop worker: {e}");
                self.pipeline.stop(STOP_WAIT);
            }
        }
        info!("Pipeline stopped");
    }
}
