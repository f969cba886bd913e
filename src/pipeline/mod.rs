//! Pipeline lifecycle orchestration
//!
//! Builds and tears down the processing graph, owns the sample-consumer and
//! graph-monitor threads, and hot-swaps the recording attachment. The
//! lifecycle is a three-state machine (stopped / running / stopping)
//! guarded by one primary lock plus a completion condition; `stop_requested`
//! is the single cooperative cancellation flag and thread joins are the
//! correctness boundary, condvar timeouts are advisory only.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::config::{AppConfig, RecordConfig};
use crate::decoder::{DecoderFactory, FeedOutcome, VideoDecoder};
use crate::display::DisplayTarget;
use crate::error::{AppError, Result};
use crate::graph::{
    GraphBuilder, GraphEvent, GraphSpec, MediaGraph, SampleSink, StageSpec, StateChange,
};
use crate::ingest::UdpReceiver;
use crate::record::{RecorderFactory, RecorderStats, VideoRecorder};

/// Bounded wait per sink pull in the consumer loop
const SINK_PULL_TIMEOUT: Duration = Duration::from_millis(100);
/// Bounded wait per bus pop in the monitor loop
const BUS_POP_TIMEOUT: Duration = Duration::from_millis(100);
/// Wait for an asynchronous graph state transition to settle
const STATE_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);
/// Sink queue depth used when the configured value is 0
const DEFAULT_SINK_DEPTH: u32 = 12;
/// Feed size gate when the decoder reports no packet-size limit
const FALLBACK_MAX_PACKET: usize = 1024 * 1024;

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Running,
    Stopping,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Everything guarded by the primary lock
struct Core {
    state: PipelineState,
    stop_requested: bool,
    encountered_error: bool,
    monitor_running: bool,
    consumer_running: bool,
    decoder_initialized: bool,
    decoder_running: bool,
    graph: Option<Arc<dyn MediaGraph>>,
    receiver: Option<UdpReceiver>,
    decoder: Option<Arc<dyn VideoDecoder>>,
    monitor: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl Core {
    fn new() -> Self {
        Self {
            state: PipelineState::Stopped,
            stop_requested: false,
            encountered_error: false,
            monitor_running: false,
            consumer_running: false,
            decoder_initialized: false,
            decoder_running: false,
            graph: None,
            receiver: None,
            decoder: None,
            monitor: None,
            consumer: None,
        }
    }
}

struct Shared {
    core: Mutex<Core>,
    /// Signaled by the monitor thread when it clears its running flag
    cond: Condvar,
    /// Recorder slot, independently locked so hot-swap never contends with
    /// lifecycle operations
    recorder: Mutex<Option<Box<dyn VideoRecorder>>>,
}

/// Pipeline controller; share as `Arc<Pipeline>` across the supervisor and
/// the shutdown worker. Reusable across repeated start/stop cycles.
pub struct Pipeline {
    shared: Arc<Shared>,
    graph_builder: Arc<dyn GraphBuilder>,
    decoder_factory: Arc<dyn DecoderFactory>,
    recorder_factory: Arc<dyn RecorderFactory>,
}

impl Pipeline {
    pub fn new(
        graph_builder: Arc<dyn GraphBuilder>,
        decoder_factory: Arc<dyn DecoderFactory>,
        recorder_factory: Arc<dyn RecorderFactory>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core::new()),
                cond: Condvar::new(),
                recorder: Mutex::new(None),
            }),
            graph_builder,
            decoder_factory,
            recorder_factory,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.shared.core.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Bring the pipeline up. Only accepted from the stopped state; any
    /// failure rolls everything back and leaves the pipeline stopped.
    pub fn start(&self, cfg: &AppConfig, target: &DisplayTarget, drm_fd: RawFd) -> Result<()> {
        {
            let core = self.shared.core.lock();
            if core.state != PipelineState::Stopped {
                warn!("Pipeline start refused (state {})", core.state);
                return Err(AppError::InvalidState(format!(
                    "pipeline is {}",
                    core.state
                )));
            }
        }

        match self.try_start(cfg, target, drm_fd) {
            Ok(()) => {
                info!("Pipeline running");
                Ok(())
            }
            Err(e) => {
                error!("Pipeline start failed: {e}");
                self.cleanup();
                Err(e)
            }
        }
    }

    fn try_start(&self, cfg: &AppConfig, target: &DisplayTarget, drm_fd: RawFd) -> Result<()> {
        self.graph_builder.init()?;

        {
            let mut core = self.shared.core.lock();
            core.stop_requested = false;
            core.encountered_error = false;
        }

        let spec = video_graph_spec(cfg);
        let graph = self.graph_builder.build(&spec)?;

        let receiver = UdpReceiver::new(
            cfg.udp_port,
            cfg.video_payload_type,
            graph.packet_input(),
        );
        if let Err(e) = receiver.start() {
            graph.shutdown();
            return Err(e);
        }

        // From here on partial state lives in the core so every failure
        // unwinds through the one cleanup path.
        {
            let mut core = self.shared.core.lock();
            core.graph = Some(graph.clone());
            core.receiver = Some(receiver);
        }

        match graph.set_playing()? {
            StateChange::Complete => {}
            StateChange::Async => graph.wait_state_settled(STATE_SETTLE_TIMEOUT)?,
        }

        let decoder = self.decoder_factory.create()?;
        self.shared.core.lock().decoder = Some(decoder.clone());

        decoder.init(cfg, target, drm_fd)?;
        self.shared.core.lock().decoder_initialized = true;

        decoder.start()?;
        self.shared.core.lock().decoder_running = true;

        let sink = graph.sample_sink();

        self.shared.core.lock().consumer_running = true;
        let consumer = thread::Builder::new().name("sample-consumer".into()).spawn({
            let shared = self.shared.clone();
            let decoder = decoder.clone();
            move || consumer_thread(shared, sink, decoder)
        });
        let consumer = match consumer {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.core.lock().consumer_running = false;
                return Err(e.into());
            }
        };
        self.shared.core.lock().consumer = Some(consumer);

        self.shared.core.lock().monitor_running = true;
        let monitor = thread::Builder::new().name("graph-monitor".into()).spawn({
            let shared = self.shared.clone();
            let graph = graph.clone();
            move || monitor_thread(shared, graph)
        });
        let monitor = match monitor {
            Ok(handle) => handle,
            Err(e) => {
                let mut core = self.shared.core.lock();
                core.monitor_running = false;
                // Lets the cleanup join of the consumer complete promptly
                core.stop_requested = true;
                return Err(e.into());
            }
        };

        let mut core = self.shared.core.lock();
        core.monitor = Some(monitor);
        core.state = PipelineState::Running;
        Ok(())
    }

    /// Tear the pipeline down. `wait` bounds the advisory condvar wait for
    /// the monitor thread; the subsequent joins are unconditional. No-op
    /// when already stopped, and safe to call repeatedly.
    pub fn stop(&self, wait: Duration) {
        let graph = {
            let mut core = self.shared.core.lock();
            if core.state == PipelineState::Stopped {
                return;
            }
            core.state = PipelineState::Stopping;
            core.stop_requested = true;
            core.graph.clone()
        };

        if let Some(graph) = &graph {
            graph.send_eos();
            graph.shutdown();
        }

        let receiver = self.shared.core.lock().receiver.take();
        if let Some(receiver) = &receiver {
            receiver.stop();
        }

        let consumer = self.shared.core.lock().consumer.take();
        if let Some(handle) = consumer {
            let _ = handle.join();
        }
        debug_assert!(!self.shared.core.lock().consumer_running);

        let deadline = Instant::now() + wait;
        {
            let mut core = self.shared.core.lock();
            while core.monitor_running {
                if self.shared.cond.wait_until(&mut core, deadline).timed_out() {
                    warn!("Monitor thread still running after bounded wait; joining");
                    break;
                }
            }
        }
        let monitor = self.shared.core.lock().monitor.take();
        if let Some(handle) = monitor {
            let _ = handle.join();
        }

        self.cleanup();
        self.shared.core.lock().state = PipelineState::Stopped;
        info!("Pipeline stopped");
    }

    /// Non-blocking liveness check: detects a pipeline that died on its own
    /// (graph error or end of stream) and finalizes the teardown.
    pub fn poll_child(&self) {
        let had_error = {
            let core = self.shared.core.lock();
            if core.monitor.is_none() || core.monitor_running {
                return;
            }
            core.encountered_error
        };

        let monitor = self.shared.core.lock().monitor.take();
        if let Some(handle) = monitor {
            let _ = handle.join();
        }
        self.cleanup();
        self.shared.core.lock().state = PipelineState::Stopped;

        if had_error {
            info!("Pipeline exited due to error");
        } else {
            info!("Pipeline exited cleanly");
        }
    }

    /// Release every resource the core still holds. Thread handles are
    /// joined, never detached; the recorder is freed outside its lock.
    fn cleanup(&self) {
        let (consumer, monitor, receiver, graph, decoder, was_initialized, was_running) = {
            let mut core = self.shared.core.lock();
            let taken = (
                core.consumer.take(),
                core.monitor.take(),
                core.receiver.take(),
                core.graph.take(),
                core.decoder.take(),
                core.decoder_initialized,
                core.decoder_running,
            );
            core.decoder_initialized = false;
            core.decoder_running = false;
            taken
        };

        if let Some(handle) = consumer {
            let _ = handle.join();
        }
        if let Some(handle) = monitor {
            let _ = handle.join();
        }

        if let Some(receiver) = receiver {
            receiver.stop();
        }
        if let Some(graph) = graph {
            graph.shutdown();
        }
        if let Some(decoder) = decoder {
            if was_running {
                decoder.stop();
            }
            if was_initialized {
                decoder.deinit();
            }
        }

        let recorder = self.shared.recorder.lock().take();
        drop(recorder);
    }

    /// Attach a recorder built from `cfg`. Idempotent: when one is already
    /// active the freshly built candidate is discarded and the call still
    /// succeeds.
    pub fn enable_recording(&self, cfg: &RecordConfig) -> Result<()> {
        if cfg.output_path.as_os_str().is_empty() {
            return Err(AppError::Recorder("recording output path is empty".into()));
        }

        let mut snapshot = cfg.clone();
        snapshot.enable = true;

        // Built before the lock; the lock covers only the install-or-discard
        // decision.
        let candidate = self.recorder_factory.create(&snapshot)?;

        let mut slot = self.shared.recorder.lock();
        if slot.is_some() {
            debug!("Recording already active; discarding new recorder");
            return Ok(());
        }
        *slot = Some(candidate);
        info!("Recording attached");
        Ok(())
    }

    /// Detach and free the active recorder, if any.
    pub fn disable_recording(&self) {
        let recorder = self.shared.recorder.lock().take();
        if recorder.is_some() {
            info!("Recording detached");
        }
    }

    /// Recording statistics, or inactive defaults when nothing is attached.
    pub fn recording_stats(&self) -> RecorderStats {
        self.shared
            .recorder
            .lock()
            .as_ref()
            .map(|r| r.stats())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn core_is_clear(&self) -> bool {
        let core = self.shared.core.lock();
        core.graph.is_none()
            && core.receiver.is_none()
            && core.decoder.is_none()
            && core.monitor.is_none()
            && core.consumer.is_none()
            && !core.decoder_initialized
            && !core.decoder_running
    }
}

/// Stage catalog for the live H.265 receive graph. The catalog is plain
/// data; backends interpret it.
fn video_graph_spec(cfg: &AppConfig) -> GraphSpec {
    let sink_depth = if cfg.appsink_max_buffers > 0 {
        cfg.appsink_max_buffers
    } else {
        DEFAULT_SINK_DEPTH
    };

    let mut source = StageSpec::new("appsrc", "udp-source")
        .prop("is-live", true)
        .prop("format", "time")
        .prop("stream-type", "stream")
        .prop("do-timestamp", true)
        // Never back-pressure the UDP thread
        .prop("block", false)
        .prop("max-bytes", 0u64)
        .prop("caps-media", "video")
        .prop("caps-encoding", "H265")
        .prop("caps-clock-rate", 90_000i64);
    if let Some(pt) = cfg.video_payload_type.value() {
        source = source.prop("caps-payload", pt as i64);
    }

    GraphSpec {
        stages: vec![
            source,
            // Front queue: unlimited, leaking the oldest entry under
            // pressure (complement of the ingest drop-newest policy)
            StageSpec::new("queue", "ingress-queue")
                .prop("leaky", "upstream")
                .prop("max-size-time", 0u64)
                .prop("max-size-bytes", 0u64)
                .prop("max-size-buffers", 0u64),
            StageSpec::new("rtpjitterbuffer", "jitter")
                .prop("latency", cfg.jitter_latency_ms as u64)
                .prop("do-lost", true)
                .prop("drop-on-late", false),
            StageSpec::new("rtph265depay", "video-depay"),
            StageSpec::new("h265parse", "video-parse")
                .prop("config-interval", -1i64)
                .prop("disable-passthrough", true),
            StageSpec::new("capsfilter", "format-caps")
                .prop("stream-format", "byte-stream")
                .prop("alignment", "au"),
            StageSpec::new("appsink", "sample-sink")
                .prop("max-buffers", sink_depth as u64)
                .prop("drop", true)
                .prop("sync", false)
                .prop("emit-signals", false),
        ],
    }
}

fn consumer_thread(shared: Arc<Shared>, sink: Arc<dyn SampleSink>, decoder: Arc<dyn VideoDecoder>) {
    let max_packet = match decoder.max_packet_size() {
        0 => FALLBACK_MAX_PACKET,
        n => n,
    };

    loop {
        let (stop, decoder_running) = {
            let core = shared.core.lock();
            (core.stop_requested, core.decoder_running)
        };
        if stop || !decoder_running {
            break;
        }

        let Some(sample) = sink.try_pull_sample(SINK_PULL_TIMEOUT) else {
            continue;
        };

        let pts = sample.best_timestamp();
        let data = sample.data;
        if data.is_empty() || data.len() > max_packet {
            trace!("Skipping sample of {} bytes", data.len());
            continue;
        }

        {
            let mut recorder = shared.recorder.lock();
            if let Some(recorder) = recorder.as_mut() {
                recorder.handle_sample(&data, pts);
            }
        }

        match decoder.feed(&data, pts) {
            Ok(FeedOutcome::Accepted) => {}
            Ok(FeedOutcome::Busy) => debug!("Video decoder busy; sample dropped"),
            Err(e) => debug!("Video decoder feed failed: {e}"),
        }
    }

    decoder.send_eos();
    shared.core.lock().consumer_running = false;
}

fn monitor_thread(shared: Arc<Shared>, graph: Arc<dyn MediaGraph>) {
    loop {
        match graph.try_pop_event(BUS_POP_TIMEOUT) {
            Some(GraphEvent::Error(message)) => {
                error!("Pipeline error: {message}");
                let mut core = shared.core.lock();
                core.encountered_error = true;
                core.stop_requested = true;
                break;
            }
            Some(GraphEvent::EndOfStream) => {
                info!("Pipeline received EOS");
                shared.core.lock().stop_requested = true;
                break;
            }
            None => {
                if shared.core.lock().stop_requested {
                    break;
                }
            }
        }
    }

    let mut core = shared.core.lock();
    core.monitor_running = false;
    shared.cond.notify_all();
}
