//! Loopback software graph
//!
//! Reference [`MediaGraph`] backend used for development, tests, and
//! headless deployments. It performs a minimal RTP unwrap (fixed header,
//! CSRC list, extension, padding) and queues the raw payload as one sample
//! per packet; the orchestration-relevant stage properties (sink depth,
//! drop-oldest) are honored, everything else in the catalog is treated as
//! passthrough. Hardware graph backends implement the same traits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{AppError, Result};
use crate::graph::{
    GraphBuilder, GraphEvent, GraphSpec, MediaGraph, PacketInput, Sample, SampleSink, StateChange,
};

/// Sink depth used when the catalog does not carry one
const DEFAULT_SINK_DEPTH: usize = 12;
/// Event bus capacity; the monitor thread drains continuously
const EVENT_BUS_DEPTH: usize = 16;

/// Builder for [`LoopbackGraph`]
#[derive(Debug, Default)]
pub struct LoopbackGraphBuilder;

impl LoopbackGraphBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl GraphBuilder for LoopbackGraphBuilder {
    fn init(&self) -> Result<()> {
        static INIT: AtomicBool = AtomicBool::new(false);
        if !INIT.swap(true, Ordering::SeqCst) {
            debug!("Loopback media backend initialized");
        }
        Ok(())
    }

    fn build(&self, spec: &GraphSpec) -> Result<Arc<dyn MediaGraph>> {
        let source = spec
            .find_stage("appsrc")
            .ok_or_else(|| AppError::Graph("stage catalog has no appsrc stage".into()))?;
        let sink = spec
            .find_stage("appsink")
            .ok_or_else(|| AppError::Graph("stage catalog has no appsink stage".into()))?;

        for stage in &spec.stages {
            if stage.factory != "appsrc" && stage.factory != "appsink" {
                trace!(factory = %stage.factory, name = %stage.name, "loopback: passthrough stage");
            }
        }

        let max_buffers = sink
            .get_uint("max-buffers")
            .map(|v| v as usize)
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_SINK_DEPTH);

        debug!(
            source = %source.name,
            sink = %sink.name,
            max_buffers,
            "Built loopback graph with {} stages",
            spec.stages.len()
        );
        Ok(Arc::new(LoopbackGraph::new(max_buffers)))
    }
}

struct SinkQueue {
    samples: VecDeque<Sample>,
    queued_bytes: u64,
}

struct Shared {
    sink: Mutex<SinkQueue>,
    sink_cond: Condvar,
    max_buffers: usize,
    playing: AtomicBool,
    shut_down: AtomicBool,
    dropped: AtomicU64,
    started_at: Instant,
    events_tx: Sender<GraphEvent>,
    events_rx: Receiver<GraphEvent>,
}

/// In-process software graph (see module docs)
pub struct LoopbackGraph {
    shared: Arc<Shared>,
}

impl LoopbackGraph {
    fn new(max_buffers: usize) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_BUS_DEPTH);
        Self {
            shared: Arc::new(Shared {
                sink: Mutex::new(SinkQueue {
                    samples: VecDeque::new(),
                    queued_bytes: 0,
                }),
                sink_cond: Condvar::new(),
                max_buffers,
                playing: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                started_at: Instant::now(),
                events_tx,
                events_rx,
            }),
        }
    }

    /// Samples dropped at the sink because the queue depth was exceeded
    pub fn dropped_samples(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl MediaGraph for LoopbackGraph {
    fn packet_input(&self) -> Arc<dyn PacketInput> {
        self.shared.clone()
    }

    fn sample_sink(&self) -> Arc<dyn SampleSink> {
        self.shared.clone()
    }

    fn set_playing(&self) -> Result<StateChange> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(AppError::Graph("graph is shut down".into()));
        }
        self.shared.playing.store(true, Ordering::SeqCst);
        Ok(StateChange::Complete)
    }

    fn wait_state_settled(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn send_eos(&self) {
        if self.shared.events_tx.try_send(GraphEvent::EndOfStream).is_err() {
            warn!("Loopback graph: event bus full, EOS event dropped");
        }
    }

    fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        self.shared.playing.store(false, Ordering::SeqCst);
        let mut sink = self.shared.sink.lock();
        sink.samples.clear();
        sink.queued_bytes = 0;
        self.shared.sink_cond.notify_all();
    }

    fn try_pop_event(&self, timeout: Duration) -> Option<GraphEvent> {
        self.shared.events_rx.recv_timeout(timeout).ok()
    }
}

impl PacketInput for Shared {
    fn queued_bytes(&self) -> u64 {
        self.sink.lock().queued_bytes
    }

    fn push_packet(&self, packet: Bytes) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(AppError::Graph("push on shut-down graph".into()));
        }

        let payload = match rtp_payload(&packet) {
            Some(p) if !p.is_empty() => p,
            _ => return Err(AppError::Graph("malformed RTP packet".into())),
        };

        let sample = Sample {
            pts: Some(self.started_at.elapsed()),
            dts: None,
            data: payload,
        };

        let mut sink = self.sink.lock();
        while sink.samples.len() >= self.max_buffers {
            if let Some(old) = sink.samples.pop_front() {
                sink.queued_bytes -= old.data.len() as u64;
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        sink.queued_bytes += sample.data.len() as u64;
        sink.samples.push_back(sample);
        self.sink_cond.notify_one();
        Ok(())
    }
}

impl SampleSink for Shared {
    fn try_pull_sample(&self, timeout: Duration) -> Option<Sample> {
        let deadline = Instant::now() + timeout;
        let mut sink = self.sink.lock();
        while sink.samples.is_empty() {
            if self.shut_down.load(Ordering::SeqCst) {
                return None;
            }
            if self.sink_cond.wait_until(&mut sink, deadline).timed_out() {
                return None;
            }
        }
        let sample = sink.samples.pop_front()?;
        sink.queued_bytes -= sample.data.len() as u64;
        Some(sample)
    }
}

/// Strip the RTP framing from a datagram, returning the payload.
///
/// Handles the fixed header, CSRC list, one header extension, and padding.
/// Returns `None` for anything that is not an RTP v2 packet.
fn rtp_payload(packet: &Bytes) -> Option<Bytes> {
    const FIXED_HEADER: usize = 12;
    if packet.len() < FIXED_HEADER {
        return None;
    }
    let b0 = packet[0];
    if b0 >> 6 != 2 {
        return None;
    }

    let csrc_count = (b0 & 0x0f) as usize;
    let mut offset = FIXED_HEADER + csrc_count * 4;
    if packet.len() < offset {
        return None;
    }

    // Header extension: 4-byte preamble plus a 32-bit word count
    if b0 & 0x10 != 0 {
        if packet.len() < offset + 4 {
            return None;
        }
        let words = u16::from_be_bytes([packet[offset + 2], packet[offset + 3]]) as usize;
        offset += 4 + words * 4;
    }

    let mut end = packet.len();
    if b0 & 0x20 != 0 {
        let pad = *packet.last()? as usize;
        if pad == 0 || pad > end {
            return None;
        }
        end -= pad;
    }

    if offset > end {
        return None;
    }
    Some(packet.slice(offset..end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StageSpec;

    /// Minimal RTP packet: fixed 12-byte header, given payload type and payload
    fn rtp_packet(pt: u8, seq: u16, payload: &[u8]) -> Bytes {
        let mut pkt = Vec::with_capacity(12 + payload.len());
        pkt.push(0x80);
        pkt.push(pt & 0x7f);
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(&[0u8; 8]); // timestamp + ssrc
        pkt.extend_from_slice(payload);
        Bytes::from(pkt)
    }

    fn test_spec(max_buffers: u64) -> GraphSpec {
        GraphSpec {
            stages: vec![
                StageSpec::new("appsrc", "udp-source"),
                StageSpec::new("appsink", "sample-sink").prop("max-buffers", max_buffers),
            ],
        }
    }

    fn build(max_buffers: u64) -> Arc<dyn MediaGraph> {
        LoopbackGraphBuilder::new().build(&test_spec(max_buffers)).unwrap()
    }

    #[test]
    fn build_requires_source_and_sink() {
        let builder = LoopbackGraphBuilder::new();
        let empty = GraphSpec::default();
        assert!(builder.build(&empty).is_err());

        let no_sink = GraphSpec {
            stages: vec![StageSpec::new("appsrc", "udp-source")],
        };
        assert!(builder.build(&no_sink).is_err());
    }

    #[test]
    fn push_strips_rtp_header() {
        let graph = build(4);
        graph.set_playing().unwrap();
        let input = graph.packet_input();
        let sink = graph.sample_sink();

        input.push_packet(rtp_packet(97, 1, b"payload")).unwrap();
        let sample = sink.try_pull_sample(Duration::from_millis(100)).unwrap();
        assert_eq!(&sample.data[..], b"payload");
        assert!(sample.best_timestamp().is_some());
    }

    #[test]
    fn malformed_packets_are_rejected() {
        let graph = build(4);
        graph.set_playing().unwrap();
        let input = graph.packet_input();

        assert!(input.push_packet(Bytes::from_static(b"short")).is_err());
        // Wrong RTP version
        let mut bad = vec![0u8; 16];
        bad[0] = 0x40;
        assert!(input.push_packet(Bytes::from(bad)).is_err());
    }

    #[test]
    fn sink_drops_oldest_beyond_depth() {
        let graph = build(2);
        graph.set_playing().unwrap();
        let input = graph.packet_input();
        let sink = graph.sample_sink();

        input.push_packet(rtp_packet(97, 1, b"one")).unwrap();
        input.push_packet(rtp_packet(97, 2, b"two")).unwrap();
        input.push_packet(rtp_packet(97, 3, b"three")).unwrap();

        let first = sink.try_pull_sample(Duration::from_millis(100)).unwrap();
        assert_eq!(&first.data[..], b"two");
        let second = sink.try_pull_sample(Duration::from_millis(100)).unwrap();
        assert_eq!(&second.data[..], b"three");
        assert!(sink.try_pull_sample(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn queued_bytes_tracks_sink_level() {
        let graph = build(8);
        graph.set_playing().unwrap();
        let input = graph.packet_input();
        assert_eq!(input.queued_bytes(), 0);
        input.push_packet(rtp_packet(97, 1, &[0u8; 100])).unwrap();
        assert_eq!(input.queued_bytes(), 100);
        let _ = graph.sample_sink().try_pull_sample(Duration::from_millis(100));
        assert_eq!(input.queued_bytes(), 0);
    }

    #[test]
    fn eos_event_reaches_the_bus() {
        let graph = build(4);
        graph.send_eos();
        assert_eq!(
            graph.try_pop_event(Duration::from_millis(100)),
            Some(GraphEvent::EndOfStream)
        );
        assert!(graph.try_pop_event(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn shutdown_rejects_pushes_and_unblocks_pulls() {
        let graph = build(4);
        graph.set_playing().unwrap();
        let input = graph.packet_input();
        input.push_packet(rtp_packet(97, 1, b"x")).unwrap();

        graph.shutdown();
        assert!(input.push_packet(rtp_packet(97, 2, b"y")).is_err());
        assert!(graph
            .sample_sink()
            .try_pull_sample(Duration::from_millis(10))
            .is_none());
        assert_eq!(input.queued_bytes(), 0);
    }

    #[test]
    fn rtp_payload_handles_csrc_extension_padding() {
        // Two CSRC entries
        let mut pkt = vec![0x82, 97];
        pkt.extend_from_slice(&[0u8; 10]); // seq/ts/ssrc
        pkt.extend_from_slice(&[0u8; 8]); // csrc list
        pkt.extend_from_slice(b"data");
        assert_eq!(&rtp_payload(&Bytes::from(pkt)).unwrap()[..], b"data");

        // Header extension of one word
        let mut pkt = vec![0x90, 97];
        pkt.extend_from_slice(&[0u8; 10]);
        pkt.extend_from_slice(&[0, 0, 0, 1]); // ext preamble, length = 1 word
        pkt.extend_from_slice(&[0u8; 4]); // ext body
        pkt.extend_from_slice(b"data");
        assert_eq!(&rtp_payload(&Bytes::from(pkt)).unwrap()[..], b"data");

        // Padding of 2 bytes
        let mut pkt = vec![0xa0, 97];
        pkt.extend_from_slice(&[0u8; 10]);
        pkt.extend_from_slice(b"data");
        pkt.extend_from_slice(&[0, 2]);
        assert_eq!(&rtp_payload(&Bytes::from(pkt)).unwrap()[..], b"data");
    }
}
