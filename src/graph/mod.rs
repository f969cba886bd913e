//! Media processing graph interface
//!
//! The core drives the stream-processing graph (jitter buffering, RTP
//! depacketization, parsing, format enforcement) through the capability
//! traits defined here. The concrete stage catalog is plain configuration
//! data ([`GraphSpec`]), so backends only need to know how to construct
//! named stages, set properties, link them, and expose the graph's packet
//! input, sample sink, and event bus.

pub mod loopback;

pub use loopback::{LoopbackGraph, LoopbackGraphBuilder};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;

/// Property value understood by graph stage configuration
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for PropValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// A single stage in a graph specification
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Stage type, e.g. "rtpjitterbuffer"
    pub factory: String,
    /// Instance name, unique within the graph
    pub name: String,
    /// Property assignments applied after construction
    pub props: Vec<(String, PropValue)>,
}

impl StageSpec {
    pub fn new(factory: &str, name: &str) -> Self {
        Self {
            factory: factory.to_string(),
            name: name.to_string(),
            props: Vec::new(),
        }
    }

    /// Add a property assignment (builder style)
    pub fn prop(mut self, key: &str, value: impl Into<PropValue>) -> Self {
        self.props.push((key.to_string(), value.into()));
        self
    }

    /// Look up an unsigned integer property
    pub fn get_uint(&self, key: &str) -> Option<u64> {
        self.props.iter().find(|(k, _)| k == key).and_then(|(_, v)| match v {
            PropValue::UInt(v) => Some(*v),
            PropValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        })
    }

    /// Look up a boolean property
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.props.iter().find(|(k, _)| k == key).and_then(|(_, v)| match v {
            PropValue::Bool(v) => Some(*v),
            _ => None,
        })
    }
}

/// Ordered stage catalog; backends link the stages into a chain in order
#[derive(Debug, Clone, Default)]
pub struct GraphSpec {
    pub stages: Vec<StageSpec>,
}

impl GraphSpec {
    /// First stage built from the given factory, if any
    pub fn find_stage(&self, factory: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.factory == factory)
    }
}

/// Typed event popped from the graph's event bus
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// The graph hit a fatal error; the message names the failing stage
    Error(String),
    /// End of stream reached the sink
    EndOfStream,
}

/// Outcome of a successful state-change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// The transition completed synchronously
    Complete,
    /// The transition is pending; wait with [`MediaGraph::wait_state_settled`]
    Async,
}

/// A parsed elementary-stream unit pulled from the sample sink
#[derive(Debug, Clone)]
pub struct Sample {
    pub data: Bytes,
    /// Presentation timestamp relative to graph start
    pub pts: Option<Duration>,
    /// Decode timestamp, when it differs from the PTS
    pub dts: Option<Duration>,
}

impl Sample {
    /// Best available timestamp: PTS, falling back to DTS
    pub fn best_timestamp(&self) -> Option<Duration> {
        self.pts.or(self.dts)
    }
}

/// Front-end input stage of a graph
pub trait PacketInput: Send + Sync {
    /// Bytes currently queued inside the graph ahead of this input
    fn queued_bytes(&self) -> u64;

    /// Hand a packet to the graph.
    ///
    /// Ownership transfers regardless of the outcome; a delivery failure is
    /// reported but must never be retried with the same packet.
    fn push_packet(&self, packet: Bytes) -> Result<()>;
}

/// Pull-mode terminal stage of a graph
pub trait SampleSink: Send + Sync {
    /// Pull the next sample, waiting at most `timeout`
    fn try_pull_sample(&self, timeout: Duration) -> Option<Sample>;
}

/// A constructed, linked processing graph
pub trait MediaGraph: Send + Sync {
    fn packet_input(&self) -> Arc<dyn PacketInput>;
    fn sample_sink(&self) -> Arc<dyn SampleSink>;

    /// Request the transition to the active/playing state
    fn set_playing(&self) -> Result<StateChange>;

    /// Wait for a pending async transition to settle
    fn wait_state_settled(&self, timeout: Duration) -> Result<()>;

    /// Inject an end-of-stream event at the head of the graph
    fn send_eos(&self);

    /// Force the graph to its idle/null state, releasing stream resources
    fn shutdown(&self);

    /// Pop the next bus event, waiting at most `timeout`
    fn try_pop_event(&self, timeout: Duration) -> Option<GraphEvent>;
}

/// Graph backend entry point
pub trait GraphBuilder: Send + Sync {
    /// One-time global backend initialization; idempotent across the
    /// process lifetime
    fn init(&self) -> Result<()>;

    /// Construct and link a graph from a stage catalog
    fn build(&self, spec: &GraphSpec) -> Result<Arc<dyn MediaGraph>>;
}
