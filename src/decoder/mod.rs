//! Hardware video decoder interface
//!
//! The pipeline feeds parsed elementary-stream units to a decoder through
//! this trait. A platform backend (e.g. a stateful V4L2 or MPP decoder
//! scanning out to a DRM plane) owns all decode and presentation details;
//! the core only drives the lifecycle and the feed loop.

pub mod null;

pub use null::{NullDecoder, NullDecoderFactory};

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::display::DisplayTarget;
use crate::error::Result;

/// Outcome of feeding one packet to the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    Accepted,
    /// The decoder's input queue is full; the packet was not consumed.
    /// Transient, logged by the caller, never fatal.
    Busy,
}

pub trait VideoDecoder: Send + Sync {
    /// Bind the decoder to the display target and DRM device
    fn init(&self, cfg: &AppConfig, target: &DisplayTarget, drm_fd: RawFd) -> Result<()>;

    fn start(&self) -> Result<()>;

    /// Feed one access unit with its presentation timestamp
    fn feed(&self, data: &[u8], pts: Option<Duration>) -> Result<FeedOutcome>;

    /// Signal that no more input will arrive
    fn send_eos(&self);

    fn stop(&self);

    fn deinit(&self);

    /// Largest packet `feed` accepts; 0 when the backend has no fixed limit
    fn max_packet_size(&self) -> usize;
}

/// Creates decoder instances, one per pipeline start
pub trait DecoderFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn VideoDecoder>>;
}
