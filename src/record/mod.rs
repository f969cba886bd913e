//! Stream recording interface
//!
//! A recorder receives a copy of every decoded sample's raw bytes from the
//! pipeline's sample consumer. Muxing is backend territory; the core only
//! hot-swaps recorder instances and reads their statistics.

pub mod raw;

pub use raw::{RawRecorder, RawRecorderFactory};

use std::path::PathBuf;
use std::time::Duration;

use crate::config::RecordConfig;
use crate::error::Result;

/// Live recording statistics snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecorderStats {
    pub active: bool,
    pub bytes_written: u64,
    /// Wall-clock time since the recorder was created
    pub elapsed: Duration,
    /// Timestamp span of the recorded media
    pub media_duration: Duration,
    pub output_path: PathBuf,
}

pub trait VideoRecorder: Send {
    /// Persist one sample's raw bytes.
    ///
    /// Write failures are absorbed: the recorder deactivates itself and the
    /// stats' `active` flag goes false, but the data path never fails.
    fn handle_sample(&mut self, data: &[u8], pts: Option<Duration>);

    fn stats(&self) -> RecorderStats;
}

/// Builds recorder instances from a config snapshot
pub trait RecorderFactory: Send + Sync {
    fn create(&self, cfg: &RecordConfig) -> Result<Box<dyn VideoRecorder>>;
}
