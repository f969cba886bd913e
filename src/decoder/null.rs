//! Accounting-only decoder backend
//!
//! Consumes the elementary stream without decoding, keeping frame and byte
//! counters. Used for headless runs and tests; hardware backends replace it
//! behind the same trait.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::AppConfig;
use crate::decoder::{DecoderFactory, FeedOutcome, VideoDecoder};
use crate::display::DisplayTarget;
use crate::error::{AppError, Result};

const NULL_MAX_PACKET: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct NullDecoder {
    initialized: AtomicBool,
    running: AtomicBool,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl NullDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_fed(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes_fed(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl VideoDecoder for NullDecoder {
    fn init(&self, _cfg: &AppConfig, target: &DisplayTarget, _drm_fd: RawFd) -> Result<()> {
        info!(
            "Null decoder bound to {}x{}@{} plane {}",
            target.width, target.height, target.refresh_hz, target.plane_id
        );
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AppError::Decoder("start before init".into()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn feed(&self, data: &[u8], _pts: Option<Duration>) -> Result<FeedOutcome> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AppError::Decoder("feed while stopped".into()));
        }
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(FeedOutcome::Accepted)
    }

    fn send_eos(&self) {
        debug!(
            "Null decoder EOS after {} frames ({} bytes)",
            self.frames_fed(),
            self.bytes_fed()
        );
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn deinit(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn max_packet_size(&self) -> usize {
        NULL_MAX_PACKET
    }
}

#[derive(Debug, Default)]
pub struct NullDecoderFactory;

impl NullDecoderFactory {
    pub fn new() -> Self {
        Self
    }
}

impl DecoderFactory for NullDecoderFactory {
    fn create(&self) -> Result<Arc<dyn VideoDecoder>> {
        Ok(Arc::new(NullDecoder::new()))
    }
}
