//! Raw byte-stream recorder
//!
//! Writes the parsed Annex-B elementary stream to disk unmodified. The
//! output is playable with any H.265-aware tool and can be remuxed into a
//! container offline. File naming follows the recording mode: `standard`
//! truncates the target, `sequential` never overwrites an existing
//! recording, `fragmented` additionally flushes on a short cadence so a
//! crash loses at most about a second of stream.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{info, warn};

use crate::config::{RecordConfig, RecordMode};
use crate::error::{AppError, Result};
use crate::record::{RecorderFactory, RecorderStats, VideoRecorder};

/// Flush cadence in fragmented mode
const FRAGMENT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Extension used when the configured path is a directory
const OUTPUT_EXTENSION: &str = "h265";

pub struct RawRecorder {
    /// `None` once a write error has deactivated the recorder
    file: Option<File>,
    path: PathBuf,
    mode: RecordMode,
    bytes_written: u64,
    created_at: Instant,
    first_pts: Option<Duration>,
    last_pts: Option<Duration>,
    last_flush: Instant,
}

impl RawRecorder {
    pub fn create(cfg: &RecordConfig) -> Result<Self> {
        let path = resolve_output_path(&cfg.output_path, cfg.mode)?;
        let file = File::create(&path)
            .map_err(|e| AppError::Recorder(format!("failed to create {}: {e}", path.display())))?;
        info!(mode = %cfg.mode, "Recording to {}", path.display());
        let now = Instant::now();
        Ok(Self {
            file: Some(file),
            path,
            mode: cfg.mode,
            bytes_written: 0,
            created_at: now,
            first_pts: None,
            last_pts: None,
            last_flush: now,
        })
    }
}

impl VideoRecorder for RawRecorder {
    fn handle_sample(&mut self, data: &[u8], pts: Option<Duration>) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        if let Err(e) = file.write_all(data) {
            warn!("Recorder: write to {} failed: {e}; recording stopped", self.path.display());
            self.file = None;
            return;
        }
        self.bytes_written += data.len() as u64;

        if let Some(pts) = pts {
            if self.first_pts.is_none() {
                self.first_pts = Some(pts);
            }
            self.last_pts = Some(pts);
        }

        if self.mode == RecordMode::Fragmented
            && self.last_flush.elapsed() >= FRAGMENT_FLUSH_INTERVAL
        {
            self.last_flush = Instant::now();
            if let Err(e) = file.flush().and_then(|_| file.sync_data()) {
                warn!("Recorder: sync of {} failed: {e}", self.path.display());
            }
        }
    }

    fn stats(&self) -> RecorderStats {
        let media_duration = match (self.first_pts, self.last_pts) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => Duration::ZERO,
        };
        RecorderStats {
            active: self.file.is_some(),
            bytes_written: self.bytes_written,
            elapsed: self.created_at.elapsed(),
            media_duration,
            output_path: self.path.clone(),
        }
    }
}

impl Drop for RawRecorder {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            info!(
                "Recording finished: {} ({} bytes)",
                self.path.display(),
                self.bytes_written
            );
        }
    }
}

/// Resolve the actual output file for a configured path and mode.
///
/// A directory target gets a timestamped file name inside it; in
/// sequential mode an existing file is never reused, a free numbered
/// variant is picked instead.
fn resolve_output_path(configured: &Path, mode: RecordMode) -> Result<PathBuf> {
    if configured.as_os_str().is_empty() {
        return Err(AppError::Recorder("empty recording output path".into()));
    }

    let candidate = if configured.is_dir() {
        let name = format!(
            "vidlink_{}.{OUTPUT_EXTENSION}",
            Local::now().format("%Y%m%d_%H%M%S")
        );
        configured.join(name)
    } else {
        configured.to_path_buf()
    };

    if mode != RecordMode::Sequential || !candidate.exists() {
        return Ok(candidate);
    }

    let stem = candidate
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("vidlink")
        .to_string();
    let ext = candidate
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or(OUTPUT_EXTENSION)
        .to_string();
    for n in 1..10_000u32 {
        let numbered = candidate.with_file_name(format!("{stem}_{n:04}.{ext}"));
        if !numbered.exists() {
            return Ok(numbered);
        }
    }
    Err(AppError::Recorder(format!(
        "no free sequential file name under {}",
        configured.display()
    )))
}

#[derive(Debug, Default)]
pub struct RawRecorderFactory;

impl RawRecorderFactory {
    pub fn new() -> Self {
        Self
    }
}

impl RecorderFactory for RawRecorderFactory {
    fn create(&self, cfg: &RecordConfig) -> Result<Box<dyn VideoRecorder>> {
        Ok(Box::new(RawRecorder::create(cfg)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg(path: &Path, mode: RecordMode) -> RecordConfig {
        RecordConfig {
            enable: true,
            output_path: path.to_path_buf(),
            mode,
        }
    }

    #[test]
    fn writes_samples_and_tracks_stats() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.h265");
        let mut rec = RawRecorder::create(&cfg(&path, RecordMode::Standard)).unwrap();

        rec.handle_sample(b"first", Some(Duration::from_millis(0)));
        rec.handle_sample(b"second", Some(Duration::from_millis(80)));

        let stats = rec.stats();
        assert!(stats.active);
        assert_eq!(stats.bytes_written, 11);
        assert_eq!(stats.media_duration, Duration::from_millis(80));
        assert_eq!(stats.output_path, path);

        drop(rec);
        assert_eq!(std::fs::read(&path).unwrap(), b"firstsecond");
    }

    #[test]
    fn standard_mode_truncates_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.h265");
        std::fs::write(&path, b"old recording").unwrap();

        let mut rec = RawRecorder::create(&cfg(&path, RecordMode::Standard)).unwrap();
        rec.handle_sample(b"new", None);
        drop(rec);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn sequential_mode_never_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.h265");
        std::fs::write(&path, b"keep me").unwrap();

        let rec = RawRecorder::create(&cfg(&path, RecordMode::Sequential)).unwrap();
        let stats = rec.stats();
        assert_eq!(stats.output_path, dir.path().join("out_0001.h265"));
        drop(rec);
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");

        // The next one skips both existing files
        let rec = RawRecorder::create(&cfg(&path, RecordMode::Sequential)).unwrap();
        assert_eq!(rec.stats().output_path, dir.path().join("out_0002.h265"));
    }

    #[test]
    fn directory_target_gets_generated_name() {
        let dir = tempdir().unwrap();
        let rec = RawRecorder::create(&cfg(dir.path(), RecordMode::Standard)).unwrap();
        let path = rec.stats().output_path;
        assert_eq!(path.parent().unwrap(), dir.path());
        assert_eq!(path.extension().unwrap(), OUTPUT_EXTENSION);
    }

    #[test]
    fn empty_path_is_rejected() {
        assert!(RawRecorder::create(&cfg(Path::new(""), RecordMode::Standard)).is_err());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let missing = Path::new("/nonexistent-vidlink-dir/out.h265");
        assert!(RawRecorder::create(&cfg(missing, RecordMode::Standard)).is_err());
    }

    #[test]
    fn media_duration_without_timestamps_is_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.h265");
        let mut rec = RawRecorder::create(&cfg(&path, RecordMode::Standard)).unwrap();
        rec.handle_sample(b"data", None);
        assert_eq!(rec.stats().media_duration, Duration::ZERO);
    }
}
