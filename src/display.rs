//! Display output configuration
//!
//! The display/modeset collaborator resolves a [`DisplayTarget`] from the
//! opened DRM device and the configuration in one synchronous call; a
//! failure here is fatal to process startup. The headless backend resolves
//! the target from configuration alone for deployments without a modeset
//! path.

use std::os::unix::io::RawFd;

use tracing::info;

use crate::config::AppConfig;
use crate::error::Result;

/// Resolved output configuration consumed by the video decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayTarget {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    pub plane_id: u32,
    pub connector: String,
}

/// Produces a [`DisplayTarget`] from a DRM device and configuration
pub trait DisplaySetup: Send + Sync {
    fn configure(&self, drm_fd: RawFd, cfg: &AppConfig) -> Result<DisplayTarget>;
}

/// Headless display setup: no modeset, target taken from configuration
#[derive(Debug, Default)]
pub struct HeadlessDisplay;

impl HeadlessDisplay {
    pub fn new() -> Self {
        Self
    }
}

impl DisplaySetup for HeadlessDisplay {
    fn configure(&self, _drm_fd: RawFd, cfg: &AppConfig) -> Result<DisplayTarget> {
        let target = DisplayTarget {
            width: 1920,
            height: 1080,
            refresh_hz: 60,
            plane_id: cfg.plane_id,
            connector: if cfg.connector.is_empty() {
                "headless".to_string()
            } else {
                cfg.connector.clone()
            },
        };
        info!(
            "Headless display target: {}x{}@{} plane {} ({})",
            target.width, target.height, target.refresh_hz, target.plane_id, target.connector
        );
        Ok(target)
    }
}
