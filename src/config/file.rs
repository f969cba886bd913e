//! Config file loading
//!
//! The config file is TOML with the same keys as the CLI; values given on
//! the command line take precedence over the file.

use std::path::Path;

use crate::config::AppConfig;
use crate::error::{AppError, Result};

/// Load an [`AppConfig`] from a TOML file.
///
/// Keys that are absent keep their built-in defaults.
pub fn load_config_file(path: &Path) -> Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| AppError::Config(format!("{}: {e}", path.display())))
}
