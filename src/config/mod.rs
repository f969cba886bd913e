//! Application configuration
//!
//! Configuration is an immutable snapshot resolved at startup from built-in
//! defaults, an optional TOML config file, and command line overrides (in
//! that order of precedence).

mod file;

pub use file::load_config_file;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::error::AppError;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// DRM card device path
    pub card_path: PathBuf,
    /// Connector name, e.g. "HDMI-A-1" (empty = auto-detect)
    #[serde(alias = "connector_name")]
    pub connector: String,
    /// Video plane ID
    pub plane_id: u32,
    /// UDP listen port for the RTP stream
    pub udp_port: u16,
    /// RTP payload type accepted for video (`any` disables filtering)
    #[serde(alias = "vid_pt")]
    pub video_payload_type: PayloadTypeFilter,
    /// Max decoded samples queued on the sink before the oldest is dropped
    /// (0 = use the built-in default)
    pub appsink_max_buffers: u32,
    /// Jitter buffer latency in milliseconds
    #[serde(alias = "jitter_buffer_ms")]
    pub jitter_latency_ms: u32,
    /// Recording settings
    pub record: RecordConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            card_path: PathBuf::from("/dev/dri/card0"),
            connector: String::new(),
            plane_id: 76,
            udp_port: 5600,
            video_payload_type: PayloadTypeFilter::default(),
            appsink_max_buffers: 4,
            jitter_latency_ms: 10,
            record: RecordConfig::default(),
        }
    }
}

/// Recording configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecordConfig {
    /// Whether recording starts enabled
    pub enable: bool,
    /// Output file, or a directory in which files are named automatically
    #[serde(alias = "path")]
    pub output_path: PathBuf,
    /// Recording mode
    pub mode: RecordMode,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enable: false,
            output_path: PathBuf::from("/media"),
            mode: RecordMode::Sequential,
        }
    }
}

/// Recording mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    /// Single output file, truncated if it exists
    Standard,
    /// Numbered output files, never overwriting an earlier recording
    Sequential,
    /// Like `Standard`, with periodic flushes so a crash loses at most
    /// about a second of stream
    Fragmented,
}

impl RecordMode {
    /// Canonical name as used in config files and logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Sequential => "sequential",
            Self::Fragmented => "fragmented",
        }
    }
}

impl fmt::Display for RecordMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RecordMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" | "default" => Ok(Self::Standard),
            "sequential" | "append" => Ok(Self::Sequential),
            "fragmented" | "fragment" => Ok(Self::Fragmented),
            other => Err(AppError::Config(format!("unknown record mode: {other}"))),
        }
    }
}

impl<'de> Deserialize<'de> for RecordMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// RTP payload type filter: a specific type in 0..=127, or `any`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadTypeFilter(Option<u8>);

impl PayloadTypeFilter {
    /// Accept every payload type
    pub const ANY: Self = Self(None);

    /// Accept only the given payload type
    pub fn specific(pt: u8) -> Result<Self, AppError> {
        if pt <= 127 {
            Ok(Self(Some(pt)))
        } else {
            Err(AppError::Config(format!(
                "payload type out of range 0-127: {pt}"
            )))
        }
    }

    /// The configured payload type, or `None` for `any`
    pub fn value(&self) -> Option<u8> {
        self.0
    }

    /// Whether a received payload type passes the filter
    pub fn matches(&self, pt: u8) -> bool {
        match self.0 {
            None => true,
            Some(expected) => expected == pt,
        }
    }
}

impl Default for PayloadTypeFilter {
    fn default() -> Self {
        Self(Some(97))
    }
}

impl fmt::Display for PayloadTypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("any"),
            Some(pt) => write!(f, "{pt}"),
        }
    }
}

impl FromStr for PayloadTypeFilter {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("any") {
            return Ok(Self::ANY);
        }
        let pt: u8 = s
            .parse()
            .map_err(|_| AppError::Config(format!("invalid payload type: {s}")))?;
        Self::specific(pt)
    }
}

impl<'de> Deserialize<'de> for PayloadTypeFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = PayloadTypeFilter;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a payload type in 0..=127 or the string \"any\"")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if (0..=127).contains(&v) {
                    Ok(PayloadTypeFilter(Some(v as u8)))
                } else {
                    Err(E::custom(format!("payload type out of range 0-127: {v}")))
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                self.visit_i64(v.try_into().map_err(|_| {
                    E::custom(format!("payload type out of range 0-127: {v}"))
                })?)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.card_path, PathBuf::from("/dev/dri/card0"));
        assert!(cfg.connector.is_empty());
        assert_eq!(cfg.plane_id, 76);
        assert_eq!(cfg.udp_port, 5600);
        assert_eq!(cfg.video_payload_type.value(), Some(97));
        assert_eq!(cfg.appsink_max_buffers, 4);
        assert_eq!(cfg.jitter_latency_ms, 10);
        assert!(!cfg.record.enable);
        assert_eq!(cfg.record.output_path, PathBuf::from("/media"));
        assert_eq!(cfg.record.mode, RecordMode::Sequential);
    }

    #[test]
    fn record_mode_aliases() {
        assert_eq!("standard".parse::<RecordMode>().unwrap(), RecordMode::Standard);
        assert_eq!("default".parse::<RecordMode>().unwrap(), RecordMode::Standard);
        assert_eq!("append".parse::<RecordMode>().unwrap(), RecordMode::Sequential);
        assert_eq!("FRAGMENT".parse::<RecordMode>().unwrap(), RecordMode::Fragmented);
        assert!("mp4".parse::<RecordMode>().is_err());
    }

    #[test]
    fn payload_type_parsing() {
        assert_eq!("any".parse::<PayloadTypeFilter>().unwrap(), PayloadTypeFilter::ANY);
        assert_eq!(
            "96".parse::<PayloadTypeFilter>().unwrap().value(),
            Some(96)
        );
        assert!("128".parse::<PayloadTypeFilter>().is_err());
        assert!("h265".parse::<PayloadTypeFilter>().is_err());
    }

    #[test]
    fn payload_type_matching() {
        let any = PayloadTypeFilter::ANY;
        for pt in 0..=127 {
            assert!(any.matches(pt));
        }
        let specific = PayloadTypeFilter::specific(97).unwrap();
        assert!(specific.matches(97));
        assert!(!specific.matches(96));
    }
}
