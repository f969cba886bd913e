use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vidlink::config::{load_config_file, AppConfig, PayloadTypeFilter, RecordMode};
use vidlink::decoder::NullDecoderFactory;
use vidlink::display::{DisplaySetup, HeadlessDisplay};
use vidlink::graph::LoopbackGraphBuilder;
use vidlink::pipeline::Pipeline;
use vidlink::record::RawRecorderFactory;
use vidlink::supervisor::{ControlFlags, InstanceGuard, SignalWatcher, Supervisor, DEFAULT_PID_PATH};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Vidlink command line arguments
#[derive(Parser, Debug)]
#[command(name = "vidlink")]
#[command(version, about = "A lightweight low-latency RTP H.265 video receiver", long_about = None)]
struct CliArgs {
    /// DRM card path (overrides config file)
    #[arg(long, value_name = "PATH")]
    card: Option<PathBuf>,

    /// Connector name, e.g. HDMI-A-1 (default: auto)
    #[arg(long, value_name = "NAME")]
    connector: Option<String>,

    /// Video plane ID
    #[arg(long, value_name = "ID")]
    plane_id: Option<u32>,

    /// Load configuration from a TOML file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// UDP listen port
    #[arg(long, value_name = "PORT")]
    udp_port: Option<u16>,

    /// RTP payload type for video: 0-127, or "any" to disable filtering
    #[arg(long = "vid-pt", value_name = "PT", value_parser = parse_payload_type)]
    vid_pt: Option<PayloadTypeFilter>,

    /// Max buffers queued on the sample sink (0 = built-in default)
    #[arg(long, value_name = "N")]
    appsink_max_buffers: Option<u32>,

    /// Enable recording, optionally giving the output path
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    record_video: Option<Option<PathBuf>>,

    /// Recording mode (standard|sequential|fragmented)
    #[arg(long, value_name = "MODE", value_parser = parse_record_mode)]
    record_mode: Option<RecordMode>,

    /// Disable recording
    #[arg(long)]
    no_record_video: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_payload_type(value: &str) -> Result<PayloadTypeFilter, String> {
    value.parse().map_err(|e: vidlink::AppError| e.to_string())
}

fn parse_record_mode(value: &str) -> Result<RecordMode, String> {
    value.parse().map_err(|e: vidlink::AppError| e.to_string())
}

impl CliArgs {
    /// Apply command line overrides on top of the resolved configuration
    fn apply(&self, cfg: &mut AppConfig) {
        if let Some(card) = &self.card {
            cfg.card_path = card.clone();
        }
        if let Some(connector) = &self.connector {
            cfg.connector = connector.clone();
        }
        if let Some(plane_id) = self.plane_id {
            cfg.plane_id = plane_id;
        }
        if let Some(port) = self.udp_port {
            cfg.udp_port = port;
        }
        if let Some(pt) = self.vid_pt {
            cfg.video_payload_type = pt;
        }
        if let Some(max_buffers) = self.appsink_max_buffers {
            cfg.appsink_max_buffers = max_buffers;
        }
        if let Some(record) = &self.record_video {
            cfg.record.enable = true;
            if let Some(path) = record {
                cfg.record.output_path = path.clone();
            }
        }
        if let Some(mode) = self.record_mode {
            cfg.record.mode = mode;
        }
        if self.no_record_video {
            cfg.record.enable = false;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting vidlink v{}", env!("CARGO_PKG_VERSION"));

    let mut cfg = match &args.config {
        Some(path) => load_config_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load config file: {e}"))?,
        None => AppConfig::default(),
    };
    args.apply(&mut cfg);

    let _instance = InstanceGuard::acquire(DEFAULT_PID_PATH)
        .map_err(|e| anyhow::anyhow!("single-instance check failed: {e}"))?;

    let flags = Arc::new(ControlFlags::default());
    let watcher = SignalWatcher::spawn(flags.clone())
        .map_err(|e| anyhow::anyhow!("failed to start signal watcher: {e}"))?;

    let card = match OpenOptions::new().read(true).write(true).open(&cfg.card_path) {
        Ok(card) => card,
        Err(e) => {
            tracing::error!("open {}: {e}", cfg.card_path.display());
            watcher.shutdown();
            anyhow::bail!("failed to open DRM device {}", cfg.card_path.display());
        }
    };

    let display = HeadlessDisplay::new();
    let target = match display.configure(card.as_raw_fd(), &cfg) {
        Ok(target) => target,
        Err(e) => {
            tracing::error!("Failed to configure display output: {e}");
            watcher.shutdown();
            anyhow::bail!("display configuration failed");
        }
    };

    let pipeline = Arc::new(Pipeline::new(
        Arc::new(LoopbackGraphBuilder::new()),
        Arc::new(NullDecoderFactory::new()),
        Arc::new(RawRecorderFactory::new()),
    ));

    if let Err(e) = pipeline.start(&cfg, &target, card.as_raw_fd()) {
        tracing::error!("Pipeline start failed: {e}");
        watcher.shutdown();
        anyhow::bail!("pipeline start failed");
    }

    if cfg.record.enable {
        if let Err(e) = pipeline.enable_recording(&cfg.record) {
            tracing::warn!("Failed to start recorder; continuing without recording: {e}");
        }
    }

    let supervisor = Supervisor::new(pipeline, flags, target, card.as_raw_fd());
    supervisor.run(&mut cfg);
    supervisor.shutdown();

    watcher.shutdown();
    tracing::info!("Bye.");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides the log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "vidlink=error",
        LogLevel::Warn => "vidlink=warn",
        LogLevel::Info => "vidlink=info",
        LogLevel::Debug => "vidlink=debug",
        LogLevel::Trace => "vidlink=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}
