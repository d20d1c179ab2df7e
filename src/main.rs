use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livecam::config::{EncoderCodec, PipelineConfig, ThreadingMode};
use livecam::stream::{DeliveryBridge, NotifyTrigger, PullResult};
use livecam::video::format::{PixelFormat, Resolution};
use livecam::video::queue::DropPolicy;
use livecam::video::source::FrameSource;
use livecam::video::{PipelineController, PipelineState, TestPatternSource, V4l2Source};

/// Largest unit the consumer accepts; longer ones are truncated
const DELIVERY_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// livecam command line arguments
#[derive(Parser, Debug)]
#[command(name = "livecam")]
#[command(version, about = "Live camera capture and compression pipeline", long_about = None)]
struct CliArgs {
    /// TOML configuration file (flags override its values)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Video device path
    #[arg(short = 'd', long, value_name = "PATH")]
    device: Option<PathBuf>,

    /// Short name for this camera
    #[arg(long, value_name = "NAME")]
    alias: Option<String>,

    /// Capture width
    #[arg(long)]
    width: Option<u32>,

    /// Capture height
    #[arg(long)]
    height: Option<u32>,

    /// Capture frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Output frame rate (defaults to the capture rate)
    #[arg(long, value_name = "FPS")]
    output_fps: Option<u32>,

    /// Capture pixel format (yuyv, uyvy, nv12, yuv420p, rgb24, mjpeg, ...)
    #[arg(long, value_name = "FORMAT")]
    format: Option<PixelFormat>,

    /// Output size, WxH (defaults to the capture size)
    #[arg(long, value_name = "WxH")]
    output_size: Option<Resolution>,

    /// Output codec (jpeg, h264)
    #[arg(long, value_name = "CODEC")]
    codec: Option<EncoderCodec>,

    /// JPEG quality (1-100)
    #[arg(long)]
    quality: Option<u32>,

    /// H.264 target bitrate in kbps
    #[arg(long, value_name = "KBPS")]
    bitrate: Option<u32>,

    /// H.264 keyframe interval in frames
    #[arg(long, value_name = "FRAMES")]
    gop: Option<u32>,

    /// Output queue capacity
    #[arg(long, value_name = "UNITS")]
    queue_capacity: Option<usize>,

    /// Evict the oldest unit instead of dropping the newest when the queue is full
    #[arg(long)]
    drop_oldest: bool,

    /// Capture and encode on separate threads
    #[arg(long)]
    decoupled: bool,

    /// Use a synthetic colour-bar source instead of a device
    #[arg(long)]
    test_pattern: bool,

    /// Stop after delivering this many units
    #[arg(short = 'n', long, value_name = "N")]
    frames: Option<u64>,

    /// Write units to FILE, or `-` for stdout
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting livecam v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;
    let source: Box<dyn FrameSource> = if args.test_pattern {
        let mut source = TestPatternSource::new();
        if let Some(frames) = args.frames {
            source = source.with_frame_limit(frames);
        }
        Box::new(source)
    } else {
        Box::new(V4l2Source::new(&config.device))
    };

    let factory = config.encoder.codec.factory();
    tracing::info!("Encoding {} with {} encoder", config.alias, factory.name());
    let controller = PipelineController::new(config, source, factory)?;

    let trigger = NotifyTrigger::new();
    let bridge = Arc::new(DeliveryBridge::new(
        controller.output_queue(),
        Arc::new(trigger.clone()),
    ));
    controller.set_on_unit_available(bridge.unit_notifier());

    let mut sink = UnitSink::open(args.output.as_deref()).await?;

    controller.start()?;

    // Close the bridge once production ends so the consumer drains and exits
    let watcher = {
        let bridge = bridge.clone();
        let mut state = controller.state_watch();
        tokio::spawn(async move {
            let _ = state
                .wait_for(|s| matches!(s, PipelineState::Finished | PipelineState::Failed(_)))
                .await;
            bridge.close();
        })
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut buf = vec![0u8; DELIVERY_BUFFER_SIZE];
    let mut delivered = 0u64;
    loop {
        match bridge.retrieve_unit(&mut buf) {
            PullResult::Delivered(delivery) => {
                if delivery.truncated_bytes > 0 {
                    tracing::warn!(
                        "Unit {} truncated by {} bytes",
                        delivery.sequence,
                        delivery.truncated_bytes
                    );
                }
                sink.write(&buf[..delivery.bytes_written]).await?;
                delivered += 1;
                tracing::trace!(
                    "Delivered unit {} ({} bytes, {:?} after capture)",
                    delivery.sequence,
                    delivery.bytes_written,
                    delivery.capture_ts.elapsed()
                );
                if args.frames.is_some_and(|limit| delivered >= limit) {
                    bridge.cancel();
                    break;
                }
                continue;
            }
            PullResult::Pending if bridge.is_closed() => break,
            PullResult::Pending => {}
        }

        tokio::select! {
            _ = trigger.notified() => {}
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                bridge.cancel();
                break;
            }
        }
    }

    controller.stop();
    watcher.abort();
    sink.finish().await?;

    let stats = controller.stats();
    tracing::info!(
        "Delivered {} units: captured={} skipped={} encoded={} dropped={} conversion_errors={} encode_errors={}",
        delivered,
        stats.frames_captured,
        stats.frames_skipped,
        stats.frames_encoded,
        stats.units_dropped,
        stats.conversion_errors,
        stats.encode_errors
    );

    if let PipelineState::Failed(reason) = controller.state() {
        anyhow::bail!("pipeline failed: {}", reason);
    }
    Ok(())
}

/// Load the configuration file, if any, and apply flag overrides
fn build_config(args: &CliArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if args.test_pattern && args.device.is_none() {
        config.device = PathBuf::from("test-pattern");
    }
    if let Some(alias) = &args.alias {
        config.alias = alias.clone();
    }
    if let Some(width) = args.width {
        config.capture.width = width;
    }
    if let Some(height) = args.height {
        config.capture.height = height;
    }
    if let Some(fps) = args.fps {
        config.capture.fps = fps;
    }
    if let Some(format) = args.format {
        config.capture.format = format;
    }
    if let Some(size) = args.output_size {
        config.encoder.width = Some(size.width);
        config.encoder.height = Some(size.height);
    }
    if args.output_fps.is_some() {
        config.rate.output_fps = args.output_fps;
    }
    if let Some(codec) = args.codec {
        config.encoder.codec = codec;
    }
    if let Some(quality) = args.quality {
        config.encoder.quality = quality;
    }
    if let Some(bitrate) = args.bitrate {
        config.encoder.bitrate_kbps = bitrate;
    }
    if let Some(gop) = args.gop {
        config.encoder.gop_size = gop;
    }
    if let Some(capacity) = args.queue_capacity {
        config.queue.capacity = capacity;
    }
    if args.drop_oldest {
        config.queue.drop_policy = DropPolicy::DropOldest;
    }
    if args.decoupled {
        config.threading = ThreadingMode::Decoupled;
    }

    config.validate()?;
    Ok(config)
}

/// Where delivered units end up
enum UnitSink {
    File(tokio::fs::File),
    Stdout(tokio::io::Stdout),
    Discard,
}

impl UnitSink {
    async fn open(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        Ok(match path {
            None => Self::Discard,
            Some(p) if p.as_os_str() == "-" => Self::Stdout(tokio::io::stdout()),
            Some(p) => {
                let file = tokio::fs::File::create(p)
                    .await
                    .with_context(|| format!("failed to create {}", p.display()))?;
                tracing::info!("Writing units to {}", p.display());
                Self::File(file)
            }
        })
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::File(file) => file.write_all(data).await,
            Self::Stdout(out) => out.write_all(data).await,
            Self::Discard => Ok(()),
        }
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        match self {
            Self::File(file) => file.flush().await,
            Self::Stdout(out) => out.flush().await,
            Self::Discard => Ok(()),
        }
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "livecam=error",
        LogLevel::Warn => "livecam=warn",
        LogLevel::Info => "livecam=info",
        LogLevel::Verbose => "livecam=debug",
        LogLevel::Debug => "livecam=debug",
        LogLevel::Trace => "livecam=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    // Units may go to stdout, so logs go to stderr
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
