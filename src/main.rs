use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use trailcam::{TrailcamConfig, TrailcamOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "trailcam")]
#[command(about = "Motion-activated trail camera with photo, video, and timelapse capture")]
#[command(version)]
#[command(long_about = "A motion-activated camera system that watches a low-resolution \
detection stream, captures full-resolution photos or buffered video once movement is \
confirmed, and persists the artifacts with thumbnails. Designed for headless operation \
on small Linux boards with V4L2 cameras.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "trailcam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the system")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Write logs to rotated files in addition to stdout
    #[arg(long, value_name = "DIR", help = "Also write logs to daily rotated files in this directory")]
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config();
        return Ok(());
    }

    // Initialize logging; the guard keeps the file writer alive
    let _log_guard = init_logging(&args)?;

    info!("Starting trailcam system v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    // Load and validate configuration
    let config = match TrailcamConfig::load_from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from: {}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if args.validate_config {
        info!("Configuration validation successful");
        println!("✓ Configuration is valid");
        return Ok(());
    }

    // Create the orchestrator and start all components
    let mut orchestrator = TrailcamOrchestrator::new(config, PathBuf::from(&args.config));

    orchestrator.start().await.map_err(|e| {
        error!("Failed to start system: {}", e);
        e
    })?;

    // Run the main application loop with signal handling
    let exit_code = orchestrator.run().await.map_err(|e| {
        error!("System error during execution: {}", e);
        e
    })?;

    info!("Trailcam system exited with code: {}", exit_code);

    // Flush the file writer before the process ends
    drop(_log_guard);

    // Exit with appropriate code for systemd
    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    // Create environment filter
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("trailcam={}", log_level)));

    // Configure format based on options
    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let registry = tracing_subscriber::registry().with(fmt_layer).with(env_filter);

    // Attach a rotated file writer when a log directory was given
    match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "trailcam.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Trailcam Configuration File");
    println!("# This is the default configuration with all available options");
    println!();

    let default_config = r#"[camera]
# Camera device index (e.g., 0 for /dev/video0)
index = 0
# Full capture resolution (width, height)
resolution = [1640, 1232]
# Frames per second for the detection stream
fps = 30
# Width of the downscaled motion-detection frame
md_width = 320
# Rotate the image by half a turn
rotate = false
# Exposure mode: "auto" or "off" (manual)
exposure_mode = "auto"
# ISO sensitivity for manual exposure (0 = automatic)
iso = 0
# Shutter speed in microseconds for manual exposure (0 = default)
shutter_speed = 0
# Seconds of video to keep from before a motion event
buffer_seconds_before = 5
# Seconds of video to record after a motion event
buffer_seconds_after = 10

[detection]
# Per-pixel difference needed to count as changed
delta_threshold = 5
# Accepted bounding box size range in detection-frame pixels
min_width = 20
max_width = 200
min_height = 20
max_height = 200
# Minimum widths used by the "less" and "more" sensitivity presets
less_sensitivity = 50
more_sensitivity = 10
# Minimum seconds between consecutive captures
min_capture_interval_secs = 5

[session]
# Seconds between timelapse captures
timelapse_interval_secs = 30

[storage]
# Base directory for all persisted artifacts
data_path = "./data"
# Where photos and their thumbnails are written
photos_path = "./data/photos"
# Where videos and their thumbnails are written
videos_path = "./data/videos"
# Width of generated thumbnails
thumbnail_width = 320
"#;

    println!("{}", default_config);
}
