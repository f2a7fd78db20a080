//! CAN Filesystem Mirror CLI Application
//!
//! Command-line front end of the can-mirror library. It adds:
//! - Argument parsing and an optional TOML configuration file
//! - Platform default channel/driver selection
//! - Logging setup
//! - Interrupt handling (Ctrl+C, SIGTERM) with orderly shutdown

use anyhow::{bail, Context, Result};
use can_mirror::{transport, Bridge, Catalog, UnknownIdPolicy};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;

use config::AppConfig;

/// CAN Mirror - Edit live CAN traffic as JSON files
#[derive(Parser, Debug)]
#[command(name = "can-mirror")]
#[command(about = "Mirror CAN messages to JSON files and send edited files back", long_about = None)]
#[command(version)]
struct Args {
    /// Name of the CAN channel (default: platform specific)
    #[arg(short, long)]
    channel: Option<String>,

    /// CAN driver: socketcan or virtual (default: platform specific)
    #[arg(short, long)]
    driver: Option<String>,

    /// Path to a DBC file or a folder of DBC files (can be repeated)
    #[arg(long = "database", visible_alias = "db", value_name = "PATH")]
    databases: Vec<PathBuf>,

    /// Name files after substituted identifiers, as MATCH:REPLACEMENT hex patterns
    #[arg(short, long, value_name = "PATTERN")]
    substitute: Option<String>,

    /// Keep a history of received values in each file
    #[arg(short, long)]
    accumulate: bool,

    /// Only record signals that changed
    #[arg(long)]
    diff: bool,

    /// Working directory (default: a new temporary directory)
    #[arg(short, long, value_name = "DIR")]
    output_folder: Option<PathBuf>,

    /// Keep the working directory on exit
    #[arg(short, long)]
    preserve_files: bool,

    /// Add a $timestamp field to every record
    #[arg(short, long)]
    timestamps: bool,

    /// Use absolute timestamps instead of time since first reception
    #[arg(long)]
    absolute_time: bool,

    /// Add $id and $data fields with the raw frame
    #[arg(short, long)]
    raw_data: bool,

    /// Never write this message on reception, by name or ID (can be repeated)
    #[arg(long, value_name = "MESSAGE")]
    disable_rx: Vec<String>,

    /// Handling of frames not in the databases
    #[arg(long, value_enum)]
    unknown_ids: Option<UnknownIds>,

    /// Only mirror received IDs matching this pattern (1234, *123, 123* or MASK,VALUE)
    #[arg(short, long, value_name = "PATTERN")]
    filter: Option<String>,

    /// Send edits with extended (true) or standard (false) IDs, overriding the databases
    #[arg(long, value_name = "BOOL")]
    force_extended_id: Option<bool>,

    /// Path to configuration file (config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum UnknownIds {
    Ignore,
    Log,
}

impl From<UnknownIds> for UnknownIdPolicy {
    fn from(value: UnknownIds) -> Self {
        match value {
            UnknownIds::Ignore => UnknownIdPolicy::Ignore,
            UnknownIds::Log => UnknownIdPolicy::Log,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::info!("CAN Mirror CLI v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using mirror library v{}", can_mirror::VERSION);

    let base = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };
    let settings = merge_args(base, &args)?;
    run(settings)
}

/// Command-line values override the configuration file
fn merge_args(mut settings: AppConfig, args: &Args) -> Result<AppConfig> {
    if args.channel.is_some() {
        settings.bus.channel = args.channel.clone();
    }
    if args.driver.is_some() {
        settings.bus.driver = args.driver.clone();
    }
    settings.databases.extend(args.databases.iter().cloned());

    let mirror = &mut settings.mirror;
    if let Some(pattern) = &args.substitute {
        mirror.substitution = Some(pattern.clone());
    }
    mirror.accumulate |= args.accumulate;
    mirror.diff |= args.diff;
    mirror.timestamps |= args.timestamps;
    mirror.absolute_time |= args.absolute_time;
    mirror.raw_data |= args.raw_data;
    mirror.preserve_files |= args.preserve_files;
    if let Some(folder) = &args.output_folder {
        mirror.output_folder = Some(folder.clone());
    }
    mirror.disable_rx.extend(args.disable_rx.iter().cloned());
    if let Some(policy) = args.unknown_ids {
        mirror.unknown_ids = policy.into();
    }
    if args.force_extended_id.is_some() {
        mirror.force_extended_id = args.force_extended_id;
    }
    if let Some(filter) = &args.filter {
        mirror.rx_filter = Some(
            filter
                .parse()
                .with_context(|| format!("Invalid filter '{}'", filter))?,
        );
    }
    Ok(settings)
}

/// Start the bridge and block until interrupted
fn run(settings: AppConfig) -> Result<()> {
    if settings.databases.is_empty() {
        bail!("No database given, pass at least one --database");
    }
    let channel = match settings.bus.channel {
        Some(channel) => channel,
        None => transport::platform_default_channel()?.to_string(),
    };
    let driver = match settings.bus.driver {
        Some(driver) => driver,
        None => transport::platform_default_driver()?.to_string(),
    };

    let catalog = Catalog::load_all(&settings.databases).context("Failed to load databases")?;
    let stats = catalog.stats();
    log::info!(
        "Loaded {} messages ({} signals) from {} database path(s)",
        stats.num_messages,
        stats.num_signals,
        settings.databases.len()
    );

    let bus = transport::open(&channel, &driver)
        .with_context(|| format!("Failed to open {} with driver {}", channel, driver))?;
    let bridge = Bridge::new(settings.mirror, Arc::new(catalog), bus)
        .context("Failed to set up the working directory")?;
    let running = bridge.start().context("Failed to start the bridge")?;

    println!("Mirroring {} into {}", channel, running.workdir().display());
    println!("Edit a file to send its message, Ctrl+C to stop");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the signal handler")?;
    let stop = runtime.block_on(async {
        tokio::select! {
            _ = shutdown_signal() => Stop::Interrupted,
            _ = loops_exited(&running) => Stop::LoopExited,
        }
    });

    running.shutdown();
    stop.into_result()
}

/// Why the CLI stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Interrupted,
    LoopExited,
}

impl Stop {
    fn into_result(self) -> Result<()> {
        match self {
            Stop::Interrupted => {
                log::info!("Interrupted");
                Ok(())
            }
            Stop::LoopExited => bail!("A bridge loop stopped unexpectedly"),
        }
    }
}

async fn loops_exited(running: &can_mirror::RunningBridge) {
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    while running.is_running() {
        interval.tick().await;
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => log::warn!("Failed to install SIGTERM handler: {}", err),
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
