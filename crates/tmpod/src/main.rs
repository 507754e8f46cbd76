//! tmpod - Timeseries block pyramid logging daemon.
//!
//! Ingests metering counter readings from MQTT, stores them as a pyramid of
//! gzip JSON blocks on local flash, and serves back-fill requests from
//! remote subscribers.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use clap::Parser;
use tmpod::mqtt::MqttConfig;
use tmpod::{BlockStore, Daemon, Registry};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Timeseries block pyramid logging daemon.
#[derive(Parser)]
#[command(name = "tmpod", about = "Timeseries block pyramid logging daemon", version)]
struct Args {
    /// Data root directory for block storage.
    #[arg(short, long, default_value = "/var/lib/tmpo")]
    root: String,

    /// Sensor registry YAML file.
    #[arg(short, long, default_value = "/etc/tmpod/sensors.yaml")]
    config: String,

    /// MQTT broker host.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT broker port.
    #[arg(long, default_value = "1883")]
    port: u16,

    /// This daemon's 32-hex device id.
    #[arg(short, long)]
    device: String,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("tmpod={level}").parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> tmpod::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("tmpod {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: root={}, sensors={}, broker={}:{}",
        args.root, args.config, args.host, args.port
    );

    let registry = Registry::from_yaml_file(&args.config)?;
    info!("Registry loaded: {} sensors", registry.sensor_count());

    let store = BlockStore::new(&args.root);
    let report = store.startup_scrub();
    info!(
        "Startup scrub: {} corrupt, {} already-compacted files removed",
        report.corrupt_removed, report.compact_removed
    );

    let daemon = Daemon::new(registry, store);
    tmpod::mqtt::run(
        daemon,
        MqttConfig {
            host: args.host,
            port: args.port,
            device_id: args.device,
        },
    )
    .await?;

    info!("Shutdown complete");
    Ok(())
}
