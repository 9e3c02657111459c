use beamline_info_bridge::beamline::{self, BeamlineSources};
use beamline_info_bridge::config::{self, Config};
use beamline_info_bridge::input::{SimulatedBeamline, run_beamline_simulation};
use beamline_info_bridge::notify::Scope;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Publish beamline information from machine control sources.
#[derive(Parser, Debug)]
#[command(name = "beamline-info-bridge", version)]
struct Args {
    /// JSON config file (defaults to the user config dir when present)
    #[arg(short, long, env = "BEAMLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the refresh period of proxied attributes
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Do not cycle the simulated sources; they keep their startup values
    #[arg(long)]
    no_simulation: bool,

    /// Seconds between simulated machine phases
    #[arg(long, default_value_t = 10)]
    simulation_period_secs: u64,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn load_config(args: &Args) -> beamline_info_bridge::Result<Config> {
    let path = args
        .config
        .clone()
        .or_else(|| Config::default_path().filter(|path| path.exists()));

    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Config::from_file(&path)?
        }
        None => Config::from_env(),
    };

    if let Some(interval_ms) = args.poll_interval_ms {
        config.poll.interval_ms = interval_ms;
    }
    Ok(config)
}

fn main() {
    // Environment must be settled before the runtime spawns worker threads
    config::load_dotenv();
    init_logger();
    let args = Args::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(run(args));
}

async fn run(args: Args) {
    info!("Starting beamline info bridge");

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded:");
    info!("  Device Name: {}", config.device_name);
    info!("  Poll Interval: {:?}", config.poll.interval());
    info!("  Subscriber Queue: {}", config.notify.queue_capacity);
    info!("  Beam Current Source: {}", config.sources.beam_current_attr);

    let sim = SimulatedBeamline::new(&config.sources);
    let sources: BeamlineSources = sim.sources();

    let node = match beamline::build(&config, sources) {
        Ok(builder) => builder.start(),
        Err(e) => {
            error!("Failed to build facade: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let sim_task = if args.no_simulation {
        None
    } else {
        Some(run_beamline_simulation(
            sim,
            Duration::from_secs(args.simulation_period_secs.max(1)),
            cancel.clone(),
        ))
    };

    // Log every published change
    let mut events = node.subscribe(Scope::All);
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let missed = events.missed();
            if missed > 0 {
                warn!("[Events] {} event(s) dropped", missed);
            }
            match &event.old {
                Some(old) => info!("[Events] {}: {} -> {}", event.attribute, old, event.new),
                None => info!("[Events] {}: {}", event.attribute, event.new),
            }
        }
    });

    info!("Beamline info bridge is running");
    info!("  - Attributes: {}", node.attribute_names().join(", "));
    info!("  - Press Ctrl+C to exit");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    cancel.cancel();
    if let Some(task) = sim_task
        && let Err(e) = task.await
    {
        warn!("Simulation task ended abnormally: {}", e);
    }
    node.shutdown().await;
    if let Err(e) = event_task.await {
        warn!("Event logger ended abnormally: {}", e);
    }

    info!("Beamline info bridge stopped");
}
