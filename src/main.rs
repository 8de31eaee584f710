// fmrelay - unattended internet radio to FM/RDS rebroadcaster
// `run` keeps the selected station on air until told to stop; `stations`
// edits the catalog while the service is down

use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use fmrelay::config::Config;
use fmrelay::logging::init_logging;
use fmrelay::metadata::{FifoSink, MetadataProvider, MetadataSynchronizer, NoMetadata};
use fmrelay::{BroadcastController, PipelineSettings, PipelineSupervisor, Station, StationRegistry};

#[derive(Parser)]
#[command(name = "fmrelay")]
#[command(about = "Rebroadcast an internet radio stream over FM with live RDS text")]
struct Args {
    /// Enable developer logging (stderr + debug output)
    #[arg(long)]
    dev: bool,

    /// Config file to use instead of the one in the user config dir
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Put the selected station on air and keep it there
    Run,
    /// Inspect or edit the station catalog (stop the service first)
    #[command(subcommand)]
    Stations(StationCommand),
}

#[derive(Subcommand)]
enum StationCommand {
    /// Show every station, marking the selected one
    List,
    /// Add a station, or replace the one with the same id
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        /// FM frequency in MHz for this station only
        #[arg(long)]
        freq: Option<f64>,
    },
    /// Remove a station (the default station stays)
    Remove { id: String },
    /// Choose the station to put on air at the next start
    Select { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match args.command {
        Commands::Run => {
            let _guard = init_logging(&config.log_dir, args.dev)?;
            run(config).await
        }
        Commands::Stations(command) => stations(&config, command),
    }
}

async fn run(config: Config) -> Result<()> {
    info!("fmrelay {} starting up", env!("CARGO_PKG_VERSION"));
    preflight(&config)?;

    let supervisor = PipelineSupervisor::spawn(PipelineSettings::from_config(&config));
    let sink = FifoSink::new(&config.broadcast.control_fifo);
    info!("RDS text goes to {}", sink.path().display());
    let metadata = MetadataSynchronizer::new(
        supervisor.watch_state(),
        Box::new(sink),
        metadata_provider(&config),
        &config.metadata,
    )
    .spawn();

    let mut now_playing = metadata.subscribe();
    tokio::spawn(async move {
        while now_playing.changed().await.is_ok() {
            let snapshot = now_playing.borrow_and_update().clone();
            if let Some(snapshot) = snapshot {
                let station = snapshot.station_name;
                match (snapshot.track_artist, snapshot.track_title) {
                    (Some(artist), Some(title)) => info!("Now playing on {}: {} - {}", station, artist, title),
                    (None, Some(title)) => info!("Now playing on {}: {}", station, title),
                    _ => debug!("No track info from {}", station),
                }
            }
        }
    });

    let controller = BroadcastController::on_startup(&config.state_file, supervisor, metadata).await;

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                debug!(target: "fmrelay::events", "{}", json);
            }
        }
    });

    wait_for_shutdown().await?;

    info!("Shutting down");
    match controller.stop_broadcast().await {
        Ok(_) => info!("Broadcast stopped cleanly"),
        Err(e) => warn!("Broadcast did not stop cleanly: {}", e),
    }
    Ok(())
}

#[cfg(feature = "icy")]
fn metadata_provider(config: &Config) -> Arc<dyn MetadataProvider> {
    if !config.metadata.icy_enabled {
        return Arc::new(NoMetadata);
    }
    match fmrelay::metadata::icy::IcyProvider::new(&config.metadata.user_agent) {
        Ok(provider) => Arc::new(provider),
        Err(e) => {
            warn!("ICY metadata unavailable: {}", e);
            Arc::new(NoMetadata)
        }
    }
}

#[cfg(not(feature = "icy"))]
fn metadata_provider(config: &Config) -> Arc<dyn MetadataProvider> {
    if config.metadata.icy_enabled {
        info!("Built without ICY support, RDS text will show the station name");
    }
    Arc::new(NoMetadata)
}

/// Every stage program has to be runnable before we touch the transmitter
fn preflight(config: &Config) -> Result<()> {
    let missing: Vec<&str> = [&config.stages.fetch, &config.stages.decode, &config.stages.broadcast]
        .into_iter()
        .map(|stage| stage.program.as_str())
        .filter(|program| find_executable(program).is_none())
        .collect();

    if !missing.is_empty() {
        bail!("required programs not found on PATH: {}", missing.join(", "));
    }
    debug!("Preflight ok");
    Ok(())
}

fn find_executable(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }

    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for Ctrl-C")?,
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

fn stations(config: &Config, command: StationCommand) -> Result<()> {
    let mut registry = StationRegistry::load(&config.state_file)
        .with_context(|| format!("loading {}", config.state_file.display()))?;

    match command {
        StationCommand::List => {
            let selected = registry.selected().id.clone();
            for station in registry.list() {
                let marker = if station.id == selected { "*" } else { " " };
                let freq = station
                    .frequency_override
                    .map(|f| format!("{:.1} MHz", f))
                    .unwrap_or_else(|| "default".to_string());
                println!("{} {:<16} {:<24} {:<10} {}", marker, station.id, station.name, freq, station.source_url);
            }
        }
        StationCommand::Add { id, name, url, freq } => {
            let mut station = Station::new(id, name, url);
            station.frequency_override = freq;
            registry.upsert(station.clone())?;
            println!("Saved '{}' to {}", station.id.trim(), registry.path().display());
        }
        StationCommand::Remove { id } => {
            let removed = registry.remove(&id)?;
            println!("Removed '{}' ({}) from {}", removed.id, removed.name, registry.path().display());
        }
        StationCommand::Select { id } => {
            let station = registry.select(&id)?;
            println!("'{}' will be on air at the next start", station.name);
        }
    }
    Ok(())
}
