//! tiersync - host process for the layered agent state-sync core
//!
//! Usage:
//!   tiersync run --config tiersync.toml
//!   tiersync agents --layer administrative
//!   tiersync states
//!   tiersync dump-config

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tiersync_core::Layer;
use tiersync_engine::{default_roster, Hub, RecvError, TiersyncConfig};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer as _};

#[derive(Parser)]
#[command(name = "tiersync", about = "Layered agent registry, message router and state sync")]
struct Cli {
    /// Path to config file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "tiersync.toml")]
    config: PathBuf,

    /// Also write logs to daily-rotated files in this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub until interrupted (default).
    Run,
    /// List the agent roster.
    Agents {
        #[arg(long, value_enum)]
        layer: Option<LayerArg>,
    },
    /// Print every agent state after loading persisted snapshots.
    States,
    /// Print the default config as TOML.
    DumpConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum LayerArg {
    Executive,
    Administrative,
    Productive,
}

impl From<LayerArg> for Layer {
    fn from(arg: LayerArg) -> Self {
        match arg {
            LayerArg::Executive => Layer::Executive,
            LayerArg::Administrative => Layer::Administrative,
            LayerArg::Productive => Layer::Productive,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_ref(), cli.json_logs);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(TiersyncConfig::load(&cli.config)).await,
        Command::Agents { layer } => {
            let layer: Option<Layer> = layer.map(Into::into);
            for agent in default_roster()
                .into_iter()
                .filter(|a| layer.map_or(true, |l| a.layer == l))
            {
                println!(
                    "{:<14} {:<15} {:<14} {}",
                    agent.id.as_str(),
                    agent.layer.as_str(),
                    agent.name,
                    agent.role
                );
            }
            Ok(())
        }
        Command::States => {
            let hub = Hub::builder(TiersyncConfig::load(&cli.config)).build().await?;
            let states = hub.get_all_states().await;
            println!("{}", serde_json::to_string_pretty(&states)?);
            Ok(())
        }
        Command::DumpConfig => {
            println!("{}", dump_config());
            Ok(())
        }
    }
}

fn dump_config() -> String {
    TiersyncConfig::default().to_toml()
}

async fn run(config: TiersyncConfig) -> anyhow::Result<()> {
    let hub = Arc::new(Hub::builder(config).build().await?);
    for (layer, stats) in hub.layer_stats() {
        info!(
            "{:<14} {} agents ({} active, {} busy)",
            layer.as_str(),
            stats.total,
            stats.active,
            stats.busy
        );
    }

    let mut events = hub.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => debug!(target: "tiersync::events", "{}", line),
                    Err(e) => warn!("Unserializable event {}: {}", event.kind(), e),
                },
                Err(RecvError::Lagged(_)) | Err(RecvError::Empty) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    hub.start().await;
    info!("tiersync running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    hub.shutdown().await;
    let stats = hub.get_stats().await;
    info!(
        "Syncs: {} total, {} ok, {} failed, {} conflicts resolved, {} persistence errors",
        stats.total_syncs,
        stats.successful_syncs,
        stats.failed_syncs,
        stats.conflicts_resolved,
        stats.persistence_errors
    );
    event_log.abort();
    Ok(())
}

/// Console logging, plus a non-blocking daily file when `log_dir` is set.
/// The returned guard must live until exit so buffered lines get flushed.
fn init_tracing(
    log_dir: Option<&PathBuf>,
    json: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tiersync=info,tiersync_engine=info".into());

    let console = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tiersync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    guard
}
