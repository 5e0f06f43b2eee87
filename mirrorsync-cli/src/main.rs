use anyhow::{bail, Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use mirrorsync_core::core_ledger::{SqlLedger, SyncLedger};
use mirrorsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use mirrorsync_core::metrics::init_metrics;
use mirrorsync_core::shutdown::{install_signal_handlers, ShutdownCoordinator};
use mirrorsync_core::{MirrorConfig, MirrorEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mirrorsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Mirror a workspace until interrupted
    Run {
        #[command(flatten)]
        source: ConfigSource,

        /// Peer to dial (`host:port`)
        #[arg(long)]
        remote: Option<String>,

        /// Address to accept peers on
        #[arg(long)]
        listen: Option<String>,

        /// Start even if the remote cannot be reached
        #[arg(long)]
        offline: bool,
    },
    /// Write a default configuration file
    InitConfig {
        /// Destination file
        path: String,

        /// Workspace the configuration mirrors
        #[arg(long)]
        root: String,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the ledger of a workspace as JSON
    Ledger {
        #[command(flatten)]
        source: ConfigSource,

        /// Show the newest N rows instead of the current record per path
        #[arg(long)]
        history: Option<usize>,
    },
}

#[derive(clap::Args, Debug)]
struct ConfigSource {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Workspace root; overrides the configuration file
    #[arg(long)]
    root: Option<String>,
}

impl ConfigSource {
    fn load(&self) -> Result<MirrorConfig> {
        let config = match &self.config {
            Some(path) => MirrorConfig::from_file(expand(path))
                .with_context(|| format!("Failed to load configuration from {}", path))?,
            None => MirrorConfig::default(),
        };
        let mut config = config.with_env_overrides()?;
        if let Some(root) = &self.root {
            config.workspace_root = expand(root);
        }
        Ok(config)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            source,
            remote,
            listen,
            offline,
        } => {
            let mut config = source.load()?;
            if remote.is_some() {
                config.remote_endpoint = remote;
            }
            if let Some(listen) = listen {
                config.listen_address = listen;
            }
            config.offline_mode |= offline;
            config.validate()?;

            setup_logging(&config, args.log_level.as_deref(), args.json_logs)?;
            run(config).await
        }
        Command::InitConfig { path, root, force } => {
            let path = expand(&path);
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            let config = MirrorConfig::new(expand(&root));
            config.save_to_file(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Command::Ledger { source, history } => {
            let config = source.load()?;
            if config.workspace_root.as_os_str().is_empty() && config.ledger_path.is_none() {
                bail!("Either --root, --config or MIRRORSYNC_WORKSPACE_ROOT is required");
            }
            let ledger_path = config.ledger_path();
            if !ledger_path.exists() {
                bail!("No ledger at {}", ledger_path.display());
            }

            let records = tokio::task::spawn_blocking(move || {
                let ledger = SqlLedger::open(&ledger_path)?;
                match history {
                    Some(limit) => ledger.history(limit),
                    None => ledger.all_current(),
                }
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
    }
}

fn setup_logging(config: &MirrorConfig, level: Option<&str>, json: bool) -> Result<()> {
    let mut log_config = LogConfig::try_from(&config.logging)?;
    if let Some(level) = level {
        let fallback = log_config.level;
        log_config.level = level.parse::<LogLevel>().unwrap_or_else(|e| {
            eprintln!("{}, using '{}'", e, fallback);
            fallback
        });
    }
    if json {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    Ok(())
}

async fn run(config: MirrorConfig) -> Result<()> {
    if config.metrics.enabled {
        PrometheusBuilder::new()
            .with_http_listener(config.metrics.bind_address)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(address = %config.metrics.bind_address, "Prometheus exporter listening");
    }
    init_metrics();

    let engine = MirrorEngine::new(config)?;
    info!(
        session = engine.session_id(),
        root = %engine.config().workspace_root.display(),
        "MirrorSync starting"
    );
    engine.start().await?;
    if let Some(addr) = engine.local_addr().await {
        info!(%addr, "Accepting peers");
    }

    let coordinator = Arc::new(ShutdownCoordinator::new());
    install_signal_handlers(coordinator.clone());

    let mut report = tokio::time::interval(Duration::from_secs(60));
    report.tick().await;
    loop {
        tokio::select! {
            _ = coordinator.wait_for_shutdown() => break,
            _ = report.tick() => {
                let status = engine.status().await;
                debug!(
                    state = %status.state,
                    health = ?status.health,
                    connections = status.active_connections,
                    pending_conflicts = status.pending_conflicts,
                    "Engine status"
                );
                if status.pending_conflicts > 0 {
                    warn!(count = status.pending_conflicts, "Conflicts waiting for resolution");
                }
            }
        }
    }

    engine.stop().await?;
    coordinator.complete().await;
    info!("MirrorSync finished");
    Ok(())
}
