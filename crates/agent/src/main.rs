mod delegate;
mod output;
mod tickets;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keystone_core::{
    load_config, validate_config, Config, ConfigError, HttpFetcherFactory, JsonServerFactory,
    Keystone, KeystoneBroker, KeystoneConfig, KeystoneStats, SqliteTicketStore, TaskCommandRunner,
    TicketStore,
};

use delegate::{AgentDelegate, AgentMode};
use output::{print_json, render_report};
use tickets::TicketsSubcommand;

#[derive(Parser)]
#[command(name = "ksagent", about = "Check for and install product updates", version)]
struct Cli {
    /// Configuration file (default: built-in defaults)
    #[arg(long, global = true, env = "KEYSTONE_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Dump statistics in Prometheus text format after the run
    #[arg(long, global = true)]
    stats: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available updates without installing anything
    Check {
        /// Only check this product
        #[arg(long)]
        product: Option<String>,
    },

    /// Install available updates
    Update {
        /// Only update this product
        #[arg(long)]
        product: Option<String>,
    },

    /// Manage tickets
    Tickets {
        #[command(subcommand)]
        subcommand: TicketsSubcommand,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = read_config(cli.config.as_deref())?;
    validate_config(&config).context("Configuration validation failed")?;

    let store_path = config.ticket_store_path();
    let store: Arc<dyn TicketStore> = Arc::new(
        SqliteTicketStore::new(&store_path)
            .with_context(|| format!("Failed to open ticket store {:?}", store_path))?,
    );

    match cli.command {
        Commands::Tickets { subcommand } => {
            tickets::run(store.as_ref(), subcommand, cli.json).await
        }
        Commands::Check { product } => {
            update(&config, store, AgentMode::List, product, cli.json, cli.stats).await
        }
        Commands::Update { product } => {
            update(&config, store, AgentMode::Install, product, cli.json, cli.stats).await
        }
    }
}

fn read_config(path: Option<&std::path::Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    match load_config(path) {
        Ok(config) => {
            info!("Loaded configuration from {:?}", path);
            Ok(config)
        }
        Err(ConfigError::FileNotFound(_)) => {
            warn!("Configuration file {:?} not found, using defaults", path);
            Ok(Config::default())
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to load config from {:?}", path))),
    }
}

async fn update(
    config: &Config,
    store: Arc<dyn TicketStore>,
    mode: AgentMode,
    product: Option<String>,
    json: bool,
    dump_stats: bool,
) -> Result<()> {
    let fetchers =
        HttpFetcherFactory::new(&config.http).context("Failed to create HTTP client")?;
    let delegate = Arc::new(AgentDelegate::new(mode, Arc::new(TaskCommandRunner::new())));

    let keystone = Keystone::new(
        KeystoneConfig::from(config),
        store,
        delegate.clone(),
        Arc::new(fetchers),
        Arc::new(JsonServerFactory),
    );
    let mut params = config.params.clone();
    if params.os_version.is_none() {
        params.os_version = Some(std::env::consts::OS.to_string());
    }
    keystone.set_params(params);

    let stats = if dump_stats {
        let stats = Arc::new(
            KeystoneStats::new().map_err(|e| anyhow::anyhow!("Failed to create statistics: {}", e))?,
        );
        keystone.set_stats(Some(stats.clone()));
        Some(stats)
    } else {
        None
    };

    let broker = KeystoneBroker::new(Arc::new(keystone));
    let Some(keystone) = broker.claim_keystone() else {
        bail!("Keystone is busy");
    };

    match &product {
        Some(product_id) => keystone.update_product_with_product_id(product_id)?,
        None => keystone.update_all_products()?,
    }

    let report = tokio::select! {
        report = delegate.wait_for_report() => report,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, stopping update run");
            broker.force_unlock();
            bail!("Interrupted");
        }
    };
    broker
        .return_keystone(&keystone)
        .context("Failed to release keystone")?;

    if json {
        print_json(&report)?;
    } else {
        println!("{}", render_report(&report));
    }
    if let Some(stats) = stats {
        print!("{}", stats.encode_text());
    }

    if report.success == Some(false) {
        bail!("Could not reach any update server");
    }
    let failed = report.failed_installs();
    if failed > 0 {
        bail!("{} update(s) failed to install", failed);
    }
    Ok(())
}
