// ============================================================================
// ARCHSTATS CLI
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::info;

use archstats::config::{BridgeConfig, ENV_PREFIX};
use archstats::logging::init_logging;
use archstats::{ArchstatsResult, Bridge, BRIDGE_FULL_NAME, BRIDGE_NAME, BRIDGE_VERSION};

/// Archiver appliance statistics bridge
#[derive(Parser, Debug)]
#[command(
    name = "archstats",
    version,
    about = "Publishes archiver appliance management metrics as typed channels",
    long_about = "Polls the archiver appliance management API, publishes every metric as a \
                  typed channel and snapshots changes to a document store so the last known \
                  state survives restarts."
)]
struct Cli {
    /// Configuration file path; defaults plus environment when absent
    #[arg(short, long, default_value = "archstats.toml", env = "ARCHSTATS_CONFIG")]
    config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "ARCHSTATS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Channel name prefix override
    #[arg(short, long)]
    prefix: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge (default)
    Run,

    /// Validate the configuration
    Validate {
        /// Print the fully resolved configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print or write the default configuration
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

fn load_config(path: &Path) -> AnyhowResult<BridgeConfig> {
    if path.exists() {
        BridgeConfig::load(path).with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        BridgeConfig::from_env().context("Failed to build config from defaults and environment")
    }
}

fn handle_validate(path: &Path, verbose: bool) -> AnyhowResult<()> {
    let config = load_config(path)?;
    println!("Configuration is valid ({})", path.display());
    if verbose {
        println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
    }
    println!("  appliance:  {}", config.appliance.url);
    println!("  prefix:     {}", config.bridge.prefix);
    println!("  backend:    {} ({})", config.database.backend, config.database.url);
    println!("  namespace:  {}", config.database.namespace_template);
    println!("  poll:       {}s", config.bridge.poll_interval_secs);
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> ArchstatsResult<()> {
    let rendered = BridgeConfig::generate_default();
    match output {
        Some(path) => {
            fs::write(path, &rendered)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

fn handle_version() {
    println!("{} ({}) v{}", BRIDGE_FULL_NAME, BRIDGE_NAME, BRIDGE_VERSION);
    println!("  target: {} / {}", std::env::consts::ARCH, std::env::consts::OS);
    println!("  environment prefix: {}", ENV_PREFIX);
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        Some(Commands::Run) | None => {}
    }

    let mut config = load_config(&cli.config)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(prefix) = &cli.prefix {
        config.bridge.prefix = prefix.clone();
    }

    init_logging(&config.logging)?;
    info!(target: "archstats::main", config = %cli.config.display(), "{} v{}", BRIDGE_FULL_NAME, BRIDGE_VERSION);

    let bridge = Bridge::from_config(config)?;
    bridge.install_signal_handlers();
    bridge.run().await?;
    Ok(())
}
