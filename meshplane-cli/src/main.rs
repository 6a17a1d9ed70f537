use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshplane_core::config::Config;
use meshplane_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use meshplane_core::StoreEngine;
use std::path::PathBuf;
use tracing::{debug, info};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "meshplane")]
#[command(author, version, about = "Inspect and maintain meshplane account stores", long_about = None)]
struct Args {
    /// TOML configuration file; environment variables are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the store, overrides the configuration
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Store engine (jsonfile, sqlite), overrides the configuration
    #[arg(short, long)]
    engine: Option<StoreEngine>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print engine, installation ID and entity counts
    Inspect,

    /// Print one account as JSON
    ShowAccount {
        /// Account ID
        id: String,
    },

    /// Copy the store into another engine in the same directory
    Convert {
        /// Target engine
        #[arg(long)]
        to: StoreEngine,
    },

    /// Create an empty store
    Init {
        /// Installation ID to record
        #[arg(long)]
        installation_id: Option<String>,
    },
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::from_env()?,
    };

    if let Some(data_dir) = &args.data_dir {
        config.store.data_dir = data_dir.clone();
    }
    if args.engine.is_some() {
        config.store.engine = args.engine;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let mut log_config = config.logging.to_log_config()?;
    if let Some(level) = args.log_level {
        log_config = LogConfig {
            level,
            ..log_config
        };
    }
    init_logging_with_config(log_config.json_format(args.json_logs || config.logging.json_format))?;

    debug!("using data directory {}", config.store.data_dir.display());

    match args.command {
        Command::Inspect => {
            let summary = commands::inspect(&config.store)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::ShowAccount { id } => {
            println!("{}", commands::show_account(&config.store, &id)?);
        }
        Command::Convert { to } => {
            let converted = commands::convert(&config.store, to)?;
            println!("converted {} accounts to {}", converted, to);
            if to == StoreEngine::JsonFile {
                println!("set engine = \"jsonfile\" in the configuration, store.db takes precedence during detection");
            }
        }
        Command::Init { installation_id } => {
            let engine = commands::init(&config.store, installation_id.as_deref())?;
            info!("initialized {} store", engine);
            println!("initialized {} store in {}", engine, config.store.data_dir.display());
        }
    }

    Ok(())
}
