//! Folio CLI
//!
//! Operator interface for a Folio store: status, chapter listing,
//! session export/import and maintenance.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use folio_core::{Config, Store};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Folio - versioned chapter and translation store")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store location, schema version and row counts
    Status,
    /// List chapters with their translation state
    #[command(alias = "ls")]
    Chapters {
        /// Rebuild the summary projection before listing
        #[arg(long)]
        rebuild: bool,
    },
    /// Show translation versions for a chapter URL
    Versions {
        /// Chapter URL (any known variant)
        url: String,
    },
    /// Export the whole store as a session document
    Export {
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Leave chapters and translations out
        #[arg(long)]
        no_chapters: bool,
        /// Leave cached images out
        #[arg(long)]
        no_images: bool,
    },
    /// Import a session document
    Import {
        /// Session JSON file
        file: PathBuf,
    },
    /// Derive missing stable IDs and rewrite URL mappings
    Backfill {
        /// Run even if the current backfill already completed
        #[arg(long)]
        force: bool,
    },
    /// Delete all data (keeps the schema)
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, import_batch_size, busy_timeout_ms, log_file)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.clone();

    // Config commands don't need the store
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => {
                commands::config::show(config_path.as_ref(), &output)
            }
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path.as_ref(), &output)
            }
        };
    }

    let config = load_config(config_path.as_ref())?;
    init_logging(&config);
    debug!(database = %config.sqlite_path().display(), "Opening store");

    let store = Store::open_with_config(config)
        .await
        .context("Failed to open store")?;

    match cli.command {
        Commands::Status => commands::status::show(&store, &output).await,
        Commands::Chapters { rebuild } => commands::chapters::list(&store, rebuild, &output).await,
        Commands::Versions { url } => commands::chapters::versions(&store, &url, &output).await,
        Commands::Export {
            output: path,
            no_chapters,
            no_images,
        } => commands::session::export(&store, path, !no_chapters, !no_images, &output).await,
        Commands::Import { file } => commands::session::import(&store, &file, &output).await,
        Commands::Backfill { force } => commands::maintenance::backfill(&store, force, &output).await,
        Commands::Clear { yes } => commands::maintenance::clear(&store, yes, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

/// Initialize logging
///
/// Only initializes if FOLIO_LOG is set. Logs go to `log_file` when
/// configured, stderr otherwise.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("FOLIO_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!("folio_core={},folio_cli={}", log_level, log_level));

    match &config.log_file {
        Some(log_path) => {
            let log_file = match File::create(log_path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not create log file {:?}: {}", log_path, e);
                    return;
                }
            };
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(log_file)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}
