//! fgsim - headless driver for Barnes-Hut ForceAtlas2 layouts.
//!
//! Runs a graph (from a JSON file or generated) for a number of ticks on the
//! GPU or the host device, prints work sizes, and manages settings.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::config as config_cmd;
use commands::run::{GraphSource, RunArgs};
use config::{Backend, Config};

/// fgsim - lay out graphs with GPU Barnes-Hut ForceAtlas2.
#[derive(Parser, Debug)]
#[command(
    name = "fgsim",
    author,
    version,
    about = "fgsim: Barnes-Hut ForceAtlas2 graph layout",
    long_about = None
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Lay out a graph for a number of ticks.
    ///
    /// Reads `{"points": [[x, y], ..], "edges": [[s, t], ..]}` from `--graph`,
    /// or generates a seeded random graph.
    Run {
        /// Graph file (JSON).
        #[arg(short, long, conflicts_with_all = ["points", "edges"])]
        graph: Option<PathBuf>,

        /// Points of the generated graph.
        #[arg(long, default_value_t = 1000)]
        points: u32,

        /// Edges of the generated graph.
        #[arg(long, default_value_t = 2000)]
        edges: u32,

        /// Seed of the generated graph.
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Ticks to run (defaults to the configured count).
        #[arg(short, long)]
        ticks: Option<u32>,

        /// Compute backend (defaults to the configured backend).
        #[arg(short, long, value_enum)]
        backend: Option<Backend>,

        /// Write final positions, state and buffer versions as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show tree capacities and dispatch geometry for a point count.
    Sizes {
        /// Number of points.
        points: u32,

        /// Device warp size (defaults to the configured one, then 32).
        #[arg(short, long)]
        warp_size: Option<u32>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration.
    Show,

    /// Set a configuration value.
    Set {
        /// Configuration key.
        key: String,
        /// Configuration value.
        value: String,
    },

    /// Get a configuration value.
    Get {
        /// Configuration key.
        key: String,
    },

    /// Reset configuration to defaults.
    Reset,

    /// Show path to config file.
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing based on verbosity; RUST_LOG wins when set
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;

    match cli.command {
        Commands::Run {
            graph,
            points,
            edges,
            seed,
            ticks,
            backend,
            output,
        } => {
            let source = match graph {
                Some(path) => GraphSource::File(path),
                None => GraphSource::Random {
                    points,
                    edges,
                    seed,
                },
            };
            let args = RunArgs {
                source,
                ticks: ticks.unwrap_or(config.ticks),
                backend: backend.unwrap_or(config.backend),
                output,
            };
            commands::run::execute(&config, args).await?;
        }

        Commands::Sizes {
            points,
            warp_size,
            json,
        } => {
            commands::sizes::execute(&config, points, warp_size, json)?;
        }

        Commands::Config(config_cmd_inner) => {
            let mut config = config;
            match config_cmd_inner {
                ConfigCommands::Show => config_cmd::show(&config)?,
                ConfigCommands::Set { key, value } => config_cmd::set(&mut config, &key, &value)?,
                ConfigCommands::Get { key } => config_cmd::get(&config, &key)?,
                ConfigCommands::Reset => config_cmd::reset()?,
                ConfigCommands::Path => config_cmd::path()?,
            }
        }
    }

    Ok(())
}
