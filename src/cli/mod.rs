pub mod commands;

use clap::{Parser, Subcommand};
use crate::error::Result;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "repost-guard")]
#[command(about = "Reposts new feed items while keeping paid-content promoters out")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, env = "REPOST_GUARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Collection to watch
        #[arg(long)]
        collection: Option<String>,

        /// Collection to cross-post into
        #[arg(long)]
        destination: Option<String>,

        /// Overwrite an existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Start the repost worker
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Show configuration and store sizes
    Status,

    /// Drop expired processed markers
    Prune,

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config_file = commands::get_config_file(self.config)?;
        let _log_guard = commands::init_logging(self.debug, self.verbose, &config_file)?;

        match self.command {
            Commands::Init { collection, destination, force } => {
                commands::init(&config_file, collection, destination, force).await
            }
            Commands::Run { once } => {
                commands::run(&config_file, once).await
            }
            Commands::Status => {
                commands::status(&config_file).await
            }
            Commands::Prune => {
                commands::prune(&config_file).await
            }
            Commands::Completions { shell } => {
                commands::generate_completions(shell);
                Ok(())
            }
        }
    }
}
