use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "telemetry-pipeline", version, about = "Async telemetry pipeline")]
pub struct Cli {
    /// Configuration file path (missing file means defaults + environment)
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    /// Emit the pipeline's own diagnostics as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a pipeline against a synthetic workload (default)
    Run {
        /// Workload duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,

        /// Log entries per second, per producer
        #[arg(short, long, default_value = "50")]
        rate: u64,

        /// Concurrent producer tasks
        #[arg(short, long, default_value = "4")]
        producers: usize,

        /// Disable the console sink regardless of configuration
        #[arg(long)]
        quiet: bool,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display the effective configuration
    Show,

    /// Validate configuration file and environment overrides
    Validate,
}

impl Cli {
    /// Get the command to execute, defaulting to Run if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run {
            duration: 5,
            rate: 50,
            producers: 4,
            quiet: false,
        })
    }
}
