use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use telemetry_pipeline::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = cli::Cli::parse();

    // The run command installs its own subscriber with the pipeline layer attached
    let is_run = matches!(args.get_command(), cli::Commands::Run { .. });
    if !is_run {
        init_tracing(args.json_logs);
    }

    // Dispatch to appropriate command handler
    match args.get_command() {
        cli::Commands::Run {
            duration,
            rate,
            producers,
            quiet,
        } => {
            let options = commands::run::RunOptions {
                duration,
                rate,
                producers,
                quiet,
                json_logs: args.json_logs,
            };
            commands::run::execute(&args.config, options).await?;
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&args.config)?,
            cli::ConfigCommands::Validate => commands::config::validate(&args.config)?,
        },
        cli::Commands::Version => {
            println!("telemetry-pipeline v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
