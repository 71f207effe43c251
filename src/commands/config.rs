use anyhow::Result;
use colored::Colorize;
use std::path::Path;
use telemetry_pipeline::config::{self, PipelineConfig};
use tracing::info;

/// Execute the config show command
///
/// Displays the effective configuration (file + environment overrides)
pub fn show(path: &Path) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!(path = %path.display(), "Loading configuration for display");

    let cfg = config::load_config(Some(path))?;

    println!("{}", "Effective Configuration:".green().bold());
    println!();

    // Serialize to TOML format
    let toml_string = toml::to_string_pretty(&cfg)?;
    println!("{}", toml_string);

    info!("Configuration displayed successfully");
    Ok(())
}

/// Execute the config validate command
///
/// Validates the configuration file and prints a summary
pub fn validate(path: &Path) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());
    info!(path = %path.display(), "Validating configuration file");

    let cfg = config::load_config(Some(path))?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    print_summary(&cfg);

    info!("Configuration validation successful");
    Ok(())
}

fn print_summary(cfg: &PipelineConfig) {
    println!("{}", "Summary:".bold());
    println!(
        "  {}: capacity {}, batch {}, flush every {}ms",
        "Queue".cyan(),
        cfg.queue_capacity,
        cfg.batch_size,
        cfg.flush_interval_ms
    );
    println!(
        "  {}: {} ({})",
        "Workers".cyan(),
        cfg.worker_count,
        if cfg.batching_enabled {
            "batching".green()
        } else {
            "direct".yellow()
        }
    );
    println!(
        "  {}: logger {}, message {}, context {}",
        "Caches".cyan(),
        cfg.caches.logger.capacity,
        cfg.caches.message.capacity,
        cfg.caches.context.capacity
    );
    println!("  {}: {}", "Sinks".cyan(), describe_sinks(cfg));
    println!("  {}: {}", "Logger Overrides".cyan(), cfg.logger_levels.len());
}

/// One-line description of the configured sinks
fn describe_sinks(cfg: &PipelineConfig) -> String {
    let mut sinks = Vec::new();
    if cfg.sinks.console {
        sinks.push("console".to_string());
    }
    if let Some(path) = &cfg.sinks.file_path {
        match cfg.sinks.file_max_bytes {
            Some(max) => sinks.push(format!("file {} (rotate at {} bytes)", path, max)),
            None => sinks.push(format!("file {}", path)),
        }
    }

    if sinks.is_empty() {
        "none".to_string()
    } else {
        sinks.join(", ")
    }
}
