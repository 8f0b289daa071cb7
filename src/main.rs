//! # Departure Board Application Entry Point
//!
//! One invocation renders one board. An external scheduler (cron, a systemd
//! timer, the e-reader's own refresh hook) runs the binary every few minutes;
//! nothing is kept between runs.
//!
//! Production mode writes the PNG to the configured path. Development mode
//! (`--stdout`) prints an ASCII preview of the same layout instead.


use std::path::PathBuf;

use anyhow::Context;
use chrono::Local;
use clap::Parser;
use tracing::info;

use departure_board_lib::config::{Config, DEFAULT_CONFIG_PATH};
use departure_board_lib::feed::build_sources;
use departure_board_lib::logging::init_logger;
use departure_board_lib::orchestrator::Orchestrator;
use departure_board_lib::renderer::draw_ascii;

/// Render the next departures from one stop to an image.
#[derive(Debug, Parser)]
#[command(name = "departure-board", version)]
struct Cli {
    /// Configuration file; missing or invalid files fall back to defaults
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Image path, overriding `[output].path`
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print an ASCII preview instead of writing the image
    #[arg(long)]
    stdout: bool,
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    init_logger();
    let cli = Cli::parse();

    let mut config = Config::load_from_path(&cli.config);
    if let Some(path) = cli.output {
        config.output.path = path;
    }

    let sources = build_sources(&config).context("building HTTP clients")?;
    let orchestrator = Orchestrator::from_config(&config, sources);

    // The only wall-clock read of the run
    let now = Local::now().fixed_offset();

    let rt = tokio::runtime::Runtime::new()?;

    if cli.stdout {
        let (plan, report) = rt.block_on(orchestrator.plan(now));
        draw_ascii(&plan, orchestrator.spec());
        info!(
            source = report.source.as_deref().unwrap_or("fallback"),
            departures = report.departures,
            rejected = report.rejected,
            "preview rendered"
        );
        return Ok(());
    }

    let report = rt
        .block_on(orchestrator.run(now))
        .with_context(|| format!("rendering board to {}", orchestrator.output_path().display()))?;
    info!(
        stage = ?report.stage,
        attempts = report.attempts,
        rejected = report.rejected,
        fallback = report.fallback,
        "run complete"
    );
    Ok(())
}
