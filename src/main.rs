//! run-sanity-test - Sanity test for the simple-firewall image
//!
//! Imports the image, runs it against a client container, reports the
//! results and optionally pushes the image to the registry.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sanity_harness::config::{HarnessConfig, PushPolicy};
use sanity_harness::logging::init_logging;
use sanity_harness::network::IpRoute2;
use sanity_harness::registry::StdinConfirm;
use sanity_harness::report::{self, OutputFormat};
use sanity_harness::runner::SanityRunner;
use sanity_harness::runtime::DockerRuntime;

/// Sanity test for the simple-firewall image
#[derive(Parser)]
#[command(name = "run-sanity-test")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Boot the firewall image next to a client and check DHCP, DNS and ports", long_about = None)]
struct Cli {
    /// Extra configuration file, layered over the defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Push policy after all checks pass (ask, always, never)
    #[arg(long)]
    push: Option<PushPolicy>,

    /// Exit with status 1 unless every check passed
    #[arg(long)]
    strict: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    /// Log level, overrides the configuration
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = HarnessConfig::load(cli.config.as_deref())?;
    if let Some(push) = cli.push {
        config.push = push;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    let strict = cli.strict || config.strict_exit_code;

    init_logging(&config.log_level, config.log_file.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        image = %config.image.name,
        "Starting sanity test"
    );

    let runtime = DockerRuntime::new(config.image.docker_socket.as_deref())
        .await
        .context("Failed to connect to Docker")?;

    let runner = SanityRunner::new(
        config,
        Box::new(runtime),
        Box::new(IpRoute2::new()),
        Box::new(StdinConfirm),
    );
    let summary = runner.run().await;

    println!("{}", report::render(&summary, cli.output)?);

    Ok(ExitCode::from(report::exit_code(&summary, strict) as u8))
}
