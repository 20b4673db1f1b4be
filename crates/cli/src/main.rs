//! `rally-builds` entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: flags and `RALLY_*` env vars over `rally.toml`
//!    over defaults (see [`config`]).
//! 2. **Wire observability**: a `tracing-subscriber` registry with a pretty or
//!    JSON layer and an optional OpenTelemetry OTLP exporter. All `tracing`
//!    spans and events emitted by every crate in the workspace flow through it.
//! 3. **Construct infrastructure**: a [`rally::RallyClient`] wrapped in a
//!    [`reconcile::Reconciler`].
//! 4. **Run the workflow** once (see [`workflow`]) and exit non-zero with the
//!    full error chain on failure.

mod cli;
mod config;
mod telemetry;
mod workflow;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use rally::RallyClient;
use reconcile::{AmbiguityPolicy, Reconciler, RunId};

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let file = config::load(cli.config.as_deref())?;
    let settings = config::resolve(&cli, file)?;
    let telemetry = telemetry::init(&settings.telemetry)?;

    let result = execute(&cli, settings).await;
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "Run failed");
    }
    telemetry.shutdown();
    result
}

async fn execute(cli: &Cli, settings: config::Settings) -> Result<()> {
    let run_id = RunId::new_random();
    info!(
        %run_id,
        server = %settings.rally.server,
        workspace = %settings.workspace,
        "Starting build sample run"
    );

    let client = RallyClient::new(settings.rally).context("Failed to build Rally client")?;
    let mut reconciler = Reconciler::new(client);
    if cli.run.strict_lookups {
        reconciler = reconciler.with_ambiguity(AmbiguityPolicy::Reject);
    }

    let mut out = std::io::stdout();
    let report =
        workflow::run(&reconciler, run_id, &settings.workspace, &cli.run, &mut out).await?;

    info!(
        workspace = %report.workspace,
        project = %report.project,
        definition = %report.definition.reference,
        build = ?report.build.reference(),
        story = ?report.story,
        updates = report.updates.len(),
        "Run complete"
    );
    Ok(())
}
