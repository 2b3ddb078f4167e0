use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use stepflux_bench::cli::Cli;
use stepflux_bench::{run_world, BackendKind, PhaseTimer};
use stepflux_core::{JsonBackend, MemoryBackend};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Cli::parse().into_config()?;
    tracing::info!(backend = ?config.backend, ranks = config.ranks, "sfx-bench starting");

    let timer = PhaseTimer::start("Total", 0);
    let summary = match config.backend {
        BackendKind::Memory => run_world(Arc::new(MemoryBackend::new()), &config).await?,
        BackendKind::Json => {
            tokio::fs::create_dir_all(&config.output_dir).await?;
            let backend = Arc::new(JsonBackend::new(&config.output_dir));
            let summary = run_world(Arc::clone(&backend), &config).await?;
            tracing::info!(
                files = backend.files_written(),
                dir = %backend.dir().display(),
                "documents written"
            );
            summary
        }
    };
    timer.finish();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
