use crate::config::{BackendKind, BenchConfig};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Command line of `sfx-bench`.
#[derive(Parser, Debug)]
#[command(name = "sfx-bench")]
#[command(about = "Parallel 1D/2D mesh and particle write benchmark", long_about = None)]
pub struct Cli {
    /// Ratio selector; above 10 enables load imbalance
    #[arg(allow_negative_numbers = true)]
    pub num: Option<i64>,

    /// Mesh elements per rank along the first dimension
    pub bulk: Option<u64>,

    /// Requested blocks per rank
    pub seg: Option<u32>,

    /// Iterations per phase
    pub steps: Option<u64>,

    /// Simulated ranks
    #[arg(short, long, env = "STEPFLUX_RANKS")]
    pub ranks: Option<u64>,

    /// Storage engine
    #[arg(short, long, value_enum, env = "STEPFLUX_BACKEND")]
    pub backend: Option<BackendKind>,

    /// Directory for JSON documents
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// TOML or JSON config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Collective write mode (one block per rank)
    #[arg(long, env = "STEPFLUX_COLLECTIVE_WRITES")]
    pub collective_writes: bool,
}

impl Cli {
    /// Resolves the effective configuration: defaults, then the config file, then flags.
    pub fn into_config(self) -> Result<BenchConfig> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::from_file(path)?,
            None => BenchConfig::default(),
        };

        if let Some(num) = self.num {
            config.num = num;
        }
        if let Some(bulk) = self.bulk {
            config.bulk = bulk;
        }
        if let Some(seg) = self.seg {
            config.segments = seg;
        }
        if let Some(steps) = self.steps {
            config.steps = steps;
        }
        if let Some(ranks) = self.ranks {
            config.ranks = ranks;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        config.collective_writes |= self.collective_writes;

        if config.ranks == 0 {
            anyhow::bail!("at least one rank is required");
        }
        Ok(config)
    }
}
