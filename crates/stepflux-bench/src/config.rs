use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use stepflux_core::{PlanParams, SeriesConfig, DEFAULT_SECOND_DIM};

/// Storage engine used by a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Keep everything in memory
    Memory,
    /// Dump every target as a JSON document
    Json,
}

/// Benchmark settings, loadable from TOML or JSON and overridden by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Ratio selector: values above 10 enable imbalance, `(num - 1) % 10 + 1` is the particle ratio
    pub num: i64,
    /// Mesh elements per rank along the first dimension
    pub bulk: u64,
    /// Requested blocks per rank
    pub segments: u32,
    /// Iterations written per phase
    pub steps: u64,
    /// Simulated ranks
    pub ranks: u64,
    /// Storage engine
    pub backend: BackendKind,
    /// Directory for JSON documents
    pub output_dir: PathBuf,
    /// Prefix of every target name
    pub name_prefix: String,
    /// Collective write mode; forces one block per rank
    pub collective_writes: bool,
    /// Second-dimension size of 2-D meshes
    pub second_dim: u64,
    /// Options passed to every series
    pub series: SeriesConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            num: 1,
            bulk: 1000,
            segments: 1,
            steps: 1,
            ranks: 1,
            backend: BackendKind::Memory,
            output_dir: PathBuf::from("samples"),
            name_prefix: String::from("8a_parallel"),
            collective_writes: false,
            second_dim: DEFAULT_SECOND_DIM,
            series: SeriesConfig::default(),
        }
    }
}

impl BenchConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: BenchConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: BenchConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Is load imbalance injected?
    pub fn imbalance(&self) -> bool {
        self.num > 10
    }

    /// Particles per mesh element.
    pub fn ratio(&self) -> u64 {
        let num = if self.num <= 0 { 1 } else { self.num };
        ((num - 1) % 10 + 1) as u64
    }

    /// Planner parameters for this run.
    pub fn plan_params(&self) -> PlanParams {
        let params = PlanParams {
            bulk: self.bulk,
            segments: self.segments,
            ratio: self.ratio(),
            imbalance: self.imbalance(),
            second_dim: self.second_dim,
        };
        PlanParams {
            segments: params.effective_segments(self.collective_writes),
            ..params
        }
    }

    /// `b` for balanced runs, `u` for imbalanced ones.
    pub fn balance_tag(&self) -> &'static str {
        if self.imbalance() {
            "u"
        } else {
            "b"
        }
    }

    /// Target template of the file-based phase.
    pub fn file_based_path(&self, dims: usize) -> String {
        format!("{}_{}D{}_%07T.json", self.name_prefix, dims, self.balance_tag())
    }

    /// Target of the group-based phase.
    pub fn group_based_path(&self, dims: usize) -> String {
        format!("{}_{}D{}.json", self.name_prefix, dims, self.balance_tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = BenchConfig::default();
        assert_eq!(config.bulk, 1000);
        assert_eq!(config.segments, 1);
        assert_eq!(config.steps, 1);
        assert_eq!(config.ranks, 1);
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.ratio(), 1);
        assert!(!config.imbalance());
    }

    #[test]
    fn test_ratio_selector() {
        let with = |num| BenchConfig {
            num,
            ..BenchConfig::default()
        };
        assert_eq!(with(1).ratio(), 1);
        assert_eq!(with(10).ratio(), 10);
        assert_eq!(with(11).ratio(), 1);
        assert!(with(11).imbalance());
        assert_eq!(with(15).ratio(), 5);
        assert_eq!(with(0).ratio(), 1);
        assert_eq!(with(-3).ratio(), 1);
        assert!(!with(10).imbalance());
    }

    #[test]
    fn test_collective_writes_force_one_segment() {
        let config = BenchConfig {
            segments: 4,
            collective_writes: true,
            ..BenchConfig::default()
        };
        assert_eq!(config.plan_params().segments, 1);
        let config = BenchConfig {
            segments: 4,
            ..BenchConfig::default()
        };
        assert_eq!(config.plan_params().segments, 4);
    }

    #[test]
    fn test_target_names() {
        let config = BenchConfig {
            num: 12,
            ..BenchConfig::default()
        };
        assert_eq!(config.file_based_path(2), "8a_parallel_2Du_%07T.json");
        assert_eq!(config.group_based_path(1), "8a_parallel_1Du.json");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "num": 13,
                "bulk": 64,
                "steps": 3,
                "ranks": 4,
                "backend": "json",
                "series": {{ "meshes_path": "meshes" }}
            }}"#
        )
        .unwrap();

        let config = BenchConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bulk, 64);
        assert_eq!(config.steps, 3);
        assert_eq!(config.ranks, 4);
        assert_eq!(config.backend, BackendKind::Json);
        assert_eq!(config.ratio(), 3);
        assert_eq!(config.series.meshes_path, "meshes");
        assert_eq!(config.series.particles_path, "particles");
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
bulk = 128
segments = 3
collective_writes = true
output_dir = "/tmp/sfx"

[series]
collective_close = false
"#
        )
        .unwrap();

        let config = BenchConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bulk, 128);
        assert_eq!(config.segments, 3);
        assert!(config.collective_writes);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/sfx"));
        assert!(!config.series.collective_close);
        assert_eq!(config.plan_params().segments, 1);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(BenchConfig::from_file(file.path()).is_err());
    }
}
