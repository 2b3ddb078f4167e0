//! The parallel 1D/2D write workload.
//!
//! Every rank writes three meshes (`E/alpha`, `B/alpha`, scalar `rho`) and one
//! particle species `ion` per step, using the blocks its [`StepPlan`] assigns.
//! A run writes 1-D then 2-D meshes, each first file-based (one series per
//! step) and then group-based (one series for all steps).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stepflux_core::{
    Backend, BackendStats, Communicator, Dataset, Datatype, InProcessComm, Series, StepPlan, StepfluxError, SCALAR,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::BenchConfig;
use crate::timer::{PhaseTimer, PhaseTiming};

/// Errors of a benchmark run.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Write path failure
    #[error("rank {rank}: {source}")]
    Write {
        /// Failing rank
        rank: u64,
        /// Underlying error
        #[source]
        source: StepfluxError,
    },

    /// A rank task panicked or was cancelled
    #[error("rank task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type alias for benchmark runs.
pub type BenchResult<T> = Result<T, BenchError>;

/// What one rank did during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankSummary {
    /// Rank index
    pub rank: u64,
    /// Timing of every phase in run order
    pub phases: Vec<PhaseTiming>,
    /// Mesh chunks stored
    pub mesh_chunks: u64,
    /// Particle chunks stored per component
    pub particle_chunks: u64,
    /// Iterations closed
    pub iterations: u64,
}

/// Summary of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Per-rank summaries ordered by rank
    pub ranks: Vec<RankSummary>,
    /// Backend statistics at the end of the run
    pub backend: BackendStats,
}

/// Mesh records written per step: (record, component).
const MESHES: [(&str, &str); 3] = [("E", "alpha"), ("B", "alpha"), ("rho", SCALAR)];

/// Workload of one rank.
pub struct RankWorkload<'a, C: Communicator + Clone> {
    config: &'a BenchConfig,
    comm: C,
    summary: RankSummary,
}

impl<'a, C: Communicator + Clone> RankWorkload<'a, C> {
    /// Workload for the rank behind `comm`.
    pub fn new(config: &'a BenchConfig, comm: C) -> Self {
        let summary = RankSummary {
            rank: comm.rank(),
            ..RankSummary::default()
        };
        Self { config, comm, summary }
    }

    /// Runs the 1-D and 2-D phases, each file-based then group-based.
    pub async fn run<B: Backend>(mut self, backend: Arc<B>) -> BenchResult<RankSummary> {
        let rank = self.comm.rank();
        let main = PhaseTimer::start("Main", rank);
        for dims in [1usize, 2] {
            self.run_dims(&backend, dims)
                .await
                .map_err(|source| BenchError::Write { rank, source })?;
        }
        self.summary.phases.push(main.finish());
        Ok(self.summary)
    }

    async fn run_dims<B: Backend>(&mut self, backend: &Arc<B>, dims: usize) -> Result<(), StepfluxError> {
        let rank = self.comm.rank();

        let path = self.config.file_based_path(dims);
        let timer = PhaseTimer::start(format!("Writing: {}", path), rank);
        for step in 1..=self.config.steps {
            let mut series = self.open(&path, backend)?;
            self.store(&mut series, step, dims).await?;
            series.close().await?;
        }
        self.summary.phases.push(timer.finish());

        let path = self.config.group_based_path(dims);
        let timer = PhaseTimer::start(format!("Writing: {}", path), rank);
        let mut series = self.open(&path, backend)?;
        for step in 1..=self.config.steps {
            self.store(&mut series, step, dims).await?;
        }
        series.close().await?;
        self.summary.phases.push(timer.finish());
        Ok(())
    }

    fn open<B: Backend>(&self, path: &str, backend: &Arc<B>) -> Result<Series<B, C>, StepfluxError> {
        Series::create(
            path,
            Arc::clone(backend),
            self.comm.clone(),
            self.config.series.clone(),
        )
    }

    /// Stores meshes and particles of `step`, then closes the iteration.
    async fn store<B: Backend>(&mut self, series: &mut Series<B, C>, step: u64, dims: usize) -> Result<(), StepfluxError> {
        let plan = StepPlan::new(
            self.config.plan_params(),
            self.comm.size(),
            self.comm.rank(),
            step,
            dims,
        );
        for (record, component) in MESHES {
            self.store_mesh(series, &plan, step, record, component)?;
        }
        self.store_particles(series, &plan, step)?;

        let it = series.iteration(step)?;
        series.close_iteration(&it, true).await?;
        self.summary.iterations += 1;
        debug!(rank = self.comm.rank(), step, dims, "step stored");
        Ok(())
    }

    fn store_mesh<B: Backend>(
        &mut self,
        series: &mut Series<B, C>,
        plan: &StepPlan,
        step: u64,
        record: &str,
        component: &str,
    ) -> Result<(), StepfluxError> {
        let it = series.iteration(step)?;
        let comp = series.mesh_component(&it, record, component)?;
        series.declare_dataset(comp, Dataset::new(Datatype::Float64, plan.global_extent().to_vec()))?;
        if plan.dims() == 2 {
            let mesh = series.mesh(&it, record)?;
            series.set_attribute(mesh, "axisLabels", vec![String::from("x"), String::from("y")])?;
            series.set_attribute(mesh, "gridSpacing", vec![1.0, 1.0])?;
            series.set_attribute(mesh, "gridGlobalOffset", vec![0.0, 0.0])?;
        }

        for n in 0..plan.num_blocks() {
            let Some(block) = plan.mesh_block(n) else {
                continue;
            };
            let len = block.num_elements();
            if len == 0 {
                continue;
            }
            let value = n as f64 + 0.0001 * step as f64;
            series.store_chunk(comp, vec![value; len as usize], block.offset, block.extent)?;
            self.summary.mesh_chunks += 1;
        }
        Ok(())
    }

    fn store_particles<B: Backend>(
        &mut self,
        series: &mut Series<B, C>,
        plan: &StepPlan,
        step: u64,
    ) -> Result<(), StepfluxError> {
        let it = series.iteration(step)?;
        let species = series.species(&it, "ion")?;
        series.set_attribute(species, "particleSmoothing", "none")?;
        series.set_attribute(species, "openPMD_STEP", step)?;
        series.set_attribute(species, "multiplier", self.config.ratio())?;

        let np = plan.total_particles();
        let id = series.particle_component(&it, "ion", "id", SCALAR)?;
        let charge = series.particle_component(&it, "ion", "charge", SCALAR)?;
        let x = series.particle_component(&it, "ion", "position", "x")?;
        let offset_x = series.particle_component(&it, "ion", "positionOffset", "x")?;
        series.declare_dataset(id, Dataset::new(Datatype::UInt64, vec![np]))?;
        for c in [charge, x, offset_x] {
            series.declare_dataset(c, Dataset::new(Datatype::Float64, vec![np]))?;
        }
        series.make_constant(offset_x, 0.0)?;

        for n in 0..plan.num_blocks() {
            let Some(range) = plan.particle_range(n) else {
                continue;
            };
            if range.count == 0 {
                continue;
            }
            let count = range.count as usize;
            let ids: Vec<u64> = (range.offset..range.end()).collect();
            series.store_chunk(id, ids, vec![range.offset], vec![range.count])?;
            series.store_chunk(charge, vec![0.001 * step as f64; count], vec![range.offset], vec![range.count])?;
            series.store_chunk(x, vec![0.0003 * step as f64; count], vec![range.offset], vec![range.count])?;
            self.summary.particle_chunks += 1;
        }
        Ok(())
    }
}

/// Runs the workload on `config.ranks` simulated ranks sharing `backend`.
pub async fn run_world<B: Backend + 'static>(backend: Arc<B>, config: &BenchConfig) -> BenchResult<RunSummary> {
    let config = Arc::new(config.clone());
    info!(
        ranks = config.ranks,
        bulk = config.bulk,
        segments = config.plan_params().segments,
        steps = config.steps,
        ratio = config.ratio(),
        imbalance = config.imbalance(),
        "benchmark starting"
    );

    let mut tasks = Vec::new();
    for comm in InProcessComm::world(config.ranks) {
        let backend = Arc::clone(&backend);
        let config = Arc::clone(&config);
        tasks.push(tokio::spawn(async move {
            RankWorkload::new(&config, comm).run(backend).await
        }));
    }

    let mut ranks = Vec::with_capacity(tasks.len());
    for task in tasks {
        ranks.push(task.await??);
    }
    ranks.sort_by_key(|r| r.rank);

    let stats = backend.stats();
    info!(
        chunks = stats.chunks_written,
        bytes = stats.bytes_written,
        containers = stats.containers_created,
        "benchmark finished"
    );
    Ok(RunSummary { ranks, backend: stats })
}
