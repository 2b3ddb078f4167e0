#![warn(missing_docs)]

//! Stepflux benchmark: parallel 1D/2D mesh and particle writes over simulated ranks
//!
//! Each simulated rank runs as a tokio task with an in-process communicator and
//! writes its share of every step through a shared backend.

pub mod cli;
pub mod config;
pub mod timer;
pub mod workload;

pub use config::{BackendKind, BenchConfig};
pub use timer::{PhaseTimer, PhaseTiming};
pub use workload::{run_world, BenchError, BenchResult, RankSummary, RankWorkload, RunSummary};
