#![warn(missing_docs)]

//! Stepflux core: parallel write path for chunked, time-indexed scientific datasets
//!
//! Each rank of an SPMD run owns a disjoint slice of a global mesh or particle
//! record per step. The planner decides that slice, the record hierarchy
//! buffers attribute and chunk writes, and the flush scheduler commits them to
//! a shared backend only at explicit flush and close points.

pub mod backend;
pub mod comm;
pub mod config;
pub mod datatype;
pub mod error;
pub mod flush;
pub mod hierarchy;
pub mod iteration;
pub mod json_backend;
pub mod naming;
pub mod planner;
pub mod series;

pub use backend::{Backend, BackendHandle, BackendOp, BackendOpKind, BackendStats, BackendTarget, MemoryBackend};
pub use comm::{Communicator, InProcessComm, SelfComm};
pub use config::SeriesConfig;
pub use datatype::{AttributeValue, ChunkBuffer, Dataset, Datatype, Element};
pub use error::{FlushFailure, StepfluxError, StepfluxResult};
pub use flush::{FlushReport, FlushScheduler};
pub use hierarchy::{Hierarchy, Node, NodeId, NodeKind, PendingChunk, RESERVED_NAMES, SCALAR};
pub use iteration::{CloseCell, CloseStatus, Iteration};
pub use json_backend::JsonBackend;
pub use naming::{IterationEncoding, NamingPolicy};
pub use planner::{
    compute_rank_partition, expand_to_second_dimension, halves, particle_range_1d, particle_range_2d, subdivide, Half,
    MeshBlock, PlanParams, PlaneBlock, RankPartition, Span, StepPlan, DEFAULT_SECOND_DIM,
};
pub use series::{Series, CLOSED_MARKER, STANDARD_VERSION};
