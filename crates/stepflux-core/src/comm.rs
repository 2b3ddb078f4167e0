//! Parallel communicator abstraction.
//!
//! Collective operations (iteration close with flush, series close) must be
//! entered by every rank in the same order. The core only needs the rank, the
//! world size and a barrier; partial participation is not detected.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Barrier;

/// Rank/size/barrier view of the parallel runtime.
pub trait Communicator: Send + Sync {
    /// Index of this process.
    fn rank(&self) -> u64;

    /// Number of participating processes.
    fn size(&self) -> u64;

    /// Blocks until every rank has entered the barrier.
    fn barrier(&self) -> impl Future<Output = ()> + Send;
}

/// Single-process communicator; the barrier returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> u64 {
        0
    }

    fn size(&self) -> u64 {
        1
    }

    async fn barrier(&self) {}
}

/// One rank of a world simulated by tasks inside this process.
#[derive(Debug, Clone)]
pub struct InProcessComm {
    rank: u64,
    size: u64,
    barrier: Arc<Barrier>,
}

impl InProcessComm {
    /// Creates the communicators of a `size`-rank world, indexed by rank.
    pub fn world(size: u64) -> Vec<InProcessComm> {
        let size = size.max(1);
        let barrier = Arc::new(Barrier::new(size as usize));
        (0..size)
            .map(|rank| InProcessComm {
                rank,
                size,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }
}

impl Communicator for InProcessComm {
    fn rank(&self) -> u64 {
        self.rank
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn barrier(&self) {
        self.barrier.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_self_comm() {
        let c = SelfComm;
        assert_eq!(c.rank(), 0);
        assert_eq!(c.size(), 1);
        c.barrier().await;
    }

    #[test]
    fn test_world_ranks() {
        let world = InProcessComm::world(4);
        let ranks: Vec<u64> = world.iter().map(|c| c.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert!(world.iter().all(|c| c.size() == 4));
        assert_eq!(InProcessComm::world(0).len(), 1);
    }

    #[tokio::test]
    async fn test_barrier_releases_all_ranks() {
        let arrived = Arc::new(AtomicU64::new(0));
        let mut tasks = Vec::new();
        for comm in InProcessComm::world(3) {
            let arrived = Arc::clone(&arrived);
            tasks.push(tokio::spawn(async move {
                arrived.fetch_add(1, Ordering::SeqCst);
                comm.barrier().await;
                arrived.load(Ordering::SeqCst)
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap(), 3);
        }
    }
}
