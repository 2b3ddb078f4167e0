//! Iteration close state machine.
//!
//! Every handle to one logical iteration shares a single [`CloseCell`]; copying
//! a handle never duplicates the state.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{StepfluxError, StepfluxResult};
use crate::hierarchy::NodeId;

/// Close state of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CloseStatus {
    /// Accepting writes
    #[default]
    Open,
    /// Closed by the writer, backend not finalized yet
    ClosedInFrontend,
    /// Closed and finalized in the backend; terminal
    ClosedInBackend,
    /// Backend resources released, may be written again
    ClosedTemporarily,
}

impl CloseStatus {
    /// Variant name for logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseStatus::Open => "Open",
            CloseStatus::ClosedInFrontend => "ClosedInFrontend",
            CloseStatus::ClosedInBackend => "ClosedInBackend",
            CloseStatus::ClosedTemporarily => "ClosedTemporarily",
        }
    }
}

#[derive(Debug, Default)]
struct CloseRecord {
    status: CloseStatus,
    /// Set by the first `close()`; never cleared.
    writer_closed: bool,
}

/// Shared, reference-counted close state of one iteration.
#[derive(Debug, Clone, Default)]
pub struct CloseCell {
    inner: Arc<Mutex<CloseRecord>>,
}

impl CloseCell {
    /// A fresh cell in state `Open`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status.
    pub fn status(&self) -> CloseStatus {
        self.inner.lock().status
    }

    /// True once the writer has closed the iteration.
    pub fn closed(&self) -> bool {
        self.inner.lock().writer_closed
    }

    /// True when the writer closed the iteration but the backend has not been finalized.
    pub fn needs_finalize(&self) -> bool {
        let rec = self.inner.lock();
        rec.writer_closed && rec.status != CloseStatus::ClosedInBackend
    }

    /// Checks that a mutation is allowed. Never changes the status.
    pub fn check_writable(&self, index: u64) -> StepfluxResult<()> {
        let rec = self.inner.lock();
        if rec.writer_closed {
            return Err(StepfluxError::IterationClosed { index });
        }
        match rec.status {
            CloseStatus::Open | CloseStatus::ClosedTemporarily => Ok(()),
            CloseStatus::ClosedInFrontend | CloseStatus::ClosedInBackend => {
                Err(StepfluxError::IterationClosed { index })
            }
        }
    }

    /// `ClosedTemporarily` -> `Open`, once a mutation has been accepted.
    pub fn reopen(&self, index: u64) {
        let mut rec = self.inner.lock();
        if rec.status == CloseStatus::ClosedTemporarily && !rec.writer_closed {
            tracing::debug!(index, "reopening temporarily closed iteration");
            rec.status = CloseStatus::Open;
        }
    }

    /// `Open`/`ClosedTemporarily` -> `ClosedInFrontend`. A second close is rejected.
    pub fn begin_close(&self, index: u64) -> StepfluxResult<()> {
        let mut rec = self.inner.lock();
        if rec.writer_closed {
            return Err(StepfluxError::AlreadyClosed {
                index,
                state: rec.status.as_str(),
            });
        }
        rec.writer_closed = true;
        rec.status = CloseStatus::ClosedInFrontend;
        tracing::info!(index, "iteration closed in frontend");
        Ok(())
    }

    /// Records a released backend state without finalizing it.
    pub fn close_temporarily(&self, index: u64) -> StepfluxResult<()> {
        let mut rec = self.inner.lock();
        match rec.status {
            CloseStatus::ClosedInBackend => Err(StepfluxError::AlreadyClosed {
                index,
                state: rec.status.as_str(),
            }),
            _ => {
                rec.status = CloseStatus::ClosedTemporarily;
                Ok(())
            }
        }
    }

    /// Terminal transition after the backend confirmed the close.
    pub fn finish_backend_close(&self, index: u64) {
        let mut rec = self.inner.lock();
        rec.writer_closed = true;
        rec.status = CloseStatus::ClosedInBackend;
        tracing::info!(index, "iteration closed in backend");
    }
}

/// A cheap, cloneable handle to one iteration of a [`crate::series::Series`].
#[derive(Debug, Clone)]
pub struct Iteration {
    index: u64,
    node: NodeId,
    cell: CloseCell,
}

impl Iteration {
    pub(crate) fn new(index: u64, node: NodeId, cell: CloseCell) -> Self {
        Self { index, node, cell }
    }

    /// Iteration index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Hierarchy node of the iteration.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Current close status, shared with every clone of this handle.
    pub fn status(&self) -> CloseStatus {
        self.cell.status()
    }

    /// Has the iteration been closed?
    pub fn closed(&self) -> bool {
        self.cell.closed()
    }

    pub(crate) fn cell(&self) -> &CloseCell {
        &self.cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_open() {
        let cell = CloseCell::new();
        assert_eq!(cell.status(), CloseStatus::Open);
        assert!(!cell.closed());
        assert!(cell.check_writable(1).is_ok());
    }

    #[test]
    fn test_close_transitions() {
        let cell = CloseCell::new();
        cell.begin_close(1).unwrap();
        assert_eq!(cell.status(), CloseStatus::ClosedInFrontend);
        assert!(cell.needs_finalize());

        cell.finish_backend_close(1);
        assert_eq!(cell.status(), CloseStatus::ClosedInBackend);
        assert!(!cell.needs_finalize());
    }

    #[test]
    fn test_second_close_rejected() {
        let cell = CloseCell::new();
        cell.begin_close(2).unwrap();
        let err = cell.begin_close(2).unwrap_err();
        assert!(matches!(
            err,
            StepfluxError::AlreadyClosed {
                index: 2,
                state: "ClosedInFrontend"
            }
        ));

        cell.finish_backend_close(2);
        assert!(matches!(
            cell.begin_close(2),
            Err(StepfluxError::AlreadyClosed { .. })
        ));
    }

    #[test]
    fn test_closed_rejects_mutation() {
        let cell = CloseCell::new();
        cell.begin_close(3).unwrap();
        assert!(matches!(
            cell.check_writable(3),
            Err(StepfluxError::IterationClosed { index: 3 })
        ));
        cell.finish_backend_close(3);
        assert!(cell.check_writable(3).is_err());
    }

    #[test]
    fn test_temporary_close_reopens() {
        let cell = CloseCell::new();
        cell.close_temporarily(4).unwrap();
        assert_eq!(cell.status(), CloseStatus::ClosedTemporarily);
        cell.check_writable(4).unwrap();
        assert_eq!(cell.status(), CloseStatus::ClosedTemporarily);
        cell.reopen(4);
        assert_eq!(cell.status(), CloseStatus::Open);
    }

    #[test]
    fn test_temporary_close_after_frontend_close_stays_closed() {
        let cell = CloseCell::new();
        cell.begin_close(5).unwrap();
        cell.close_temporarily(5).unwrap();
        assert!(cell.check_writable(5).is_err());
        cell.reopen(5);
        assert_eq!(cell.status(), CloseStatus::ClosedTemporarily);
        assert!(cell.needs_finalize());
    }

    #[test]
    fn test_temporary_close_after_backend_close_rejected() {
        let cell = CloseCell::new();
        cell.begin_close(6).unwrap();
        cell.finish_backend_close(6);
        assert!(cell.close_temporarily(6).is_err());
    }

    #[test]
    fn test_handles_share_state() {
        let it = Iteration::new(7, NodeId(1), CloseCell::new());
        let copy = it.clone();
        it.cell().begin_close(7).unwrap();
        assert_eq!(copy.status(), CloseStatus::ClosedInFrontend);
        assert!(copy.closed());
    }
}
