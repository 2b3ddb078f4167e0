//! Error types for the write path.

use thiserror::Error;

use crate::datatype::Datatype;

/// Result type alias for write-path operations.
pub type StepfluxResult<T> = Result<T, StepfluxError>;

/// One node that could not be fully flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushFailure {
    /// Hierarchy path of the node.
    pub path: String,
    /// Rendered backend error.
    pub reason: String,
}

/// Error variants for write-path operations.
#[derive(Debug, Error)]
pub enum StepfluxError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A chunk does not fit the declared dataset.
    #[error("Shape mismatch on {path}: chunk offset {offset:?} extent {extent:?} does not fit dataset {shape:?}")]
    ShapeMismatch {
        /// Component path.
        path: String,
        /// Chunk offset.
        offset: Vec<u64>,
        /// Chunk extent.
        extent: Vec<u64>,
        /// Declared dataset extent.
        shape: Vec<u64>,
    },

    /// A different dataset shape was declared after the first flush.
    #[error("Shape redefinition on {path}: {old:?} was already flushed, cannot declare {new:?}")]
    ShapeRedefinition {
        /// Component path.
        path: String,
        /// Flushed extent.
        old: Vec<u64>,
        /// Rejected extent.
        new: Vec<u64>,
    },

    /// A chunk was stored before any dataset was declared.
    #[error("No dataset declared on {path}")]
    NoDataset {
        /// Component path.
        path: String,
    },

    /// Chunk element type differs from the dataset element type.
    #[error("Datatype mismatch on {path}: dataset is {expected}, chunk is {actual}")]
    DatatypeMismatch {
        /// Component path.
        path: String,
        /// Declared datatype.
        expected: Datatype,
        /// Chunk datatype.
        actual: Datatype,
    },

    /// Buffer element count differs from the chunk extent.
    #[error("Buffer size mismatch on {path}: extent needs {expected} elements, buffer holds {actual}")]
    BufferSizeMismatch {
        /// Component path.
        path: String,
        /// Elements required by the extent.
        expected: u64,
        /// Elements in the buffer.
        actual: u64,
    },

    /// Chunk stored into a constant component.
    #[error("Component {path} is constant and takes no chunks")]
    ConstantComponent {
        /// Component path.
        path: String,
    },

    /// Mutation attempted on a closed iteration.
    #[error("Iteration {index} is closed")]
    IterationClosed {
        /// Iteration index.
        index: u64,
    },

    /// Iteration closed a second time.
    #[error("Iteration {index} is already closed ({state})")]
    AlreadyClosed {
        /// Iteration index.
        index: u64,
        /// State at the time of the call.
        state: &'static str,
    },

    /// A backend task failed.
    #[error("Backend {op} failed on {path}: {reason}")]
    Backend {
        /// Backend operation name.
        op: &'static str,
        /// Container path or target.
        path: String,
        /// Description of the failure.
        reason: String,
    },

    /// One or more nodes could not be flushed; their data stays buffered.
    #[error("Flush incomplete: {} node(s) failed, first: {}", failures.len(), failures.first().map(|f| f.path.as_str()).unwrap_or("-"))]
    FlushFailed {
        /// Per-node failures.
        failures: Vec<FlushFailure>,
    },

    /// The iteration filename template is malformed.
    #[error("Invalid iteration template {template:?}: {reason}")]
    InvalidTemplate {
        /// Offending template.
        template: String,
        /// Description of the problem.
        reason: String,
    },

    /// A node name collides with a key of the stored document layout.
    #[error("Name {name:?} under {parent} is reserved")]
    ReservedName {
        /// Parent path.
        parent: String,
        /// Rejected name.
        name: String,
    },

    /// Node id or child name does not resolve.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },
}

impl StepfluxError {
    /// Builds a backend task failure.
    pub fn backend(op: &'static str, path: impl Into<String>, reason: impl Into<String>) -> Self {
        StepfluxError::Backend {
            op,
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for StepfluxError {
    fn from(e: serde_json::Error) -> Self {
        StepfluxError::Serialization {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_alias() {
        let ok: StepfluxResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: StepfluxResult<i32> = Err(StepfluxError::IterationClosed { index: 3 });
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StepfluxError = std_err.into();
        assert!(matches!(err, StepfluxError::Io(_)));
    }

    #[test]
    fn test_shape_mismatch_message() {
        let err = StepfluxError::ShapeMismatch {
            path: "/data/1/fields/E/alpha".to_string(),
            offset: vec![900],
            extent: vec![200],
            shape: vec![1000],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("/data/1/fields/E/alpha"));
        assert!(msg.contains("[1000]"));
    }

    #[test]
    fn test_already_closed_message() {
        let err = StepfluxError::AlreadyClosed {
            index: 7,
            state: "ClosedInBackend",
        };
        assert_eq!(
            format!("{}", err),
            "Iteration 7 is already closed (ClosedInBackend)"
        );
    }

    #[test]
    fn test_flush_failed_summary() {
        let err = StepfluxError::FlushFailed {
            failures: vec![
                FlushFailure {
                    path: "/data/1".to_string(),
                    reason: "disk full".to_string(),
                },
                FlushFailure {
                    path: "/data/2".to_string(),
                    reason: "disk full".to_string(),
                },
            ],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("2 node(s)"));
        assert!(msg.contains("/data/1"));
    }

    #[test]
    fn test_backend_helper() {
        let err = StepfluxError::backend("write_chunk", "/data/1/fields/rho", "injected");
        assert_eq!(
            format!("{}", err),
            "Backend write_chunk failed on /data/1/fields/rho: injected"
        );
    }
}
