use std::path::PathBuf;

/// Failure of a single parameter-file task.
///
/// Errors in one task never cross into sibling workers; the scheduler logs
/// the error, marks the task failed and keeps draining the queue.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("parameter file {}: {reason}", .path.display())]
    Params { path: PathBuf, reason: String },

    #[error("expected output {} does not exist", .0.display())]
    MissingOutput(PathBuf),

    #[error("catalog {}: {reason}", .path.display())]
    Catalog { path: PathBuf, reason: String },

    #[error("fits header {}: {reason}", .path.display())]
    Fits { path: PathBuf, reason: String },

    #[error("source finder exited with code {code}")]
    FinderFailed { code: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl TaskError {
    pub fn params(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Params {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn catalog(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Catalog {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn fits(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Fits {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
