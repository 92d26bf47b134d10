//! Error types for marksync-store.

use std::path::PathBuf;

use thiserror::Error;

use marksync_core::{NameError, ProjectName, UserName};

/// All errors that can arise from change log, cursor, project and user storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Persistence I/O failure. The operation did not take effect.
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// Database directory could not be prepared.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("project '{0}' not found")]
    ProjectNotFound(ProjectName),

    #[error("project '{0}' already exists")]
    ProjectExists(ProjectName),

    #[error("user '{0}' not found")]
    UserNotFound(UserName),

    #[error("user '{0}' already exists")]
    UserExists(UserName),

    #[error(transparent)]
    InvalidName(#[from] NameError),

    /// On-disk schema was written by a newer build.
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
