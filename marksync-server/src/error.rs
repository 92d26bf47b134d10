use std::path::PathBuf;

use thiserror::Error;

use marksync_core::{ChangeId, ConfigError, ErrorCode, FrameDecodeError, ProjectName, UserName};
use marksync_store::StoreError;

/// Error surface for the server runtime and the control socket.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown protocol handler '{0}'")]
    UnknownProtocol(String),

    #[error("control protocol error: {0}")]
    Protocol(String),

    #[error("server is not running (no listener on {socket})")]
    NotRunning { socket: PathBuf },

    #[error("another server is already listening on {socket}")]
    AlreadyRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ServerError {
    ServerError::Io {
        path: path.into(),
        source,
    }
}

/// Why a session ended early.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed frame: {0}")]
    FrameDecode(#[from] FrameDecodeError),

    #[error("project '{0}' not found")]
    ProjectNotFound(ProjectName),

    #[error("authentication failed for user '{0}'")]
    AuthFailed(UserName),

    #[error("storage unavailable: {0}")]
    Storage(StoreError),

    #[error("client did not acknowledge change {id} in time")]
    CatchupTimeout { id: ChangeId },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Wire code sent to the client before closing.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::FrameDecode(_) => ErrorCode::FrameDecode,
            SessionError::ProjectNotFound(_) => ErrorCode::ProjectNotFound,
            SessionError::AuthFailed(_) => ErrorCode::AuthFailed,
            SessionError::Storage(_) => ErrorCode::StorageUnavailable,
            SessionError::CatchupTimeout { .. } => ErrorCode::CatchupTimeout,
            SessionError::Protocol(_) | SessionError::ShuttingDown | SessionError::Io(_) => {
                ErrorCode::Protocol
            }
        }
    }

    /// Whether the connection may still accept an error frame.
    pub fn connection_usable(&self) -> bool {
        !matches!(self, SessionError::Io(_))
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProjectNotFound(name) => SessionError::ProjectNotFound(name),
            other => SessionError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_project_maps_to_project_not_found() {
        let err = SessionError::from(StoreError::ProjectNotFound(ProjectName::from("gone")));
        assert_eq!(err.code(), ErrorCode::ProjectNotFound);
    }

    #[test]
    fn io_errors_skip_the_error_frame() {
        let err = SessionError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!err.connection_usable());
        assert!(SessionError::ShuttingDown.connection_usable());
    }
}
