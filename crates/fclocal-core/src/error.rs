//! Error types for fclocal-core.

use thiserror::Error;

/// Result type alias for fclocal-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while preparing or running an invocation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from the container layer (image pull, create, exec, stop)
    #[error(transparent)]
    Docker(#[from] fclocal_docker::DockerError),

    /// A mount could not be resolved (bad storage address, missing directory, bad archive)
    #[error("mount resolution failed: {0}")]
    MountResolution(String),

    /// Unknown or unsupported runtime identifier
    #[error("unsupported runtime: {0}")]
    InvalidRuntime(String),

    /// Invalid invocation or debug configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Sandbox output violated the wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Build container exited with a non-zero code
    #[error("build failed with exit code {0}")]
    BuildFailed(i64),

    /// Invalid lifecycle state for operation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Code directory watcher error
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether this error came from running a command in a container.
    pub fn is_exec_failure(&self) -> bool {
        matches!(
            self,
            Self::Docker(fclocal_docker::DockerError::ContainerExec { .. })
        )
    }
}
