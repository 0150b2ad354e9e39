//! Error types for fclocal-docker.

use thiserror::Error;

/// Result type alias for fclocal-docker operations.
pub type Result<T> = std::result::Result<T, DockerError>;

/// Errors that can occur while driving the container engine.
#[derive(Debug, Error)]
pub enum DockerError {
    /// Failed to pull or tag a runtime image
    #[error("failed to pull image {image}: {message}")]
    ImagePull {
        /// Image reference that was being pulled
        image: String,
        /// Underlying failure
        message: String,
    },

    /// Failed to create, attach to, or start a container
    #[error("failed to create container {name}: {message}")]
    ContainerCreate {
        /// Container name
        name: String,
        /// Underlying failure
        message: String,
    },

    /// Failed to run a command inside a container
    #[error("failed to exec in container {name}: {message}")]
    ContainerExec {
        /// Container name
        name: String,
        /// Underlying failure
        message: String,
    },

    /// Failed to stop a container
    #[error("failed to stop container {name}: {message}")]
    ContainerStop {
        /// Container name
        name: String,
        /// Underlying failure
        message: String,
    },

    /// One or more tracked containers could not be stopped during shutdown
    #[error("failed to stop {failed} of {total} tracked containers")]
    Shutdown {
        /// Number of stop calls that failed
        failed: usize,
        /// Number of containers that were tracked
        total: usize,
    },

    /// Invalid container or exec configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Docker API error
    #[error("docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// I/O error while streaming container stdio
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl DockerError {
    pub(crate) fn create(name: &str, err: impl std::fmt::Display) -> Self {
        Self::ContainerCreate {
            name: name.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn exec(name: &str, err: impl std::fmt::Display) -> Self {
        Self::ContainerExec {
            name: name.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn stop(name: &str, err: impl std::fmt::Display) -> Self {
        Self::ContainerStop {
            name: name.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn pull(image: &str, err: impl std::fmt::Display) -> Self {
        Self::ImagePull {
            image: image.to_string(),
            message: err.to_string(),
        }
    }
}
