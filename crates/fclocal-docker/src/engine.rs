//! The container engine seam.
//!
//! [`ContainerEngine`] is the narrow set of primitives the orchestrator
//! composes into `run`/`start`/`stop`. [`DockerEngine`](crate::DockerEngine)
//! implements it against the Docker API; tests substitute an in-memory engine.

use crate::error::Result;
use crate::spec::{ContainerSpec, ExecSpec};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use std::pin::Pin;
use tokio::io::AsyncWrite;

/// One demultiplexed chunk of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// Bytes written to the container's stdout.
    Stdout(Bytes),
    /// Bytes written to the container's stderr.
    Stderr(Bytes),
}

/// Streams obtained by attaching to a created container.
pub struct AttachedIo {
    /// Demultiplexed stdout/stderr until the container exits.
    pub output: BoxStream<'static, Result<OutputChunk>>,
    /// The container's stdin. Shut it down to signal end of input.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for AttachedIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedIo").finish_non_exhaustive()
    }
}

/// Pending exit of a container, registered before it starts.
pub type ExitWait = BoxFuture<'static, Result<i64>>;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code.
    pub exit_code: i64,
    /// Everything written to stdout.
    pub stdout: Bytes,
    /// Everything written to stderr.
    pub stderr: Bytes,
}

impl ExecOutput {
    /// Whether the process exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Low-level container primitives.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Whether an image with exactly this reference is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull `reference` (`[registry/]repo:tag`).
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Add `target` as an additional name for `source`.
    async fn tag_image(&self, source: &str, target: &str) -> Result<()>;

    /// Create a container. Returns the engine's container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Attach to stdin/stdout/stderr of a created container.
    async fn attach_container(&self, name: &str) -> Result<AttachedIo>;

    /// Start a created container.
    async fn start_container(&self, name: &str) -> Result<()>;

    /// Register for the container's next exit. Call before
    /// [`start_container`](Self::start_container) so a fast exit of an
    /// auto-removed container is not missed; the returned future resolves
    /// to the exit code.
    async fn wait_container(&self, name: &str) -> Result<ExitWait>;

    /// Run a command in a running container, feeding `stdin` if given.
    async fn exec(&self, name: &str, exec: &ExecSpec, stdin: Option<Bytes>) -> Result<ExecOutput>;

    /// Stop and remove a container. A missing container is not an error.
    async fn stop_container(&self, name: &str) -> Result<()>;

    /// Whether a container with this name currently exists.
    async fn container_exists(&self, name: &str) -> Result<bool>;
}

/// Collect a demultiplexed stream into separate stdout and stderr buffers.
pub async fn drain(mut output: BoxStream<'static, Result<OutputChunk>>) -> Result<(Bytes, Bytes)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(chunk) = output.next().await {
        match chunk? {
            OutputChunk::Stdout(b) => stdout.extend_from_slice(&b),
            OutputChunk::Stderr(b) => stderr.extend_from_slice(&b),
        }
    }
    Ok((Bytes::from(stdout), Bytes::from(stderr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_separates_streams() {
        let chunks = vec![
            Ok(OutputChunk::Stdout(Bytes::from_static(b"a"))),
            Ok(OutputChunk::Stderr(Bytes::from_static(b"oops"))),
            Ok(OutputChunk::Stdout(Bytes::from_static(b"b"))),
        ];
        let (out, err) = drain(futures::stream::iter(chunks).boxed()).await.unwrap();
        assert_eq!(&out[..], b"ab");
        assert_eq!(&err[..], b"oops");
    }
}
