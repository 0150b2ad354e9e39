//! Handle to a long-lived container.

use crate::engine::ExecOutput;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::spec::ExecSpec;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Instant;

/// A started container that serves many invocations through `exec`.
///
/// The handle is owned: stopping consumes it, so a stopped runner can't be
/// exec'd against.
#[derive(Debug)]
pub struct Runner {
    name: String,
    id: String,
    image: String,
    started_at: DateTime<Utc>,
    orchestrator: Orchestrator,
}

impl Runner {
    pub(crate) fn new(name: String, id: String, image: String, orchestrator: Orchestrator) -> Self {
        Self {
            name,
            id,
            image,
            started_at: Utc::now(),
            orchestrator,
        }
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine container id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Image the container runs.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// When the container was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Run a command inside the container.
    pub async fn exec(&self, exec: &ExecSpec, stdin: Option<Bytes>) -> Result<ExecOutput> {
        let start = Instant::now();
        tracing::debug!(container = %self.name, cmd = ?exec.cmd, "Exec in runner");

        let output = self.orchestrator.engine().exec(&self.name, exec, stdin).await?;

        tracing::debug!(
            container = %self.name,
            exit_code = output.exit_code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Exec finished"
        );
        Ok(output)
    }

    /// Stop the container.
    pub async fn stop(self) -> Result<()> {
        tracing::info!(container = %self.name, "Stopping runner");
        self.orchestrator.stop(&self.name).await
    }
}
