//! Container orchestration on top of a [`ContainerEngine`].
//!
//! The orchestrator owns the engine, the tracked-container registry and the
//! image resolver. It enforces the two container invariants:
//!
//! - a container is created only after its image is present locally
//! - every created container stays tracked until a confirmed stop or exit

use crate::engine::{drain, ContainerEngine, ExecOutput};
use crate::error::{DockerError, Result};
use crate::image::ImageResolver;
use crate::registry::ContainerRegistry;
use crate::runner::Runner;
use crate::spec::ContainerSpec;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;

/// Drives container lifecycles. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<ContainerRegistry>,
    images: Arc<ImageResolver>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("images", &self.images)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<ContainerRegistry>,
        images: Arc<ImageResolver>,
    ) -> Self {
        Self {
            engine,
            registry,
            images,
        }
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// The tracked-container registry.
    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    /// The image resolver.
    pub fn images(&self) -> &ImageResolver {
        &self.images
    }

    /// Make sure `image` is present locally, pulling it if needed.
    ///
    /// Returns `true` if a pull happened.
    pub async fn ensure_image(&self, image: &str) -> Result<bool> {
        if self.engine.image_exists(image).await? {
            tracing::debug!(%image, "Image present, skipping pull");
            return Ok(false);
        }

        let start = Instant::now();
        let reference = self.images.pull_reference(image).await;
        self.engine
            .pull_image(&reference)
            .await
            .map_err(|e| match e {
                e @ DockerError::ImagePull { .. } => e,
                other => DockerError::pull(&reference, other),
            })?;
        if reference != image {
            self.engine.tag_image(&reference, image).await?;
        }

        tracing::info!(
            %image,
            %reference,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Image pulled"
        );
        Ok(true)
    }

    /// Create a container and start tracking it.
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if self.registry.is_shutting_down() {
            return Err(DockerError::create(&spec.name, "shutdown in progress"));
        }
        spec.validate()?;
        self.ensure_image(&spec.image).await?;

        let id = self.engine.create_container(spec).await?;
        self.registry.track(&spec.name).await;
        tracing::debug!(container = %spec.name, %id, "Container created");
        Ok(id)
    }

    /// Run a one-shot container to completion.
    ///
    /// Creates, attaches, registers for the exit, starts, writes `stdin`
    /// (then closes it), and waits. Output is collected separately per stream.
    pub async fn run(&self, spec: &ContainerSpec, stdin: Option<Bytes>) -> Result<ExecOutput> {
        let start = Instant::now();
        self.create(spec).await?;

        let result = self.attach_and_wait(spec, stdin).await;

        match &result {
            Ok(output) if spec.auto_remove => {
                self.registry.untrack(&spec.name).await;
                tracing::debug!(
                    container = %spec.name,
                    exit_code = output.exit_code,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Container exited"
                );
            }
            _ => {
                if let Err(e) = self.stop(&spec.name).await {
                    tracing::warn!(container = %spec.name, error = %e, "Failed to clean up container");
                }
            }
        }
        result
    }

    async fn attach_and_wait(&self, spec: &ContainerSpec, stdin: Option<Bytes>) -> Result<ExecOutput> {
        let io = self.engine.attach_container(&spec.name).await?;
        let exit = self.engine.wait_container(&spec.name).await?;
        self.engine.start_container(&spec.name).await?;

        let mut input = io.input;
        let feed = async move {
            if let Some(event) = stdin {
                input.write_all(&event).await?;
            }
            input.shutdown().await?;
            Ok::<_, DockerError>(())
        };

        let (_, (stdout, stderr), exit_code) = tokio::try_join!(
            feed,
            drain(io.output),
            exit
        )?;

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Start a long-lived container and return a handle to it.
    ///
    /// Any existing container with the same name is stopped first.
    pub async fn start(&self, spec: &ContainerSpec) -> Result<Runner> {
        let start = Instant::now();
        self.stop_stale(&spec.name).await?;

        let id = self.create(spec).await?;
        if let Err(e) = self.engine.start_container(&spec.name).await {
            if let Err(stop_err) = self.stop(&spec.name).await {
                tracing::warn!(container = %spec.name, error = %stop_err, "Failed to clean up container");
            }
            return Err(e);
        }

        tracing::info!(
            container = %spec.name,
            image = %spec.image,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Runner started"
        );
        Ok(Runner::new(spec.name.clone(), id, spec.image.clone(), self.clone()))
    }

    /// Stop a container and stop tracking it once the stop is confirmed.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.engine.stop_container(name).await?;
        self.registry.untrack(name).await;
        tracing::debug!(container = %name, "Container stopped");
        Ok(())
    }

    /// Stop a leftover container with this name, if one exists.
    pub async fn stop_stale(&self, name: &str) -> Result<()> {
        if self.engine.container_exists(name).await? {
            tracing::info!(container = %name, "Stopping stale container");
            self.stop(name).await?;
        }
        Ok(())
    }

    /// Stop every tracked container.
    ///
    /// Runs once per process; later calls return `Ok(0)`. Individual
    /// failures are logged and the remaining containers are still stopped.
    pub async fn stop_all(&self) -> Result<usize> {
        if !self.registry.begin_shutdown() {
            tracing::debug!("Shutdown already in progress");
            return Ok(0);
        }

        let names = self.registry.tracked().await;
        let total = names.len();
        if total > 0 {
            tracing::info!(count = total, "Stopping tracked containers");
        }

        let mut failed = 0;
        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::error!(container = %name, error = %e, "Failed to stop container");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(DockerError::Shutdown { failed, total });
        }
        Ok(total)
    }
}
