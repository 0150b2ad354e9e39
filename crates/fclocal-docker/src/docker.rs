//! [`ContainerEngine`] implementation over the Docker Engine API.

use crate::engine::{drain, AttachedIo, ContainerEngine, ExecOutput, ExitWait, OutputChunk};
use crate::error::{DockerError, Result};
use crate::spec::{ContainerSpec, ExecSpec};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, ContainerWaitResponse, HostConfig, Mount, MountTypeEnum, PortBinding,
};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    InspectContainerOptions, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder, TagImageOptionsBuilder, WaitContainerOptionsBuilder,
};
use bollard::Docker;
use bytes::Bytes;
use futures::future::FutureExt;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;

/// Seconds docker waits for a container to exit before killing it.
const STOP_TIMEOUT_SECS: i32 = 3;

/// Docker-backed container engine.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let (repo, tag) = split_reference(reference);
        tracing::info!(image = %reference, "Pulling image");

        let mut progress = self.docker.create_image(
            Some(
                CreateImageOptionsBuilder::new()
                    .from_image(repo)
                    .tag(tag)
                    .build(),
            ),
            None,
            None,
        );

        while let Some(info) = progress.next().await {
            let info = info.map_err(|e| DockerError::pull(reference, e))?;
            if let Some(status) = info.status {
                tracing::debug!(image = %reference, id = ?info.id, %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        let (repo, tag) = split_reference(target);
        self.docker
            .tag_image(
                source,
                Some(TagImageOptionsBuilder::new().repo(repo).tag(tag).build()),
            )
            .await
            .map_err(|e| DockerError::pull(source, e))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        spec.validate()?;
        let body = create_body(spec);
        tracing::debug!(container = %spec.name, image = %spec.image, cmd = ?spec.cmd, "Creating container");

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|e| DockerError::create(&spec.name, e))?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, %warning, "Docker warning");
        }
        Ok(response.id)
    }

    async fn attach_container(&self, name: &str) -> Result<AttachedIo> {
        let attached = self
            .docker
            .attach_container(
                name,
                Some(
                    AttachContainerOptionsBuilder::new()
                        .stdin(true)
                        .stdout(true)
                        .stderr(true)
                        .stream(true)
                        .logs(true)
                        .build(),
                ),
            )
            .await
            .map_err(|e| DockerError::create(name, e))?;

        Ok(AttachedIo {
            output: demux(attached.output),
            input: attached.input,
        })
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(|e| DockerError::create(name, e))
    }

    async fn wait_container(&self, name: &str) -> Result<ExitWait> {
        let docker = self.docker.clone();
        let owned = name.to_string();
        let task = tokio::spawn(async move {
            let waits = docker.wait_container(
                &owned,
                Some(WaitContainerOptionsBuilder::new().condition("next-exit").build()),
            );
            exit_code_of(&owned, waits).await
        });
        // Give the wait request a chance to reach the daemon before start.
        tokio::task::yield_now().await;

        let name = name.to_string();
        Ok(async move { task.await.map_err(|e| DockerError::exec(&name, e))? }.boxed())
    }

    async fn exec(&self, name: &str, exec: &ExecSpec, stdin: Option<Bytes>) -> Result<ExecOutput> {
        let created = self
            .docker
            .create_exec(
                name,
                CreateExecOptions::<String> {
                    cmd: Some(exec.cmd.clone()),
                    env: (!exec.env.is_empty()).then(|| exec.env.clone()),
                    user: exec.user.clone(),
                    attach_stdin: Some(stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| DockerError::exec(name, e))?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| DockerError::exec(name, e))?;

        let (stdout, stderr) = match started {
            StartExecResults::Attached { output, mut input } => {
                let feed = async move {
                    if let Some(payload) = stdin {
                        input.write_all(&payload).await?;
                    }
                    input.shutdown().await?;
                    Ok::<_, DockerError>(())
                };
                let (_, collected) = tokio::try_join!(feed, drain(demux(output)))
                    .map_err(|e| DockerError::exec(name, e))?;
                collected
            }
            StartExecResults::Detached => {
                return Err(DockerError::exec(name, "exec started detached"));
            }
        };

        let inspected = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(|e| DockerError::exec(name, e))?;

        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        match self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptionsBuilder::new().t(STOP_TIMEOUT_SECS).build()),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) || is_not_modified(&e) => {}
            Err(e) => return Err(DockerError::stop(name, e)),
        }

        // Auto-removed containers may already be gone.
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) || is_conflict(&e) => Ok(()),
            Err(e) => Err(DockerError::stop(name, e)),
        }
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Translate a [`ContainerSpec`] into a Docker create body.
fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let mounts = spec
        .mounts
        .iter()
        .map(|m| Mount {
            typ: Some(MountTypeEnum::BIND),
            source: Some(m.source.to_string_lossy().into_owned()),
            target: Some(m.target.clone()),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    let (exposed_ports, port_bindings) = match spec.exposed_port {
        Some(port) => {
            let key = format!("{port}/tcp");
            let exposed = HashMap::from([(key.clone(), HashMap::new())]);
            let bindings = HashMap::from([(
                key,
                Some(vec![PortBinding {
                    host_ip: Some(String::new()),
                    host_port: Some(port.to_string()),
                }]),
            )]);
            (Some(exposed), Some(bindings))
        }
        None => (None, None),
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        entrypoint: spec.entrypoint.clone(),
        cmd: Some(spec.cmd.clone()),
        env: Some(spec.env.clone()),
        user: spec.user.clone(),
        attach_stdin: Some(spec.open_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(spec.open_stdin),
        stdin_once: Some(spec.open_stdin),
        tty: Some(false),
        exposed_ports,
        host_config: Some(HostConfig {
            auto_remove: Some(spec.auto_remove),
            mounts: Some(mounts),
            port_bindings,
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

/// Read the exit code off a wait stream.
///
/// A 404 means the container was removed before the wait was registered.
/// Its exit status is lost, so that is an error rather than a clean exit.
async fn exit_code_of<S>(name: &str, waits: S) -> Result<i64>
where
    S: futures::Stream<Item = std::result::Result<ContainerWaitResponse, BollardError>>,
{
    let mut waits = std::pin::pin!(waits);
    let mut exit_code = None;
    while let Some(next) = waits.next().await {
        match next {
            Ok(response) => exit_code = Some(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Err(BollardError::DockerContainerWaitError { code, .. }) => exit_code = Some(code),
            Err(e) if is_not_found(&e) => {
                return Err(DockerError::exec(name, "container removed before its exit was observed"));
            }
            Err(e) => return Err(e.into()),
        }
    }
    exit_code.ok_or_else(|| DockerError::exec(name, "wait ended without an exit status"))
}

/// Map bollard's multiplexed log frames onto [`OutputChunk`]s.
fn demux<S>(output: S) -> BoxStream<'static, Result<OutputChunk>>
where
    S: futures::Stream<Item = std::result::Result<LogOutput, BollardError>> + Send + 'static,
{
    output
        .map_err(DockerError::from)
        .try_filter_map(|frame| async move {
            Ok(match frame {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    Some(OutputChunk::Stdout(message))
                }
                LogOutput::StdErr { message } => Some(OutputChunk::Stderr(message)),
                LogOutput::StdIn { .. } => None,
            })
        })
        .boxed()
}

/// Split `registry/repo:tag` into `(registry/repo, tag)`; the tag defaults to `latest`.
pub(crate) fn split_reference(reference: &str) -> (&str, &str) {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => (&reference[..name_start + i], &reference[name_start + i + 1..]),
        None => (reference, "latest"),
    }
}

fn status_code(error: &BollardError) -> Option<u16> {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn is_not_found(error: &BollardError) -> bool {
    status_code(error) == Some(404)
}

fn is_not_modified(error: &BollardError) -> bool {
    status_code(error) == Some(304)
}

// 409 is returned while an auto-removal is already in progress.
fn is_conflict(error: &BollardError) -> bool {
    status_code(error) == Some(409)
}
