//! Container and exec configuration types.

use crate::error::{DockerError, Result};
use std::path::PathBuf;

/// A single bind mount from the host into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Host path (already translated for the engine's filesystem view).
    pub source: PathBuf,
    /// Absolute path inside the container.
    pub target: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl MountSpec {
    /// Create a read-write bind mount.
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    /// Mark this mount read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name. Tracked by the registry from creation until stop.
    pub name: String,
    /// Image reference, e.g. `aliyunfc/runtime-nodejs8:1.9.13`.
    pub image: String,
    /// Entrypoint override. `None` keeps the image default.
    pub entrypoint: Option<Vec<String>>,
    /// Command arguments.
    pub cmd: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// User to run as (`uid:gid`).
    pub user: Option<String>,
    /// Bind mounts, in order.
    pub mounts: Vec<MountSpec>,
    /// Debug port to expose and bind on the host at the same number.
    pub exposed_port: Option<u16>,
    /// Attach stdin so an event can be written to it.
    pub open_stdin: bool,
    /// Remove the container once it exits.
    pub auto_remove: bool,
}

impl ContainerSpec {
    /// Create a new spec builder.
    pub fn builder(name: impl Into<String>, image: impl Into<String>) -> ContainerSpecBuilder {
        ContainerSpecBuilder::new(name, image)
    }

    /// Reject unusable container settings.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DockerError::Config("container name is required".into()));
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(DockerError::Config(format!(
                "container name must not contain whitespace: {:?}",
                self.name
            )));
        }
        if self.image.is_empty() {
            return Err(DockerError::Config("image is required".into()));
        }
        for mount in &self.mounts {
            if !mount.target.starts_with('/') {
                return Err(DockerError::Config(format!(
                    "mount target must be absolute: {}",
                    mount.target
                )));
            }
        }
        if self.exposed_port == Some(0) {
            return Err(DockerError::Config("exposed port must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`ContainerSpec`].
#[derive(Debug, Clone)]
pub struct ContainerSpecBuilder {
    spec: ContainerSpec,
}

impl ContainerSpecBuilder {
    /// Start a builder for a one-shot container that auto-removes on exit.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            spec: ContainerSpec {
                name: name.into(),
                image: image.into(),
                auto_remove: true,
                ..ContainerSpec::default()
            },
        }
    }

    /// Override the image entrypoint.
    pub fn entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.spec.entrypoint = Some(entrypoint);
        self
    }

    /// Set the command arguments.
    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.spec.cmd = cmd;
        self
    }

    /// Set the environment (`KEY=VALUE` entries).
    pub fn env(mut self, env: Vec<String>) -> Self {
        self.spec.env = env;
        self
    }

    /// Set the user the container process runs as.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.spec.user = Some(user.into());
        self
    }

    /// Append a bind mount.
    pub fn mount(mut self, mount: MountSpec) -> Self {
        self.spec.mounts.push(mount);
        self
    }

    /// Append several bind mounts.
    pub fn mounts(mut self, mounts: impl IntoIterator<Item = MountSpec>) -> Self {
        self.spec.mounts.extend(mounts);
        self
    }

    /// Expose and publish a debug port.
    pub fn expose_port(mut self, port: u16) -> Self {
        self.spec.exposed_port = Some(port);
        self
    }

    /// Keep stdin open for an event payload.
    pub fn open_stdin(mut self) -> Self {
        self.spec.open_stdin = true;
        self
    }

    /// Control removal on exit (default: true).
    pub fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.spec.auto_remove = auto_remove;
        self
    }

    /// Build the [`ContainerSpec`], validating all required fields.
    pub fn build(self) -> Result<ContainerSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// A command executed inside an already running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    /// Full command line, including the program.
    pub cmd: Vec<String>,
    /// Extra environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// User override for the exec'd process.
    pub user: Option<String>,
}

impl ExecSpec {
    /// Create an exec spec for `cmd`.
    pub fn new(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            ..Self::default()
        }
    }

    /// Add an environment variable.
    pub fn env_var(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_to_auto_remove() {
        let spec = ContainerSpec::builder("fclocal_1_abc", "aliyunfc/runtime-nodejs8:1.9.13")
            .build()
            .unwrap();
        assert!(spec.auto_remove);
        assert!(!spec.open_stdin);
        assert!(spec.exposed_port.is_none());
    }

    #[test]
    fn test_builder_rejects_whitespace_name() {
        let result = ContainerSpec::builder("fclocal svc fn", "img").build();
        assert!(matches!(result, Err(DockerError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_relative_mount() {
        let result = ContainerSpec::builder("c", "img")
            .mount(MountSpec::bind("/tmp/code", "code"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_keeps_mount_order() {
        let spec = ContainerSpec::builder("c", "img")
            .mount(MountSpec::bind("/src", "/code").read_only(true))
            .mount(MountSpec::bind("/nas", "/mnt/auto"))
            .build()
            .unwrap();
        let targets: Vec<_> = spec.mounts.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(targets, vec!["/code", "/mnt/auto"]);
        assert!(spec.mounts[0].read_only);
    }

    #[test]
    fn test_exec_env_var() {
        let exec = ExecSpec::new(vec!["/var/fc/runtime/nodejs8/mock".into()])
            .env_var("FC_HTTP_PARAMS", "e30=");
        assert_eq!(exec.env, vec!["FC_HTTP_PARAMS=e30="]);
    }
}
