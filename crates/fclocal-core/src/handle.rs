//! Container identity for an invocation: name, image, user and creation options.

use crate::config::{InvocationSpec, NasConfig};
use fclocal_docker::ContainerSpec;

/// uid/gid the sandbox runs as when the host ids can't be used.
pub const NAS_UID: u32 = 10003;
pub const NAS_GID: u32 = 10003;

/// Command that starts the runtime's adapter as a long-lived server.
pub const SERVER_CMD: &str = "--server";

/// What the container is being created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStage {
    /// Running function code.
    Run,
    /// Building or installing dependencies into the code directory.
    Build,
}

/// A generated container identity plus the options used to create it.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub container_name: String,
    pub image_name: String,
    pub exec_user: String,
    pub creation: ContainerSpec,
}

impl ContainerHandle {
    /// Creation options with one extra environment variable appended.
    pub fn with_env(&self, key: &str, value: &str) -> ContainerSpec {
        let mut spec = self.creation.clone();
        spec.env.retain(|kv| !kv.starts_with(&format!("{key}=")));
        spec.env.push(format!("{key}={value}"));
        spec
    }
}

/// Unique name for a one-shot container.
pub fn random_container_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "fclocal_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        &suffix[..7]
    )
}

/// Deterministic name for the persistent container of a function.
///
/// A restarted server finds and stops a leftover instance by this name.
pub fn reuse_container_name(service_name: &str, function_name: &str, debug_port: Option<u16>) -> String {
    let base: String = format!("fclocal-{service_name}-{function_name}")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let suffix = if debug_port.is_some() { "debug" } else { "run" };
    format!("{base}-{suffix}")
}

#[cfg(target_os = "linux")]
fn host_ids() -> Option<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self")
        .ok()
        .map(|meta| (meta.uid(), meta.gid()))
}

#[cfg(not(target_os = "linux"))]
fn host_ids() -> Option<(u32, u32)> {
    None
}

/// `uid:gid` the sandbox process runs as.
///
/// On Linux the host ids are used so files written to bind mounts stay
/// owned by the developer. Elsewhere run containers use the storage owner
/// (or the storage default) and build containers run as root.
pub fn resolve_exec_user(nas: Option<&NasConfig>, stage: ExecStage) -> String {
    let (uid, gid) = host_ids().unwrap_or_else(|| fallback_ids(nas, stage));
    format!("{uid}:{gid}")
}

fn fallback_ids(nas: Option<&NasConfig>, stage: ExecStage) -> (u32, u32) {
    match stage {
        ExecStage::Run => nas.and_then(NasConfig::owner).unwrap_or((NAS_UID, NAS_GID)),
        ExecStage::Build => (0, 0),
    }
}

/// Flags for an adapter invocation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOptions {
    /// Response is a full HTTP message (HTTP triggers).
    pub http: bool,
    /// Run the initializer before the handler.
    pub invoke_initializer: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            http: false,
            invoke_initializer: true,
        }
    }
}

/// Arguments telling the runtime adapter what to invoke.
///
/// The event is always read from stdin.
pub fn invoke_cmd(spec: &InvocationSpec, options: CommandOptions) -> Vec<String> {
    let mut cmd = vec!["-h".to_string(), spec.handler.clone(), "--stdin".to_string()];
    if options.http {
        cmd.push("--http".to_string());
    }
    if let Some(initializer) = spec.initializer.as_ref().filter(|_| options.invoke_initializer) {
        cmd.push("-i".to_string());
        cmd.push(initializer.clone());
    }
    if let Some(timeout) = spec.initialization_timeout {
        cmd.push("--initializationTimeout".to_string());
        cmd.push(timeout.to_string());
    }
    cmd
}

/// Command run inside a persistent container for one invocation.
pub fn exec_cmd(spec: &InvocationSpec, options: CommandOptions) -> Vec<String> {
    let mut cmd = vec![spec.runtime.mock_script()];
    cmd.extend(invoke_cmd(spec, options));
    cmd
}
