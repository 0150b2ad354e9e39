//! Invocation configuration types.

use crate::error::{CoreError, Result};
use crate::runtime::Runtime;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Default function memory in MB.
pub const DEFAULT_MEMORY_SIZE: u32 = 128;

/// Default function timeout in seconds.
pub const DEFAULT_TIMEOUT: u32 = 3;

/// Default initializer timeout in seconds.
pub const DEFAULT_INITIALIZATION_TIMEOUT: u32 = 3;

/// Credentials injected into the sandbox and used to verify request signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Credentials {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub security_token: Option<String>,
    pub account_id: String,
    pub region: String,
}

/// IDE a debugger session is set up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugIde {
    VsCode,
    PyCharm,
}

impl DebugIde {
    /// Parse an IDE name (case-insensitive).
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vscode" => Ok(Self::VsCode),
            "pycharm" => Ok(Self::PyCharm),
            other => Err(CoreError::Config(format!(
                "unknown debug IDE {other:?}, expected one of [\"vscode\", \"pycharm\"]"
            ))),
        }
    }
}

impl fmt::Display for DebugIde {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VsCode => write!(f, "vscode"),
            Self::PyCharm => write!(f, "pycharm"),
        }
    }
}

/// Debugger settings for an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugConfig {
    /// Port the in-sandbox debugger listens on (published on the host).
    pub port: Option<u16>,
    /// IDE the session is for.
    pub ide: Option<DebugIde>,
    /// Host directory with debugger binaries, mounted at `/tmp/debugger_files`.
    pub debugger_path: Option<PathBuf>,
    /// Raw debugger flags, used verbatim as `DEBUG_OPTIONS`.
    pub debug_args: Option<String>,
}

impl DebugConfig {
    /// Whether a debugger will attach to the sandbox.
    pub fn is_enabled(&self) -> bool {
        self.port.is_some()
    }
}

/// One network file share mounted into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NasMountPoint {
    /// `host:/remote/path`.
    pub server_addr: String,
    /// Absolute mount directory inside the sandbox.
    pub mount_dir: String,
}

/// Shared storage attached to a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasConfig {
    /// Provisioned automatically; one synthetic mount at `/mnt/auto`.
    Auto,
    /// Explicit mount points.
    Explicit {
        user_id: Option<u32>,
        group_id: Option<u32>,
        mount_points: Vec<NasMountPoint>,
    },
}

impl NasConfig {
    /// `uid:gid` configured for the share, if any.
    pub fn owner(&self) -> Option<(u32, u32)> {
        match self {
            Self::Explicit {
                user_id: Some(uid),
                group_id: Some(gid),
                ..
            } => Some((*uid, *gid)),
            _ => None,
        }
    }
}

/// Identifies the persistent runner serving a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReuseKey {
    pub service_name: String,
    pub function_name: String,
    pub debug_port: Option<u16>,
}

/// Everything needed to invoke one function locally. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationSpec {
    pub service_name: String,
    pub function_name: String,
    pub runtime: Runtime,
    pub handler: String,
    pub initializer: Option<String>,
    pub initialization_timeout: Option<u32>,
    pub memory_size: u32,
    pub timeout: u32,
    /// Absolute path to the code directory, archive, or single file.
    pub code_uri: PathBuf,
    /// Function-declared environment. Values may be any JSON scalar.
    pub env_vars: BTreeMap<String, Value>,
    pub nas: Option<NasConfig>,
    pub debug: DebugConfig,
    /// Serve invokes from a persistent container.
    pub reuse: bool,
    pub log_project: Option<String>,
    pub log_store: Option<String>,
}

impl InvocationSpec {
    /// Create a new spec builder.
    pub fn builder(
        service_name: impl Into<String>,
        function_name: impl Into<String>,
        runtime: Runtime,
    ) -> InvocationSpecBuilder {
        InvocationSpecBuilder::new(service_name, function_name, runtime)
    }

    /// Key of the persistent runner for this function.
    pub fn reuse_key(&self) -> ReuseKey {
        ReuseKey {
            service_name: self.service_name.clone(),
            function_name: self.function_name.clone(),
            debug_port: self.debug.port,
        }
    }

    /// Check required fields and debug/runtime combinations.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(CoreError::Config("service name is required".into()));
        }
        if self.function_name.trim().is_empty() {
            return Err(CoreError::Config("function name is required".into()));
        }
        if self.handler.trim().is_empty() {
            return Err(CoreError::Config("handler is required".into()));
        }
        if !self.code_uri.is_absolute() {
            return Err(CoreError::Config(format!(
                "code path must be absolute: {}",
                self.code_uri.display()
            )));
        }
        if self.memory_size == 0 || self.timeout == 0 {
            return Err(CoreError::Config(
                "memory size and timeout must be > 0".into(),
            ));
        }
        if self.debug.ide == Some(DebugIde::PyCharm) && !self.runtime.is_python() {
            return Err(CoreError::Config(format!(
                "pycharm debugging is only supported for python runtimes, not {}",
                self.runtime
            )));
        }
        if self.debug.port.is_some() && self.runtime == Runtime::Custom {
            return Err(CoreError::Config(format!(
                "debugging is not supported for runtime {}",
                self.runtime
            )));
        }
        if let Some(NasConfig::Explicit { mount_points, .. }) = &self.nas {
            for mp in mount_points {
                if !mp.mount_dir.starts_with('/') {
                    return Err(CoreError::Config(format!(
                        "nas mount dir must be absolute: {}",
                        mp.mount_dir
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`InvocationSpec`].
#[derive(Debug, Clone)]
pub struct InvocationSpecBuilder {
    spec: InvocationSpec,
}

impl InvocationSpecBuilder {
    fn new(service_name: impl Into<String>, function_name: impl Into<String>, runtime: Runtime) -> Self {
        Self {
            spec: InvocationSpec {
                service_name: service_name.into(),
                function_name: function_name.into(),
                runtime,
                handler: String::new(),
                initializer: None,
                initialization_timeout: None,
                memory_size: DEFAULT_MEMORY_SIZE,
                timeout: DEFAULT_TIMEOUT,
                code_uri: PathBuf::new(),
                env_vars: BTreeMap::new(),
                nas: None,
                debug: DebugConfig::default(),
                reuse: false,
                log_project: None,
                log_store: None,
            },
        }
    }

    /// Set the handler (`file.function`).
    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.spec.handler = handler.into();
        self
    }

    /// Set the initializer handler.
    pub fn initializer(mut self, initializer: impl Into<String>) -> Self {
        self.spec.initializer = Some(initializer.into());
        self
    }

    /// Set the initializer timeout in seconds.
    pub fn initialization_timeout(mut self, secs: u32) -> Self {
        self.spec.initialization_timeout = Some(secs);
        self
    }

    /// Set memory in MB.
    pub fn memory_size(mut self, mb: u32) -> Self {
        self.spec.memory_size = mb;
        self
    }

    /// Set the timeout in seconds.
    pub fn timeout(mut self, secs: u32) -> Self {
        self.spec.timeout = secs;
        self
    }

    /// Set the code location.
    pub fn code_uri(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.code_uri = path.into();
        self
    }

    /// Add one environment variable.
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.env_vars.insert(key.into(), value.into());
        self
    }

    /// Replace the environment.
    pub fn env_vars(mut self, vars: BTreeMap<String, Value>) -> Self {
        self.spec.env_vars = vars;
        self
    }

    /// Attach shared storage.
    pub fn nas(mut self, nas: NasConfig) -> Self {
        self.spec.nas = Some(nas);
        self
    }

    /// Set debugger settings.
    pub fn debug(mut self, debug: DebugConfig) -> Self {
        self.spec.debug = debug;
        self
    }

    /// Serve invokes from a persistent container.
    pub fn reuse(mut self, reuse: bool) -> Self {
        self.spec.reuse = reuse;
        self
    }

    /// Set the service log destination.
    pub fn log_config(mut self, project: impl Into<String>, store: impl Into<String>) -> Self {
        self.spec.log_project = Some(project.into());
        self.spec.log_store = Some(store.into());
        self
    }

    /// Build the [`InvocationSpec`], validating all required fields.
    pub fn build(self) -> Result<InvocationSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// Host-side settings shared by every invocation.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Root of the local directories backing shared storage.
    pub nas_base_dir: PathBuf,
    /// Host directory mounted at `/tmp`, if requested.
    pub tmp_dir: Option<PathBuf>,
    /// Docker runs inside a VirtualBox VM (legacy Docker Toolbox).
    pub docker_toolbox: bool,
    /// Credentials injected into the sandbox.
    pub credentials: Credentials,
    /// Address the sandbox uses to reach the host (php remote debugging).
    pub debug_host: String,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            nas_base_dir: PathBuf::from(".fun/nas"),
            tmp_dir: None,
            docker_toolbox: false,
            credentials: Credentials::default(),
            debug_host: "host.docker.internal".to_string(),
        }
    }
}
