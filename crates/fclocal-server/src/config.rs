//! Configuration for the local server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use fclocal_core::{Credentials, DebugConfig, DebugIde};
use fclocal_docker::DEFAULT_IMAGE_VERSION;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum accepted request body (6 MB, the managed service's payload limit).
pub const MAX_BODY_BYTES: usize = 6 * 1024 * 1024;

/// What the binary does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    /// Serve HTTP triggers and API invocations (default).
    #[default]
    Serve,
    /// Invoke one function with an event read from stdin, then exit.
    Invoke,
}

impl ServerMode {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "invoke" => Self::Invoke,
            _ => Self::Serve,
        }
    }
}

/// Configuration for the fclocal binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Serve or one-shot invoke (default: serve).
    pub mode: ServerMode,

    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Function manifest produced by template resolution.
    pub manifest_path: PathBuf,

    /// `service/function` to run in invoke mode.
    pub function: Option<String>,

    /// Port the in-sandbox debugger listens on.
    pub debug_port: Option<u16>,

    /// IDE name for debugger setup, validated by [`ServerConfig::debug_config`].
    pub debug_ide: Option<String>,

    /// Host directory with debugger binaries.
    pub debugger_path: Option<PathBuf>,

    /// Raw debugger flags.
    pub debug_args: Option<String>,

    /// Host directory mounted at `/tmp`.
    pub tmp_dir: Option<PathBuf>,

    /// Replace runners when function code changes (default: true).
    pub watch: bool,

    /// Run direct invokes inside a persistent runner (default: false).
    pub reuse: bool,

    /// Docker runs inside a VirtualBox VM (default: false).
    pub docker_toolbox: bool,

    /// Runtime image version.
    pub image_version: String,

    /// Registry mirrors probed for image pulls.
    pub registry_mirrors: Vec<String>,

    /// Time allowed for stopping containers and draining the server.
    pub shutdown_grace: Duration,

    /// Credentials injected into sandboxes and used for signature checks.
    pub credentials: Credentials,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("manifest file not found: {0}")]
    MissingManifest(PathBuf),

    #[error("invoke mode needs FCLOCAL_FUNCTION=<service>/<function>")]
    MissingFunction,

    #[error("invalid function reference {0:?}, expected <service>/<function>")]
    InvalidFunction(String),

    #[error("unknown debug IDE {0:?}, expected vscode or pycharm")]
    InvalidDebugIde(String),

    #[error("debugger path not found: {0}")]
    MissingDebuggerPath(PathBuf),
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: ServerMode::Serve,
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8000),
            manifest_path: PathBuf::from("fclocal.json"),
            function: None,
            debug_port: None,
            debug_ide: None,
            debugger_path: None,
            debug_args: None,
            tmp_dir: None,
            watch: true,
            reuse: false,
            docker_toolbox: false,
            image_version: DEFAULT_IMAGE_VERSION.to_string(),
            registry_mirrors: Vec::new(),
            shutdown_grace: Duration::from_secs(5),
            credentials: Credentials::default(),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `FCLOCAL_MODE` | `serve` (serve, invoke) |
    /// | `FCLOCAL_HTTP_HOST` | `127.0.0.1` |
    /// | `FCLOCAL_HTTP_PORT` | `8000` |
    /// | `FCLOCAL_MANIFEST` | `fclocal.json` |
    /// | `FCLOCAL_FUNCTION` | - (`service/function`, invoke mode) |
    /// | `FCLOCAL_DEBUG_PORT` | - |
    /// | `FCLOCAL_DEBUG_IDE` | - (vscode, pycharm) |
    /// | `FCLOCAL_DEBUGGER_PATH` | - |
    /// | `FCLOCAL_DEBUG_ARGS` | - |
    /// | `FCLOCAL_TMP_DIR` | - |
    /// | `FCLOCAL_WATCH` | `true` |
    /// | `FCLOCAL_REUSE` | `false` |
    /// | `FCLOCAL_DOCKER_TOOLBOX` | `false` |
    /// | `FCLOCAL_IMAGE_VERSION` | `1.9.13` |
    /// | `FCLOCAL_REGISTRY_MIRRORS` | - (comma-separated hosts) |
    /// | `FCLOCAL_SHUTDOWN_GRACE_SECS` | `5` |
    /// | `FCLOCAL_ACCESS_KEY_ID` | - |
    /// | `FCLOCAL_ACCESS_KEY_SECRET` | - |
    /// | `FCLOCAL_SECURITY_TOKEN` | - |
    /// | `FCLOCAL_ACCOUNT_ID` | - |
    /// | `FCLOCAL_REGION` | - |
    pub fn from_env() -> Self {
        let default = Self::default();

        let http_host: IpAddr = std::env::var("FCLOCAL_HTTP_HOST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.ip());

        let http_port: u16 = std::env::var("FCLOCAL_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default.http_addr.port());

        Self {
            mode: std::env::var("FCLOCAL_MODE")
                .map(|v| ServerMode::parse(&v))
                .unwrap_or(default.mode),
            http_addr: SocketAddr::new(http_host, http_port),
            manifest_path: std::env::var("FCLOCAL_MANIFEST")
                .map(PathBuf::from)
                .unwrap_or(default.manifest_path),
            function: env_opt("FCLOCAL_FUNCTION"),
            debug_port: std::env::var("FCLOCAL_DEBUG_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
            debug_ide: env_opt("FCLOCAL_DEBUG_IDE"),
            debugger_path: env_opt("FCLOCAL_DEBUGGER_PATH").map(PathBuf::from),
            debug_args: env_opt("FCLOCAL_DEBUG_ARGS"),
            tmp_dir: env_opt("FCLOCAL_TMP_DIR").map(PathBuf::from),
            watch: env_flag("FCLOCAL_WATCH", default.watch),
            reuse: env_flag("FCLOCAL_REUSE", default.reuse),
            docker_toolbox: env_flag("FCLOCAL_DOCKER_TOOLBOX", default.docker_toolbox),
            image_version: env_opt("FCLOCAL_IMAGE_VERSION").unwrap_or(default.image_version),
            registry_mirrors: env_opt("FCLOCAL_REGISTRY_MIRRORS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            shutdown_grace: std::env::var("FCLOCAL_SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.shutdown_grace),
            credentials: Credentials {
                access_key_id: env_opt("FCLOCAL_ACCESS_KEY_ID").unwrap_or_default(),
                access_key_secret: env_opt("FCLOCAL_ACCESS_KEY_SECRET").unwrap_or_default(),
                security_token: env_opt("FCLOCAL_SECURITY_TOKEN"),
                account_id: env_opt("FCLOCAL_ACCOUNT_ID").unwrap_or_default(),
                region: env_opt("FCLOCAL_REGION").unwrap_or_default(),
            },
        }
    }

    /// Debugger settings for every function this process serves.
    pub fn debug_config(&self) -> Result<DebugConfig, ConfigError> {
        let ide = self
            .debug_ide
            .as_deref()
            .map(|name| DebugIde::parse(name).map_err(|_| ConfigError::InvalidDebugIde(name.to_string())))
            .transpose()?;
        Ok(DebugConfig {
            port: self.debug_port,
            ide,
            debugger_path: self.debugger_path.clone(),
            debug_args: self.debug_args.clone(),
        })
    }

    /// `(service, function)` selected for invoke mode.
    pub fn target_function(&self) -> Result<(String, String), ConfigError> {
        let reference = self.function.as_deref().ok_or(ConfigError::MissingFunction)?;
        match reference.split_once('/') {
            Some((service, function)) if !service.is_empty() && !function.is_empty() => {
                Ok((service.to_string(), function.to_string()))
            }
            _ => Err(ConfigError::InvalidFunction(reference.to_string())),
        }
    }

    /// Validate the configuration.
    ///
    /// Call this at startup to get clear error messages.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.manifest_path.exists() {
            return Err(ConfigError::MissingManifest(self.manifest_path.clone()));
        }

        if self.mode == ServerMode::Invoke {
            self.target_function()?;
        }

        self.debug_config()?;

        if let Some(path) = &self.debugger_path {
            if !path.exists() {
                return Err(ConfigError::MissingDebuggerPath(path.clone()));
            }
        }

        Ok(())
    }

    /// Log settings that are allowed but probably not intended.
    pub fn validate_warn(&self) {
        if self.credentials.access_key_id.is_empty() {
            tracing::warn!("No access key configured, non-anonymous triggers will reject every request");
        }

        if self.debug_port.is_some() && self.watch {
            tracing::warn!("Code watching has no effect while debugging, each request gets a fresh container");
        }

        if self.debug_ide.is_some() && self.debug_port.is_none() {
            tracing::warn!("FCLOCAL_DEBUG_IDE is set without FCLOCAL_DEBUG_PORT, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.mode, ServerMode::Serve);
        assert_eq!(config.http_addr.port(), 8000);
        assert_eq!(config.manifest_path, PathBuf::from("fclocal.json"));
        assert_eq!(config.image_version, "1.9.13");
        assert!(config.watch);
        assert!(!config.reuse);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(ServerMode::parse("invoke"), ServerMode::Invoke);
        assert_eq!(ServerMode::parse("INVOKE"), ServerMode::Invoke);
        assert_eq!(ServerMode::parse("serve"), ServerMode::Serve);
        assert_eq!(ServerMode::parse("anything"), ServerMode::Serve);
    }

    #[test]
    fn test_target_function() {
        let mut config = ServerConfig::default();
        assert!(matches!(config.target_function(), Err(ConfigError::MissingFunction)));

        config.function = Some("demo/hello".into());
        assert_eq!(
            config.target_function().unwrap(),
            ("demo".to_string(), "hello".to_string())
        );

        config.function = Some("demo".into());
        assert!(matches!(config.target_function(), Err(ConfigError::InvalidFunction(_))));
        config.function = Some("/hello".into());
        assert!(config.target_function().is_err());
    }

    #[test]
    fn test_debug_config() {
        let mut config = ServerConfig {
            debug_port: Some(9229),
            debug_ide: Some("VSCode".into()),
            ..Default::default()
        };
        let debug = config.debug_config().unwrap();
        assert_eq!(debug.port, Some(9229));
        assert_eq!(debug.ide, Some(DebugIde::VsCode));

        config.debug_ide = Some("vim".into());
        assert!(matches!(config.debug_config(), Err(ConfigError::InvalidDebugIde(_))));
    }

    #[test]
    fn test_validate_missing_manifest() {
        let config = ServerConfig {
            manifest_path: PathBuf::from("/nonexistent/fclocal.json"),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingManifest(_))));
    }

    #[test]
    fn test_from_env_uses_defaults() {
        std::env::remove_var("FCLOCAL_MODE");
        std::env::remove_var("FCLOCAL_HTTP_HOST");
        std::env::remove_var("FCLOCAL_HTTP_PORT");
        std::env::remove_var("FCLOCAL_MANIFEST");
        std::env::remove_var("FCLOCAL_WATCH");

        let config = ServerConfig::from_env();
        let default = ServerConfig::default();

        assert_eq!(config.mode, default.mode);
        assert_eq!(config.http_addr, default.http_addr);
        assert_eq!(config.manifest_path, default.manifest_path);
        assert_eq!(config.watch, default.watch);
    }
}
