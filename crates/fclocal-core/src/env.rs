//! Sandbox environment assembly.
//!
//! Variables are layered in a fixed order, later layers overriding earlier
//! ones: library paths from `ld.so.conf.d`, debugger bootstrap, function
//! variables, function metadata and credentials, then the derived
//! `PATH`-style variables.

use crate::config::{InvocationSpec, LocalSettings, NasConfig, DEFAULT_INITIALIZATION_TIMEOUT};
use crate::debug::debug_env;
use crate::error::Result;
use crate::mounts::AUTO_NAS_MOUNT_DIR;
use crate::runtime::Runtime;
use serde_json::Value;
use std::path::Path;

/// Variable carrying base64 HTTP call metadata into the sandbox.
pub const HTTP_PARAMS_ENV: &str = "FC_HTTP_PARAMS";

/// Prefix under `/code` where installed dependencies live.
const CODE_DEPS_PREFIX: &str = "/code/.fun";

const SYS_LIBS: [&str; 6] = [
    "/usr/local/lib",
    "/usr/lib",
    "/usr/lib/x86_64-linux-gnu",
    "/usr/lib64",
    "/lib",
    "/lib/x86_64-linux-gnu",
];

const FC_LIBS: [&str; 3] = ["/code", "/code/lib", "/usr/local/lib"];

const SYS_PATHS: [&str; 6] = [
    "/usr/local/bin",
    "/usr/local/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/sbin",
    "/bin",
];

const FC_PATHS: [&str; 2] = ["/code", "/code/node_modules/.bin"];

const DEPS_PATHS: [&str; 2] = ["/python/bin", "/node_modules/.bin"];

const NAS_PYTHON_PATHS: [&str; 2] = [
    "/python/lib/python2.7/site-packages",
    "/python/lib/python3.6/site-packages",
];

/// Ordered environment. Setting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars {
    entries: Vec<(String, String)>,
}

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, keeping its original position if already present.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set every pair in order.
    pub fn extend<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.set(k, v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `KEY=VALUE` strings for the container engine.
    pub fn to_docker_env(&self) -> Vec<String> {
        self.entries.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Render a function-declared value as the scalar string the sandbox expects.
///
/// `null` values are dropped; arrays and objects are passed as JSON text.
pub fn env_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Mount directories of the storage config, as seen from the sandbox.
pub fn nas_mount_dirs(nas: &NasConfig) -> Vec<String> {
    match nas {
        NasConfig::Auto => vec![AUTO_NAS_MOUNT_DIR.to_string()],
        NasConfig::Explicit { mount_points, .. } => {
            mount_points.iter().map(|mp| mp.mount_dir.clone()).collect()
        }
    }
}

/// `LD_LIBRARY_PATH` built from `<code>/.fun/root/etc/ld.so.conf.d/*.conf`.
///
/// Each absolute path line is rebased under `/code/.fun/root`.
pub async fn ld_conf_library_path(code_dir: &Path) -> Result<Option<String>> {
    let conf_dir = code_dir.join(".fun/root/etc/ld.so.conf.d");
    match tokio::fs::symlink_metadata(&conf_dir).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return Ok(None),
    }

    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(&conf_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "conf") {
            files.push(path);
        }
    }
    files.sort();

    let mut paths = Vec::new();
    for file in files {
        let content = tokio::fs::read_to_string(&file).await?;
        paths.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| line.starts_with('/'))
                .map(|line| format!("{CODE_DEPS_PREFIX}/root{line}")),
        );
    }

    if paths.is_empty() {
        return Ok(None);
    }
    Ok(Some(paths.join(":")))
}

/// Join path lists, dropping repeated entries (first occurrence wins).
fn union_paths<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for part in parts {
        for entry in part.split(':') {
            if !seen.contains(&entry) {
                seen.push(entry);
            }
        }
    }
    seen.join(":")
}

fn prepend_existing(env: &EnvVars, key: &str, generated: Vec<String>) -> String {
    let existing = env.get(key).filter(|v| !v.is_empty());
    union_paths(existing.into_iter().chain(generated.iter().map(String::as_str)))
}

fn library_path(env: &EnvVars, prefix: &str) -> String {
    let generated = SYS_LIBS
        .iter()
        .map(|p| format!("{prefix}/root{p}"))
        .chain(FC_LIBS.iter().map(|p| p.to_string()))
        .collect();
    prepend_existing(env, "LD_LIBRARY_PATH", generated)
}

fn exec_path(env: &EnvVars, prefix: &str) -> String {
    let generated = SYS_PATHS
        .iter()
        .map(|p| format!("{prefix}/root{p}"))
        .chain(FC_PATHS.iter().map(|p| p.to_string()))
        .chain(DEPS_PATHS.iter().map(|p| format!("{prefix}{p}")))
        .chain(SYS_PATHS.iter().map(|p| p.to_string()))
        .collect();
    prepend_existing(env, "PATH", generated)
}

fn node_path(env: &EnvVars, prefix: &str) -> String {
    let generated = vec![
        format!("{prefix}/node_modules"),
        "/usr/local/lib/node_modules".to_string(),
    ];
    prepend_existing(env, "NODE_PATH", generated)
}

/// Add library, executable and module search paths for dependencies
/// installed under `/code/.fun` and under each storage mount directory.
pub fn add_search_paths(env: &mut EnvVars, nas_mount_dirs: &[String]) {
    let lib = library_path(env, CODE_DEPS_PREFIX);
    env.set("LD_LIBRARY_PATH", lib);
    let path = exec_path(env, CODE_DEPS_PREFIX);
    env.set("PATH", path);
    let node = node_path(env, "/code");
    env.set("NODE_PATH", node);

    let python_base = format!("{CODE_DEPS_PREFIX}/python");
    if env.get("PYTHONUSERBASE").map_or(true, str::is_empty) {
        env.set("PYTHONUSERBASE", python_base.clone());
    }
    if env.get("PYTHONPATH").map_or(true, str::is_empty) {
        env.set(
            "PYTHONPATH",
            format!("{python_base}/lib/python/site-packages"),
        );
    }

    for dir in nas_mount_dirs {
        let lib = library_path(env, dir);
        env.set("LD_LIBRARY_PATH", lib);
        let path = exec_path(env, dir);
        env.set("PATH", path);
        let node = node_path(env, dir);
        env.set("NODE_PATH", node);

        let nas_python = NAS_PYTHON_PATHS
            .iter()
            .map(|p| format!("{dir}{p}"))
            .collect::<Vec<_>>()
            .join(":");
        let python_path = match env.get("PYTHONPATH").filter(|v| !v.is_empty()) {
            Some(existing) => format!("{existing}:{nas_python}"),
            None => nas_python,
        };
        env.set("PYTHONPATH", python_path);
    }
}

/// Options that vary between trigger styles.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOptions {
    /// The invocation originates from an HTTP trigger.
    pub http_trigger: bool,
}

/// Build the sandbox environment for `spec`.
///
/// `code_dir` is the resolved host code directory, used to find
/// `ld.so.conf.d` entries. Per-request `FC_HTTP_PARAMS` is added by callers.
pub async fn build_env(
    spec: &InvocationSpec,
    settings: &LocalSettings,
    code_dir: &Path,
    options: EnvOptions,
) -> Result<EnvVars> {
    let mut env = EnvVars::new();

    if let Some(lib_path) = ld_conf_library_path(code_dir).await? {
        env.set("LD_LIBRARY_PATH", lib_path);
    }

    if let Some(args) = spec.debug.debug_args.as_deref() {
        env.set("DEBUG_OPTIONS", args);
    } else if let Some(port) = spec.debug.port {
        env.extend(debug_env(
            spec.runtime,
            port,
            spec.debug.ide,
            &settings.debug_host,
        )?);
    }

    if options.http_trigger && spec.runtime.is_java() {
        env.set("fc_enable_new_java_ca", "true");
    }

    for (key, value) in &spec.env_vars {
        if let Some(value) = env_value(value) {
            env.set(key.as_str(), value);
        }
    }

    let creds = &settings.credentials;
    env.set("local", "true");
    env.set("FC_ACCESS_KEY_ID", creds.access_key_id.as_str());
    env.set("FC_ACCESS_KEY_SECRET", creds.access_key_secret.as_str());
    if let Some(token) = &creds.security_token {
        env.set("FC_SECURITY_TOKEN", token.as_str());
    }
    // sandbox images read the misspelled name
    env.set("FC_ACCOUND_ID", creds.account_id.as_str());
    env.set("FC_REGION", creds.region.as_str());
    env.set("FC_FUNCTION_NAME", spec.function_name.as_str());
    env.set("FC_HANDLER", spec.handler.as_str());
    env.set("FC_MEMORY_SIZE", spec.memory_size.to_string());
    env.set("FC_TIMEOUT", spec.timeout.to_string());
    if let Some(initializer) = &spec.initializer {
        env.set("FC_INITIALIZER", initializer.as_str());
    }
    env.set(
        "FC_INITIALIZATIONTIMEOUT",
        spec.initialization_timeout
            .unwrap_or(DEFAULT_INITIALIZATION_TIMEOUT)
            .to_string(),
    );
    env.set("FC_SERVICE_NAME", spec.service_name.as_str());
    if let Some(project) = &spec.log_project {
        env.set("FC_SERVICE_LOG_PROJECT", project.as_str());
    }
    if let Some(store) = &spec.log_store {
        env.set("FC_SERVICE_LOG_STORE", store.as_str());
    }

    if spec.runtime == Runtime::Custom {
        if let Some(bootstrap) = env.get("BOOTSTRAP_FILE").map(str::to_string) {
            env.set("AGENT_SCRIPT", bootstrap);
        }
    }

    let nas_dirs = spec.nas.as_ref().map(nas_mount_dirs).unwrap_or_default();
    add_search_paths(&mut env, &nas_dirs);

    tracing::debug!(
        service = %spec.service_name,
        function = %spec.function_name,
        vars = env.len(),
        "Sandbox environment built"
    );
    Ok(env)
}
