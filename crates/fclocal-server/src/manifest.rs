//! Function manifest produced by template resolution.
//!
//! ```json
//! {
//!   "baseDir": "/home/me/demo",
//!   "functions": [{
//!     "serviceName": "demo",
//!     "functionName": "hello",
//!     "codeUri": "./hello",
//!     "properties": { "Runtime": "nodejs8", "Handler": "index.handler" },
//!     "service": { "NasConfig": "Auto" },
//!     "events": {
//!       "web": { "Type": "HTTP", "Properties": { "AuthType": "ANONYMOUS", "Methods": ["GET"] } }
//!     }
//!   }]
//! }
//! ```

use crate::error::{Result, ServerError};
use fclocal_core::{DebugConfig, InvocationSpec, NasConfig, NasMountPoint, Runtime};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Every function the server knows about.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Directory relative code URIs are resolved against.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    pub functions: Vec<FunctionDef>,
}

/// One function definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDef {
    pub service_name: String,
    pub function_name: String,
    /// Falls back to `properties.CodeUri`, then the base directory.
    #[serde(default)]
    pub code_uri: Option<PathBuf>,
    pub properties: FunctionProperties,
    #[serde(default)]
    pub service: ServiceProperties,
    #[serde(default)]
    pub events: BTreeMap<String, EventDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionProperties {
    pub runtime: Runtime,
    pub handler: String,
    #[serde(default)]
    pub code_uri: Option<PathBuf>,
    #[serde(default)]
    pub initializer: Option<String>,
    #[serde(default)]
    pub initialization_timeout: Option<u32>,
    #[serde(default)]
    pub memory_size: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceProperties {
    #[serde(default)]
    pub nas_config: Option<NasDef>,
    #[serde(default)]
    pub log_config: Option<LogDef>,
}

/// `"Auto"` or an explicit mount list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NasDef {
    Sentinel(String),
    Explicit(ExplicitNas),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExplicitNas {
    #[serde(default)]
    pub user_id: Option<u32>,
    #[serde(default)]
    pub group_id: Option<u32>,
    #[serde(default)]
    pub mount_points: Vec<MountPointDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPointDef {
    pub server_addr: String,
    pub mount_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogDef {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub logstore: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventDef {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub properties: TriggerProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TriggerProperties {
    #[serde(default)]
    pub auth_type: Option<String>,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// An HTTP trigger attached to a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTrigger {
    pub name: String,
    /// Upper-cased allowed methods.
    pub methods: Vec<String>,
    pub anonymous: bool,
}

impl HttpTrigger {
    pub fn allows(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

impl Manifest {
    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let mut manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| ServerError::Manifest(format!("{}: {e}", path.display())))?;
        let base_dir = match manifest.base_dir.take() {
            Some(dir) => dir,
            None => path.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        manifest.base_dir = Some(if base_dir.is_absolute() {
            base_dir
        } else {
            std::env::current_dir()?.join(base_dir)
        });
        Ok(manifest)
    }

    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn find(&self, service: &str, function: &str) -> Option<&FunctionDef> {
        self.functions
            .iter()
            .find(|f| f.service_name == service && f.function_name == function)
    }
}

impl FunctionDef {
    /// Code location resolved against `base_dir`.
    pub fn code_path(&self, base_dir: &Path) -> PathBuf {
        match self.code_uri.as_ref().or(self.properties.code_uri.as_ref()) {
            Some(uri) if uri.is_absolute() => uri.clone(),
            Some(uri) => base_dir.join(uri),
            None => base_dir.to_path_buf(),
        }
    }

    /// The first HTTP trigger, if any.
    pub fn http_trigger(&self) -> Option<HttpTrigger> {
        self.events
            .iter()
            .find(|(_, event)| event.kind.eq_ignore_ascii_case("HTTP"))
            .map(|(name, event)| HttpTrigger {
                name: name.clone(),
                methods: event
                    .properties
                    .methods
                    .iter()
                    .map(|m| m.to_ascii_uppercase())
                    .collect(),
                anonymous: event
                    .properties
                    .auth_type
                    .as_deref()
                    .is_some_and(|t| t.eq_ignore_ascii_case("ANONYMOUS")),
            })
    }

    fn nas(&self) -> Result<Option<NasConfig>> {
        match &self.service.nas_config {
            None => Ok(None),
            Some(NasDef::Sentinel(s)) if s.eq_ignore_ascii_case("auto") => Ok(Some(NasConfig::Auto)),
            Some(NasDef::Sentinel(other)) => Err(ServerError::Manifest(format!(
                "{}/{}: unknown NasConfig {other:?}",
                self.service_name, self.function_name
            ))),
            Some(NasDef::Explicit(nas)) => Ok(Some(NasConfig::Explicit {
                user_id: nas.user_id,
                group_id: nas.group_id,
                mount_points: nas
                    .mount_points
                    .iter()
                    .map(|mp| NasMountPoint {
                        server_addr: mp.server_addr.clone(),
                        mount_dir: mp.mount_dir.clone(),
                    })
                    .collect(),
            })),
        }
    }

    /// Build the invocation spec for this function.
    pub fn to_spec(&self, base_dir: &Path, debug: DebugConfig, reuse: bool) -> Result<InvocationSpec> {
        let props = &self.properties;
        let mut builder = InvocationSpec::builder(&self.service_name, &self.function_name, props.runtime)
            .handler(&props.handler)
            .code_uri(self.code_path(base_dir))
            .env_vars(props.environment_variables.clone())
            .debug(debug)
            .reuse(reuse);

        if let Some(initializer) = &props.initializer {
            builder = builder.initializer(initializer);
        }
        if let Some(secs) = props.initialization_timeout {
            builder = builder.initialization_timeout(secs);
        }
        if let Some(mb) = props.memory_size {
            builder = builder.memory_size(mb);
        }
        if let Some(secs) = props.timeout {
            builder = builder.timeout(secs);
        }
        if let Some(nas) = self.nas()? {
            builder = builder.nas(nas);
        }
        if let Some(LogDef {
            project: Some(project),
            logstore: Some(store),
        }) = &self.service.log_config
        {
            builder = builder.log_config(project, store);
        }

        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "functions": [{
            "serviceName": "demo",
            "functionName": "hello",
            "codeUri": "./hello",
            "properties": {
                "Runtime": "python3",
                "Handler": "index.handler",
                "Initializer": "index.init",
                "MemorySize": 256,
                "EnvironmentVariables": { "STAGE": "dev", "RETRIES": 3 }
            },
            "service": {
                "NasConfig": {
                    "UserId": 1000,
                    "GroupId": 1000,
                    "MountPoints": [{ "ServerAddr": "abc.cn-hangzhou.nas.aliyuncs.com:/share", "MountDir": "/mnt/share" }]
                },
                "LogConfig": { "Project": "p", "Logstore": "s" }
            },
            "events": {
                "web": { "Type": "HTTP", "Properties": { "AuthType": "ANONYMOUS", "Methods": ["get", "POST"] } },
                "tick": { "Type": "Timer" }
            }
        }, {
            "serviceName": "demo",
            "functionName": "auto",
            "properties": { "Runtime": "nodejs8", "Handler": "index.handler" },
            "service": { "NasConfig": "Auto" }
        }]
    }"#;

    fn manifest() -> Manifest {
        serde_json::from_str(MANIFEST).unwrap()
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = manifest();
        assert_eq!(manifest.functions.len(), 2);
        assert!(manifest.find("demo", "hello").is_some());
        assert!(manifest.find("demo", "missing").is_none());
    }

    #[test]
    fn test_to_spec() {
        let manifest = manifest();
        let def = manifest.find("demo", "hello").unwrap();
        let spec = def
            .to_spec(Path::new("/base"), DebugConfig::default(), false)
            .unwrap();

        assert_eq!(spec.runtime, Runtime::Python3);
        assert_eq!(spec.code_uri, PathBuf::from("/base/./hello"));
        assert_eq!(spec.initializer.as_deref(), Some("index.init"));
        assert_eq!(spec.memory_size, 256);
        assert_eq!(spec.env_vars["RETRIES"], serde_json::json!(3));
        assert_eq!(spec.log_project.as_deref(), Some("p"));
        assert_eq!(spec.nas.as_ref().and_then(NasConfig::owner), Some((1000, 1000)));
    }

    #[test]
    fn test_auto_nas_and_default_code_uri() {
        let manifest = manifest();
        let def = manifest.find("demo", "auto").unwrap();
        let spec = def
            .to_spec(Path::new("/base"), DebugConfig::default(), true)
            .unwrap();

        assert_eq!(spec.nas, Some(NasConfig::Auto));
        assert_eq!(spec.code_uri, PathBuf::from("/base"));
        assert!(spec.reuse);
        assert!(def.http_trigger().is_none());
    }

    #[test]
    fn test_http_trigger() {
        let manifest = manifest();
        let trigger = manifest.find("demo", "hello").unwrap().http_trigger().unwrap();

        assert_eq!(trigger.name, "web");
        assert_eq!(trigger.methods, vec!["GET", "POST"]);
        assert!(trigger.anonymous);
        assert!(trigger.allows("get"));
        assert!(!trigger.allows("DELETE"));
    }

    #[test]
    fn test_unknown_nas_sentinel_rejected() {
        let raw = r#"{
            "serviceName": "demo", "functionName": "f",
            "properties": { "Runtime": "nodejs8", "Handler": "index.handler" },
            "service": { "NasConfig": "Manual" }
        }"#;
        let def: FunctionDef = serde_json::from_str(raw).unwrap();
        let err = def
            .to_spec(Path::new("/base"), DebugConfig::default(), false)
            .unwrap_err();
        assert!(matches!(err, ServerError::Manifest(_)));
    }

    #[test]
    fn test_unknown_runtime_rejected() {
        let raw = r#"{
            "serviceName": "demo", "functionName": "f",
            "properties": { "Runtime": "cobol", "Handler": "index.handler" }
        }"#;
        assert!(serde_json::from_str::<FunctionDef>(raw).is_err());
    }

    #[test]
    fn test_load_sets_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fclocal.json");
        std::fs::write(&path, MANIFEST).unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.base_dir(), dir.path());
    }
}
