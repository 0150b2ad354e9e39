//! # fclocal-core
//!
//! Local invocation engine for serverless functions.
//!
//! Runs a function inside a container built from its managed runtime image,
//! speaking the runtime adapter's stdin/stdout protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        fclocal-core                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  InvocationSpec ──▶ Invoker<S: InvokeStrategy>               │
//! │                      init: MountPlan + EnvVars + handle      │
//! │                      before_invoke / do_invoke / after       │
//! │                          │                                   │
//! │         ┌────────────────┼──────────────────┐                │
//! │         ▼                ▼                  ▼                │
//! │   DirectInvoke       ApiInvoke          HttpInvoke           │
//! │   (one-shot/reuse)   (one-shot)         (persistent)         │
//! │         │                │                  │                │
//! │         │                │          RunnerController ◀── CodeWatcher
//! │         │                │          (Mutex<Runner>)          │
//! │         ▼                ▼                  ▼                │
//! │   ┌────────────────────────────────────────────────┐        │
//! │   │        Orchestrator (fclocal-docker)           │        │
//! │   └────────────────────────────────────────────────┘        │
//! │                          │ stdout                            │
//! │                          ▼                                   │
//! │                 OutputDecoder ──▶ ResponseEnvelope           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use fclocal_core::{DirectInvoke, InvocationSpec, InvokeRequest, Invoker, LocalSettings, Runtime};
//! use std::sync::Arc;
//!
//! # async fn example(orchestrator: fclocal_docker::Orchestrator) -> fclocal_core::Result<()> {
//! let spec = InvocationSpec::builder("demo", "hello", Runtime::Nodejs8)
//!     .handler("index.handler")
//!     .code_uri("/home/me/demo/hello")
//!     .build()?;
//!
//! let invoker = Invoker::new(
//!     spec,
//!     Arc::new(LocalSettings::default()),
//!     orchestrator,
//!     DirectInvoke::one_shot(),
//! );
//!
//! let outcome = invoker.invoke(InvokeRequest::new("{\"key\":\"value\"}")).await?;
//! println!("{}", String::from_utf8_lossy(&outcome.stdout));
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Mount Planning**: Code, shared storage, temp and debugger mounts; archives extracted on the fly
//! - **Environment**: Library paths, debugger bootstrap, credentials, function metadata
//! - **Wire Protocol**: Sentinel-delimited response and execution-info sections
//! - **Three Trigger Styles**: Direct, API and HTTP invocations over one lifecycle driver
//! - **Warm Runners**: One serialized container per function, replaced on code change

mod config;
mod controller;
mod debug;
mod env;
mod error;
mod handle;
mod invoke;
mod mounts;
mod protocol;
mod runtime;
mod watch;

pub use config::{
    Credentials, DebugConfig, DebugIde, InvocationSpec, InvocationSpecBuilder, LocalSettings,
    NasConfig, NasMountPoint, ReuseKey, DEFAULT_INITIALIZATION_TIMEOUT, DEFAULT_MEMORY_SIZE,
    DEFAULT_TIMEOUT,
};
pub use controller::{ControllerSet, RunnerController};
pub use debug::{debug_env, exposes_port, vscode_launch_config};
pub use env::{build_env, EnvOptions, EnvVars, HTTP_PARAMS_ENV};
pub use error::{CoreError, Result};
pub use handle::{
    exec_cmd, invoke_cmd, random_container_name, resolve_exec_user, reuse_container_name,
    CommandOptions, ContainerHandle, ExecStage,
};
pub use invoke::{
    ApiInvoke, ContainerLayout, DirectInvoke, HttpInvoke, InvokeContext, InvokeKind,
    InvokeOutcome, InvokeRequest, InvokeStrategy, Invoker, LifecycleState, Prepared,
};
pub use mounts::{
    nas_mappings, prepare_code, to_virtualbox_path, CodeAccess, CodeSource, MountPlan, NasMapping,
    AUTO_NAS_MOUNT_DIR, CODE_MOUNT_TARGET,
};
pub use protocol::{
    parse_http_response, unhandled_error_body, DecodedOutput, HttpParams, InvocationErrorKind,
    OutputDecoder, ResponseEnvelope, SentinelDecoder, TriggerResponseParams, EXECUTION_INFO_BEGIN,
    EXECUTION_INFO_END, HTTP_PARAMS_HEADER, RESPONSE_BEGIN, RESPONSE_END,
};
pub use runtime::Runtime;
pub use watch::{run_reload_loop, CodeWatcher, IgnoreRules, Reload, DEFAULT_DEBOUNCE};
