//! Debugger bootstrap for sandboxed runtimes.
//!
//! Each runtime family attaches its debugger differently: node and java read
//! flags from `DEBUG_OPTIONS`, php reads `XDEBUG_CONFIG` and dials back to the
//! host, pycharm's python debugger connects out on its own.

use crate::config::{DebugConfig, DebugIde};
use crate::error::{CoreError, Result};
use crate::mounts::CODE_MOUNT_TARGET;
use crate::runtime::Runtime;
use serde_json::{json, Value};
use std::path::Path;

/// Environment variables that make the runtime wait for a debugger on `port`.
///
/// `debug_host` is the address the sandbox uses to reach the host, needed by
/// runtimes whose debugger connects outward.
pub fn debug_env(
    runtime: Runtime,
    port: u16,
    ide: Option<DebugIde>,
    debug_host: &str,
) -> Result<Vec<(String, String)>> {
    let var = |k: &str, v: String| vec![(k.to_string(), v)];

    let env = match runtime {
        Runtime::Nodejs8 | Runtime::Nodejs10 | Runtime::Nodejs12 => {
            var("DEBUG_OPTIONS", format!("--inspect-brk=0.0.0.0:{port}"))
        }
        Runtime::Nodejs6 => var("DEBUG_OPTIONS", format!("--debug-brk={port}")),
        Runtime::Python27 | Runtime::Python3 => {
            if ide == Some(DebugIde::PyCharm) {
                Vec::new()
            } else {
                var(
                    "DEBUG_OPTIONS",
                    format!("-m ptvsd --host 0.0.0.0 --port {port} --wait"),
                )
            }
        }
        Runtime::Java8 | Runtime::Java11 => var(
            "DEBUG_OPTIONS",
            format!("-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,quiet=y,address={port}"),
        ),
        Runtime::Php72 => {
            tracing::info!(remote_host = %debug_host, "Using xdebug remote host");
            var(
                "XDEBUG_CONFIG",
                format!(
                    "remote_enable=1 remote_autostart=1 remote_port={port} remote_host={debug_host}"
                ),
            )
        }
        Runtime::Dotnetcore21 => var("DEBUG_OPTIONS", "true".to_string()),
        Runtime::Custom => {
            return Err(CoreError::Config(format!(
                "debugging is not supported for runtime {runtime}"
            )))
        }
    };
    Ok(env)
}

/// Whether the debug port must be published from the container.
///
/// Pycharm and xdebug connect from the sandbox to the IDE, so nothing is
/// exposed for them.
pub fn exposes_port(runtime: Runtime, ide: Option<DebugIde>) -> bool {
    !(ide == Some(DebugIde::PyCharm) || runtime.is_php())
}

/// Port to publish for this debug configuration, if any.
pub fn published_port(runtime: Runtime, debug: &DebugConfig) -> Option<u16> {
    debug.port.filter(|_| exposes_port(runtime, debug.ide))
}

/// VS Code `launch.json` content for attaching to a debug session.
///
/// `code_path` may be a file; its directory is used as the local root.
/// Returns `None` for runtimes VS Code can't attach to.
pub fn vscode_launch_config(
    service_name: &str,
    function_name: &str,
    runtime: Runtime,
    code_path: &Path,
    port: u16,
) -> Option<Value> {
    let root = if code_path.is_dir() {
        code_path
    } else {
        code_path.parent().unwrap_or(code_path)
    };
    let root = root.display().to_string();
    let name = format!("fc/{service_name}/{function_name}");
    let node_protocol = if runtime == Runtime::Nodejs6 {
        "legacy"
    } else {
        "inspector"
    };

    let configuration = match runtime {
        Runtime::Nodejs6 | Runtime::Nodejs8 | Runtime::Nodejs10 | Runtime::Nodejs12 => json!({
            "name": name,
            "type": "node",
            "request": "attach",
            "address": "localhost",
            "port": port,
            "localRoot": root,
            "remoteRoot": CODE_MOUNT_TARGET,
            "protocol": node_protocol,
            "stopOnEntry": false,
        }),
        Runtime::Python27 | Runtime::Python3 => json!({
            "name": name,
            "type": "python",
            "request": "attach",
            "host": "localhost",
            "port": port,
            "pathMappings": [{ "localRoot": root, "remoteRoot": CODE_MOUNT_TARGET }],
        }),
        Runtime::Java8 | Runtime::Java11 => json!({
            "name": name,
            "type": "java",
            "request": "attach",
            "hostName": "localhost",
            "port": port,
        }),
        Runtime::Php72 => json!({
            "name": name,
            "type": "php",
            "request": "launch",
            "port": port,
            "stopOnEntry": false,
            "pathMappings": { CODE_MOUNT_TARGET: root },
            "ignore": ["/var/fc/runtime/**"],
        }),
        Runtime::Dotnetcore21 => {
            let attach = format!("docker exec -i $(docker ps -q -f publish={port}) ${{debuggerCommand}}");
            json!({
                "name": name,
                "type": "coreclr",
                "request": "attach",
                "processName": "dotnet",
                "pipeTransport": {
                    "pipeProgram": "sh",
                    "pipeArgs": ["-c", attach],
                    "debuggerPath": "/vsdbg/vsdbg",
                    "pipeCwd": "${workspaceFolder}",
                },
                "windows": {
                    "pipeTransport": {
                        "pipeProgram": "powershell",
                        "pipeArgs": ["-c", attach],
                        "debuggerPath": "/vsdbg/vsdbg",
                        "pipeCwd": "${workspaceFolder}",
                    }
                },
                "sourceFileMap": { CODE_MOUNT_TARGET: root },
            })
        }
        Runtime::Custom => return None,
    };

    Some(json!({
        "version": "0.2.0",
        "configurations": [configuration],
    }))
}

/// Log how to attach an IDE to the debug session that is about to start.
pub fn log_debug_tips(
    service_name: &str,
    function_name: &str,
    runtime: Runtime,
    code_path: &Path,
    debug: &DebugConfig,
) {
    let Some(port) = debug.port else { return };

    match debug.ide {
        Some(DebugIde::VsCode) => {
            let Some(config) =
                vscode_launch_config(service_name, function_name, runtime, code_path, port)
            else {
                return;
            };
            let rendered = serde_json::to_string_pretty(&config).unwrap_or_default();
            tracing::info!(
                "Paste this into .vscode/launch.json, then attach to the running function:\n{rendered}"
            );
        }
        Some(DebugIde::PyCharm) => {
            tracing::info!(
                port,
                local_root = %code_path.display(),
                remote_root = CODE_MOUNT_TARGET,
                "Start a PyCharm remote debug server on this port with path mapping local_root -> remote_root"
            );
        }
        None => {}
    }
}
