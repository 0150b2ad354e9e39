//! HTTP trigger invocations served from a persistent runner.
//!
//! With a debug port set, each request instead gets its own container under
//! the function's debug name, since a debugger attaches to one process.

use super::{ContainerLayout, InvokeContext, InvokeKind, InvokeOutcome, InvokeRequest, InvokeStrategy};
use crate::config::InvocationSpec;
use crate::controller::RunnerController;
use crate::env::{EnvOptions, HTTP_PARAMS_ENV};
use crate::error::Result;
use crate::handle::{exec_cmd, invoke_cmd, reuse_container_name, CommandOptions, SERVER_CMD};
use async_trait::async_trait;
use fclocal_docker::ExecSpec;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HttpInvoke {
    controller: Arc<RunnerController>,
    debug: bool,
}

impl HttpInvoke {
    /// `debug` bypasses the runner; pass `spec.debug.is_enabled()`.
    pub fn new(controller: Arc<RunnerController>, debug: bool) -> Self {
        Self { controller, debug }
    }
}

#[async_trait]
impl InvokeStrategy for HttpInvoke {
    fn kind(&self) -> InvokeKind {
        InvokeKind::Http
    }

    fn layout(&self, spec: &InvocationSpec) -> ContainerLayout {
        let name = reuse_container_name(&spec.service_name, &spec.function_name, spec.debug.port);
        if self.debug {
            ContainerLayout {
                name,
                entrypoint: None,
                cmd: invoke_cmd(
                    spec,
                    CommandOptions {
                        http: true,
                        invoke_initializer: true,
                    },
                ),
                open_stdin: true,
            }
        } else {
            ContainerLayout {
                name,
                entrypoint: Some(vec![spec.runtime.mock_script()]),
                cmd: vec![SERVER_CMD.to_string()],
                open_stdin: false,
            }
        }
    }

    fn persistent(&self) -> bool {
        !self.debug
    }

    fn runner_controller(&self) -> Option<&Arc<RunnerController>> {
        (!self.debug).then_some(&self.controller)
    }

    fn env_options(&self) -> EnvOptions {
        EnvOptions { http_trigger: true }
    }

    async fn before_invoke(&self, ctx: &InvokeContext<'_>) -> Result<()> {
        if !self.debug {
            self.controller.ensure(&ctx.prepared.handle.creation).await?;
        }
        Ok(())
    }

    async fn do_invoke(&self, ctx: &InvokeContext<'_>, request: InvokeRequest) -> Result<InvokeOutcome> {
        let params = request.http_params;

        let output = if self.debug {
            let spec = match &params {
                Some(params) => ctx.prepared.handle.with_env(HTTP_PARAMS_ENV, params),
                None => ctx.one_shot_spec(None),
            };
            ctx.orchestrator.stop_stale(&spec.name).await?;
            ctx.orchestrator.run(&spec, Some(request.event)).await?
        } else {
            let user = ctx.prepared.handle.exec_user.clone();
            self.controller
                .execute(
                    &ctx.prepared.handle.creation,
                    |invoke_initializer| {
                        let options = CommandOptions {
                            http: true,
                            invoke_initializer,
                        };
                        let exec = ExecSpec {
                            user: Some(user),
                            ..ExecSpec::new(exec_cmd(ctx.spec, options))
                        };
                        match &params {
                            Some(params) => exec.env_var(HTTP_PARAMS_ENV, params),
                            None => exec,
                        }
                    },
                    Some(request.event),
                )
                .await?
        };

        Ok(InvokeOutcome::decoded(output, ctx.decoder))
    }
}
