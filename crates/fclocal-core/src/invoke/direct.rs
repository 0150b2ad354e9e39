//! Direct (CLI) invocations.

use super::{check_build, ContainerLayout, InvokeContext, InvokeKind, InvokeOutcome, InvokeRequest, InvokeStrategy};
use crate::config::InvocationSpec;
use crate::controller::RunnerController;
use crate::error::Result;
use crate::handle::{
    exec_cmd, invoke_cmd, random_container_name, reuse_container_name, CommandOptions, ExecStage,
    SERVER_CMD,
};
use crate::mounts::CodeAccess;
use async_trait::async_trait;
use fclocal_docker::{ExecSpec, ImageKind};
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Mode {
    /// Fresh container per call.
    OneShot,
    /// Exec inside a persistent runner.
    Reuse(Arc<RunnerController>),
    /// Run a command in the build image with writable code.
    Build(Vec<String>),
}

/// Runs the function with an event read from stdin and passes its output
/// through untouched.
#[derive(Debug, Clone)]
pub struct DirectInvoke {
    mode: Mode,
}

impl DirectInvoke {
    /// A container per call, removed on exit.
    pub fn one_shot() -> Self {
        Self { mode: Mode::OneShot }
    }

    /// Serve calls from the controller's persistent runner.
    pub fn reuse(controller: Arc<RunnerController>) -> Self {
        Self {
            mode: Mode::Reuse(controller),
        }
    }

    /// Run `cmd` in the build image with the code mounted read-write.
    /// A non-zero exit fails the invocation.
    pub fn build(cmd: Vec<String>) -> Self {
        Self {
            mode: Mode::Build(cmd),
        }
    }
}

#[async_trait]
impl InvokeStrategy for DirectInvoke {
    fn kind(&self) -> InvokeKind {
        InvokeKind::Direct
    }

    fn layout(&self, spec: &InvocationSpec) -> ContainerLayout {
        match &self.mode {
            Mode::OneShot => ContainerLayout {
                name: random_container_name(),
                entrypoint: None,
                cmd: invoke_cmd(spec, CommandOptions::default()),
                open_stdin: true,
            },
            Mode::Reuse(_) => ContainerLayout {
                name: reuse_container_name(&spec.service_name, &spec.function_name, spec.debug.port),
                entrypoint: Some(vec![spec.runtime.mock_script()]),
                cmd: vec![SERVER_CMD.to_string()],
                open_stdin: false,
            },
            Mode::Build(cmd) => ContainerLayout {
                name: random_container_name(),
                entrypoint: None,
                cmd: cmd.clone(),
                open_stdin: true,
            },
        }
    }

    fn persistent(&self) -> bool {
        matches!(self.mode, Mode::Reuse(_))
    }

    fn runner_controller(&self) -> Option<&Arc<RunnerController>> {
        match &self.mode {
            Mode::Reuse(controller) => Some(controller),
            _ => None,
        }
    }

    fn code_access(&self) -> CodeAccess {
        match self.mode {
            Mode::Build(_) => CodeAccess::ReadWrite,
            _ => CodeAccess::ReadOnly,
        }
    }

    fn image_kind(&self) -> ImageKind {
        match self.mode {
            Mode::Build(_) => ImageKind::Build,
            _ => ImageKind::Run,
        }
    }

    fn exec_stage(&self) -> ExecStage {
        match self.mode {
            Mode::Build(_) => ExecStage::Build,
            _ => ExecStage::Run,
        }
    }

    async fn before_invoke(&self, ctx: &InvokeContext<'_>) -> Result<()> {
        if let Mode::Reuse(controller) = &self.mode {
            controller.ensure(&ctx.prepared.handle.creation).await?;
        }
        Ok(())
    }

    async fn do_invoke(&self, ctx: &InvokeContext<'_>, request: InvokeRequest) -> Result<InvokeOutcome> {
        match &self.mode {
            Mode::OneShot | Mode::Build(_) => {
                let spec = ctx.one_shot_spec(Some(random_container_name()));
                let output = ctx.orchestrator.run(&spec, Some(request.event)).await?;
                if matches!(self.mode, Mode::Build(_)) {
                    check_build(&output)?;
                }
                Ok(InvokeOutcome::raw(output))
            }
            Mode::Reuse(controller) => {
                let user = ctx.prepared.handle.exec_user.clone();
                let output = controller
                    .execute(
                        &ctx.prepared.handle.creation,
                        |invoke_initializer| {
                            let options = CommandOptions {
                                http: false,
                                invoke_initializer,
                            };
                            ExecSpec {
                                user: Some(user),
                                ..ExecSpec::new(exec_cmd(ctx.spec, options))
                            }
                        },
                        Some(request.event),
                    )
                    .await?;
                Ok(InvokeOutcome::raw(output))
            }
        }
    }
}
