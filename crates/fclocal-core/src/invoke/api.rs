//! API-style invocations: the HTTP body is the event, the function's
//! response body is returned opaque.

use super::{ContainerLayout, InvokeContext, InvokeKind, InvokeOutcome, InvokeRequest, InvokeStrategy};
use crate::config::InvocationSpec;
use crate::env::EnvOptions;
use crate::error::Result;
use crate::handle::{invoke_cmd, random_container_name, CommandOptions};
use async_trait::async_trait;

/// One container per request, code mounted read-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiInvoke;

#[async_trait]
impl InvokeStrategy for ApiInvoke {
    fn kind(&self) -> InvokeKind {
        InvokeKind::Api
    }

    fn layout(&self, spec: &InvocationSpec) -> ContainerLayout {
        ContainerLayout {
            name: random_container_name(),
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
    }

    fn env_options(&self) -> EnvOptions {
        EnvOptions { http_trigger: true }
    }

    async fn do_invoke(&self, ctx: &InvokeContext<'_>, request: InvokeRequest) -> Result<InvokeOutcome> {
        let spec = ctx.one_shot_spec(Some(random_container_name()));
        let output = ctx.orchestrator.run(&spec, Some(request.event)).await?;
        Ok(InvokeOutcome::decoded(output, ctx.decoder))
    }
}
