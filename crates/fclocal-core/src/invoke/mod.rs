//! Invoke lifecycle.
//!
//! [`Invoker`] drives every invocation through the same sequence:
//!
//! ```text
//! init ──► before_invoke ──► do_invoke ──► after_invoke
//!  │                                          │
//!  └── computes mounts, env, image, handle ◄──┘ (one-shot with archive: re-init)
//! ```
//!
//! The variant-specific parts live behind [`InvokeStrategy`]:
//! [`DirectInvoke`], [`ApiInvoke`] and [`HttpInvoke`].

mod api;
mod direct;
mod http;

pub use api::ApiInvoke;
pub use direct::DirectInvoke;
pub use http::HttpInvoke;

use crate::config::{InvocationSpec, LocalSettings};
use crate::controller::RunnerController;
use crate::debug::{log_debug_tips, published_port};
use crate::env::{build_env, EnvOptions, EnvVars};
use crate::error::{CoreError, Result};
use crate::handle::{resolve_exec_user, ContainerHandle, ExecStage};
use crate::mounts::{nas_mappings, prepare_code, CodeAccess, CodeSource, MountPlan};
use crate::protocol::{DecodedOutput, OutputDecoder, SentinelDecoder};
use crate::watch::Reload;
use async_trait::async_trait;
use bytes::Bytes;
use fclocal_docker::{ContainerSpec, ExecOutput, ImageKind, Orchestrator};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Where an invoker is in its lifecycle.
///
/// With concurrent calls the state stays `Invoking` until the last one
/// finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Ready = 1,
    Invoking = 2,
    /// Finished a call and kept its container warm.
    Idle = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Invoking,
            3 => Self::Idle,
            _ => Self::Uninitialized,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Invoking => "invoking",
            Self::Idle => "idle",
        };
        f.write_str(s)
    }
}

/// Which trigger style a strategy implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    Direct,
    Api,
    Http,
}

/// Container shape a strategy asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLayout {
    pub name: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Vec<String>,
    /// Event is written to the container's stdin.
    pub open_stdin: bool,
}

/// Everything `init` computed. Shared by in-flight invocations.
///
/// An extracted code archive is removed when the last reference drops.
#[derive(Debug)]
pub struct Prepared {
    pub mounts: MountPlan,
    pub env: EnvVars,
    pub handle: ContainerHandle,
    pub code: CodeSource,
    /// The image had to be pulled during this init.
    pub pulled: bool,
}

/// One call's input.
#[derive(Debug, Clone, Default)]
pub struct InvokeRequest {
    /// Raw event bytes, written to the sandbox's stdin.
    pub event: Bytes,
    /// Base64 [`HttpParams`](crate::protocol::HttpParams), HTTP triggers only.
    pub http_params: Option<String>,
}

impl InvokeRequest {
    pub fn new(event: impl Into<Bytes>) -> Self {
        Self {
            event: event.into(),
            http_params: None,
        }
    }

    pub fn with_http_params(mut self, encoded: impl Into<String>) -> Self {
        self.http_params = Some(encoded.into());
        self
    }
}

/// One call's result.
#[derive(Debug, Clone, Default)]
pub struct InvokeOutcome {
    pub exit_code: i64,
    /// Raw sandbox stdout.
    pub stdout: Bytes,
    /// Raw sandbox stderr, never parsed.
    pub stderr: Bytes,
    /// Decoded response, for triggers that use the response protocol.
    pub decoded: Option<DecodedOutput>,
}

impl InvokeOutcome {
    /// Wrap container output without decoding it.
    pub fn raw(output: ExecOutput) -> Self {
        Self {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            decoded: None,
        }
    }

    /// Wrap container output and decode its response sections.
    ///
    /// Undecodable output yields an empty envelope so the caller reports a
    /// failed invocation instead of an internal error.
    pub fn decoded(output: ExecOutput, decoder: &dyn OutputDecoder) -> Self {
        let decoded = match decoder.decode(&output.stdout) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode sandbox output");
                DecodedOutput {
                    passthrough: String::from_utf8_lossy(&output.stdout)
                        .lines()
                        .map(str::to_string)
                        .collect(),
                    ..Default::default()
                }
            }
        };
        decoded.emit_diagnostics();
        Self {
            decoded: Some(decoded),
            ..Self::raw(output)
        }
    }
}

/// Inputs available to a strategy during a call.
pub struct InvokeContext<'a> {
    pub spec: &'a InvocationSpec,
    pub prepared: &'a Prepared,
    pub orchestrator: &'a Orchestrator,
    pub decoder: &'a dyn OutputDecoder,
}

impl InvokeContext<'_> {
    /// Creation options for a one-shot container, with a per-call name
    /// when the layout asks for a random one.
    pub fn one_shot_spec(&self, fresh_name: Option<String>) -> ContainerSpec {
        let mut spec = self.prepared.handle.creation.clone();
        if let Some(name) = fresh_name {
            spec.name = name;
        }
        spec
    }
}

/// The variant-specific part of the lifecycle.
#[async_trait]
pub trait InvokeStrategy: Send + Sync {
    fn kind(&self) -> InvokeKind;

    /// Container name, command and stdin mode for this spec.
    fn layout(&self, spec: &InvocationSpec) -> ContainerLayout;

    /// Keeps a container alive between calls.
    fn persistent(&self) -> bool {
        false
    }

    /// Controller of the persistent runner, if calls go through one.
    fn runner_controller(&self) -> Option<&Arc<RunnerController>> {
        None
    }

    fn code_access(&self) -> CodeAccess {
        CodeAccess::ReadOnly
    }

    fn image_kind(&self) -> ImageKind {
        ImageKind::Run
    }

    fn exec_stage(&self) -> ExecStage {
        ExecStage::Run
    }

    fn env_options(&self) -> EnvOptions {
        EnvOptions::default()
    }

    /// Runs after `init`, before every call.
    async fn before_invoke(&self, _ctx: &InvokeContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn do_invoke(&self, ctx: &InvokeContext<'_>, request: InvokeRequest) -> Result<InvokeOutcome>;
}

/// Shared lifecycle driver.
pub struct Invoker<S> {
    spec: InvocationSpec,
    settings: Arc<LocalSettings>,
    orchestrator: Orchestrator,
    strategy: S,
    decoder: Arc<dyn OutputDecoder>,
    state: AtomicU8,
    in_flight: AtomicUsize,
    prepared: Mutex<Option<Arc<Prepared>>>,
}

impl<S: InvokeStrategy> fmt::Debug for Invoker<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoker")
            .field("service", &self.spec.service_name)
            .field("function", &self.spec.function_name)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl<S: InvokeStrategy> Invoker<S> {
    pub fn new(
        spec: InvocationSpec,
        settings: Arc<LocalSettings>,
        orchestrator: Orchestrator,
        strategy: S,
    ) -> Self {
        Self {
            spec,
            settings,
            orchestrator,
            strategy,
            decoder: Arc::new(SentinelDecoder),
            state: AtomicU8::new(LifecycleState::Uninitialized as u8),
            in_flight: AtomicUsize::new(0),
            prepared: Mutex::new(None),
        }
    }

    /// Use a different output decoder.
    pub fn with_decoder(mut self, decoder: Arc<dyn OutputDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn spec(&self) -> &InvocationSpec {
        &self.spec
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Calls currently between `do_invoke` and `after_invoke`.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Set `state` unless other calls are still running.
    fn settle(&self, state: LifecycleState) {
        if self.in_flight() == 0 {
            self.set_state(state);
        }
    }

    /// Compute mounts and environment, make sure the image is present and
    /// generate the container handle.
    ///
    /// Idempotent: once ready, later calls return the same preparation.
    pub async fn init(&self) -> Result<Arc<Prepared>> {
        let mut slot = self.prepared.lock().await;
        if let Some(prepared) = slot.as_ref() {
            return Ok(prepared.clone());
        }

        let start = Instant::now();
        let spec = &self.spec;
        let settings = &self.settings;

        let code = prepare_code(&spec.code_uri).await?;
        let nas = match &spec.nas {
            Some(nas) => nas_mappings(nas, &settings.nas_base_dir, &spec.service_name)?,
            None => Vec::new(),
        };
        let mounts = MountPlan::build(
            &code,
            self.strategy.code_access(),
            &nas,
            settings,
            &spec.debug,
        )?;
        let env = build_env(spec, settings, code.dir(), self.strategy.env_options()).await?;

        let image = self
            .orchestrator
            .images()
            .image_name(spec.runtime.image_name(), self.strategy.image_kind());
        let pulled = self.orchestrator.ensure_image(&image).await?;

        let exec_user = resolve_exec_user(spec.nas.as_ref(), self.strategy.exec_stage());
        let layout = self.strategy.layout(spec);

        let mut builder = ContainerSpec::builder(layout.name.clone(), image.clone())
            .cmd(layout.cmd)
            .env(env.to_docker_env())
            .user(exec_user.clone())
            .mounts(mounts.mounts().iter().cloned());
        if let Some(entrypoint) = layout.entrypoint {
            builder = builder.entrypoint(entrypoint);
        }
        if layout.open_stdin {
            builder = builder.open_stdin();
        }
        if let Some(port) = published_port(spec.runtime, &spec.debug) {
            builder = builder.expose_port(port);
        }
        let creation = builder.build()?;

        log_debug_tips(
            &spec.service_name,
            &spec.function_name,
            spec.runtime,
            &spec.code_uri,
            &spec.debug,
        );

        let prepared = Arc::new(Prepared {
            mounts,
            env,
            handle: ContainerHandle {
                container_name: layout.name,
                image_name: image,
                exec_user,
                creation,
            },
            code,
            pulled,
        });

        tracing::info!(
            service = %spec.service_name,
            function = %spec.function_name,
            kind = ?self.strategy.kind(),
            image = %prepared.handle.image_name,
            mounts = prepared.mounts.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Invoker initialized"
        );

        *slot = Some(prepared.clone());
        self.settle(LifecycleState::Ready);
        Ok(prepared)
    }

    /// Run one invocation through the full lifecycle.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome> {
        let prepared = self.init().await?;
        let ctx = InvokeContext {
            spec: &self.spec,
            prepared: &prepared,
            orchestrator: &self.orchestrator,
            decoder: self.decoder.as_ref(),
        };

        self.strategy.before_invoke(&ctx).await?;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.set_state(LifecycleState::Invoking);
        let start = Instant::now();
        let result = self.strategy.do_invoke(&ctx, request).await;

        match &result {
            Ok(outcome) => tracing::debug!(
                function = %self.spec.function_name,
                exit_code = outcome.exit_code,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Invocation finished"
            ),
            Err(e) => tracing::warn!(
                function = %self.spec.function_name,
                error = %e,
                "Invocation failed"
            ),
        }

        drop(ctx);
        self.after_invoke(prepared).await;
        result
    }

    /// Release per-call state.
    ///
    /// One-shot invokers over an extracted archive drop their preparation so
    /// the directory is removed once in-flight calls finish; the next call
    /// initializes again.
    async fn after_invoke(&self, prepared: Arc<Prepared>) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.strategy.persistent() {
            self.settle(LifecycleState::Idle);
            return;
        }
        if prepared.code.is_extracted() {
            drop(prepared);
            self.release().await;
        } else {
            self.settle(LifecycleState::Ready);
        }
    }

    /// Drop the preparation. Extracted code is removed now if no call still
    /// uses it, otherwise when the last in-flight call finishes.
    pub async fn release(&self) {
        if let Some(prepared) = self.take_prepared().await {
            discard(prepared);
            tracing::debug!(function = %self.spec.function_name, "Invoker released");
        }
        self.settle(LifecycleState::Uninitialized);
    }

    async fn take_prepared(&self) -> Option<Arc<Prepared>> {
        self.prepared.lock().await.take()
    }

    /// Rebuild the preparation from the current code and restart the
    /// persistent runner from it.
    ///
    /// Mounts and environment are recomputed, so library paths from
    /// `ld.so.conf.d` follow the code. Returns `false` when no runner was
    /// active; invokers without a runner only drop their preparation.
    pub async fn refresh(&self) -> Result<bool> {
        if let Some(stale) = self.take_prepared().await {
            discard(stale);
        }
        let Some(controller) = self.strategy.runner_controller() else {
            self.settle(LifecycleState::Uninitialized);
            return Ok(false);
        };
        let prepared = self.init().await?;
        controller.replace_with(&prepared.handle.creation).await
    }

    /// Run the strategy's pre-call hook without invoking, e.g. to warm a
    /// persistent runner at server start.
    pub async fn warm_up(&self) -> Result<()> {
        let prepared = self.init().await?;
        let ctx = InvokeContext {
            spec: &self.spec,
            prepared: &prepared,
            orchestrator: &self.orchestrator,
            decoder: self.decoder.as_ref(),
        };
        self.strategy.before_invoke(&ctx).await
    }
}

#[async_trait]
impl<S: InvokeStrategy> Reload for Invoker<S> {
    async fn reload(&self) -> Result<bool> {
        self.refresh().await
    }
}

/// Remove extracted code right away when this was the last reference.
fn discard(prepared: Arc<Prepared>) {
    if let Ok(mut prepared) = Arc::try_unwrap(prepared) {
        if let Err(e) = prepared.code.release() {
            tracing::warn!(error = %e, "Failed to remove extracted code directory");
        }
    }
}

/// Fail with [`CoreError::BuildFailed`] on a non-zero build exit.
pub(crate) fn check_build(output: &ExecOutput) -> Result<()> {
    if output.success() {
        Ok(())
    } else {
        Err(CoreError::BuildFailed(output.exit_code))
    }
}
