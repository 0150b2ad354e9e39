//! Serialized access to persistent runners.
//!
//! A [`RunnerController`] owns the single [`Runner`] for one reuse key behind
//! a mutex. Three things take the lock:
//!
//! - starting the runner on first use
//! - every exec against it (the sandbox serves one request at a time)
//! - replacing it after a code change
//!
//! Requests that arrive while a replacement is starting wait for it instead
//! of reaching a stopped container.

use crate::config::ReuseKey;
use crate::error::{CoreError, Result};
use bytes::Bytes;
use fclocal_docker::{ContainerSpec, ExecOutput, ExecSpec, Orchestrator, Runner};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug)]
struct RunnerSlot {
    runner: Option<Runner>,
    /// Creation options of the current (or last) runner.
    template: Option<ContainerSpec>,
    /// The current runner hasn't run the function initializer yet.
    invoke_initializer: bool,
}

/// Owns the persistent runner for one function.
#[derive(Debug)]
pub struct RunnerController {
    orchestrator: Orchestrator,
    slot: Mutex<RunnerSlot>,
}

impl RunnerController {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            slot: Mutex::new(RunnerSlot {
                runner: None,
                template: None,
                invoke_initializer: true,
            }),
        }
    }

    /// Start the runner from `template` unless one is already running.
    pub async fn ensure(&self, template: &ContainerSpec) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if slot.runner.is_none() {
            self.start_locked(&mut slot, template).await?;
        }
        Ok(())
    }

    async fn start_locked(&self, slot: &mut RunnerSlot, template: &ContainerSpec) -> Result<()> {
        let runner = self.orchestrator.start(template).await?;
        slot.runner = Some(runner);
        slot.template = Some(template.clone());
        slot.invoke_initializer = true;
        Ok(())
    }

    /// Execute against the runner, starting it from `template` if needed.
    ///
    /// `build` receives whether the initializer still has to run and returns
    /// the command to exec. If the exec itself fails the runner is stopped
    /// and dropped; the next call starts a fresh one.
    pub async fn execute<F>(
        &self,
        template: &ContainerSpec,
        build: F,
        stdin: Option<Bytes>,
    ) -> Result<ExecOutput>
    where
        F: FnOnce(bool) -> ExecSpec + Send,
    {
        let mut slot = self.slot.lock().await;

        if slot.runner.is_none() {
            self.start_locked(&mut slot, template).await?;
        }

        let exec = build(slot.invoke_initializer);
        let result = match slot.runner.as_ref() {
            Some(runner) => runner.exec(&exec, stdin).await,
            None => {
                return Err(CoreError::InvalidState {
                    expected: "runner started".into(),
                    actual: "no runner".into(),
                })
            }
        };

        match result {
            Ok(output) => {
                slot.invoke_initializer = false;
                Ok(output)
            }
            Err(e) => {
                if let Some(runner) = slot.runner.take() {
                    tracing::warn!(
                        container = %runner.name(),
                        error = %e,
                        "Exec failed, discarding runner"
                    );
                    if let Err(stop_err) = runner.stop().await {
                        tracing::warn!(error = %stop_err, "Failed to stop discarded runner");
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Replace the running container with a fresh one from the last template.
    ///
    /// The lock is held until the replacement is ready. Returns `false` if
    /// no runner was active, in which case nothing is started.
    pub async fn replace(&self) -> Result<bool> {
        self.replace_from(None).await
    }

    /// Like [`replace`](Self::replace), starting the new runner from `template`.
    pub async fn replace_with(&self, template: &ContainerSpec) -> Result<bool> {
        self.replace_from(Some(template)).await
    }

    async fn replace_from(&self, fresh: Option<&ContainerSpec>) -> Result<bool> {
        let mut slot = self.slot.lock().await;
        if let Some(template) = fresh {
            slot.template = Some(template.clone());
        }

        let Some(template) = slot.template.clone() else {
            return Ok(false);
        };
        let Some(old) = slot.runner.take() else {
            return Ok(false);
        };

        tracing::info!(container = %old.name(), "Code changed, replacing runner");
        old.stop().await?;

        slot.invoke_initializer = true;
        let runner = self.orchestrator.start(&template).await?;
        tracing::info!(container = %runner.name(), "Runner replaced");
        slot.runner = Some(runner);
        Ok(true)
    }

    /// Stop the runner, if any.
    pub async fn shutdown(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if let Some(runner) = slot.runner.take() {
            runner.stop().await?;
        }
        Ok(())
    }

    /// Name of the active runner's container.
    pub async fn runner_name(&self) -> Option<String> {
        let slot = self.slot.lock().await;
        slot.runner.as_ref().map(|r| r.name().to_string())
    }

    /// Whether the next exec will run the initializer.
    pub async fn initializer_pending(&self) -> bool {
        self.slot.lock().await.invoke_initializer
    }
}

/// One controller per reuse key, shared by every trigger of a function.
#[derive(Debug)]
pub struct ControllerSet {
    orchestrator: Orchestrator,
    controllers: Mutex<HashMap<ReuseKey, Arc<RunnerController>>>,
}

impl ControllerSet {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            controllers: Mutex::new(HashMap::new()),
        }
    }

    /// Controller for `key`, created on first request.
    pub async fn get(&self, key: &ReuseKey) -> Arc<RunnerController> {
        let mut controllers = self.controllers.lock().await;
        controllers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RunnerController::new(self.orchestrator.clone())))
            .clone()
    }

    /// Stop every runner. Failures are logged and counted.
    pub async fn shutdown(&self) -> usize {
        let controllers: Vec<_> = self.controllers.lock().await.values().cloned().collect();
        let mut failed = 0;
        for controller in controllers {
            if let Err(e) = controller.shutdown().await {
                tracing::error!(error = %e, "Failed to stop runner");
                failed += 1;
            }
        }
        failed
    }
}
