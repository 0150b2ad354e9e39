//! In-memory container engine for lifecycle tests.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use fclocal_core::{
    InvocationSpec, LocalSettings, Runtime, EXECUTION_INFO_BEGIN, EXECUTION_INFO_END,
    RESPONSE_BEGIN, RESPONSE_END,
};
use fclocal_docker::{
    AttachedIo, ContainerEngine, ContainerRegistry, ContainerSpec, DockerError, ExecOutput,
    ExecSpec, ExitWait, ImageResolver, Orchestrator, OutputChunk, Result,
};
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Produces the output of a run or exec from the container name and command.
pub type Responder = Arc<dyn Fn(&str, &[String]) -> ExecOutput + Send + Sync>;

#[derive(Debug, Default)]
pub struct MockState {
    pub images: HashSet<String>,
    pub pulls: Vec<String>,
    pub tags: Vec<(String, String)>,
    pub created: Vec<ContainerSpec>,
    pub stopped: Vec<String>,
    pub live: HashSet<String>,
    pub execs: Vec<(String, ExecSpec)>,
    pub exec_stdin: Vec<Bytes>,
    pub active_execs: usize,
    pub max_active_execs: usize,
    /// Number of upcoming execs that fail with an engine error.
    pub failing_execs: usize,
    pending: HashMap<String, ExecOutput>,
}

/// Records every call; never talks to a daemon.
pub struct MockEngine {
    state: Mutex<MockState>,
    exec_delay: Duration,
    responder: Responder,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            exec_delay: Duration::ZERO,
            responder: Arc::new(|_, _| http_output(200, b"ok")),
        }
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state().images.insert(image.to_string());
        self
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    pub fn with_responder(
        mut self,
        responder: impl Fn(&str, &[String]) -> ExecOutput + Send + Sync + 'static,
    ) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_execs(&self, n: usize) {
        self.state().failing_execs = n;
    }

    pub fn created_names(&self) -> Vec<String> {
        self.state().created.iter().map(|c| c.name.clone()).collect()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state().images.contains(image))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let mut state = self.state();
        state.pulls.push(reference.to_string());
        state.images.insert(reference.to_string());
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        let mut state = self.state();
        state.tags.push((source.to_string(), target.to_string()));
        state.images.insert(target.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let output = (self.responder)(&spec.name, &spec.cmd);
        let mut state = self.state();
        if state.live.contains(&spec.name) {
            return Err(DockerError::ContainerCreate {
                name: spec.name.clone(),
                message: "name already in use".into(),
            });
        }
        state.created.push(spec.clone());
        state.live.insert(spec.name.clone());
        state.pending.insert(spec.name.clone(), output);
        Ok(format!("id-{}", spec.name))
    }

    async fn attach_container(&self, name: &str) -> Result<AttachedIo> {
        let output = self.state().pending.get(name).cloned().unwrap_or_default();
        let chunks = vec![
            Ok(OutputChunk::Stdout(output.stdout)),
            Ok(OutputChunk::Stderr(output.stderr)),
        ];
        Ok(AttachedIo {
            output: futures::stream::iter(chunks).boxed(),
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn start_container(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<ExitWait> {
        let mut state = self.state();
        let exit_code = state.pending.remove(name).map(|o| o.exit_code).unwrap_or(0);
        let auto_remove = state
            .created
            .iter()
            .rev()
            .find(|c| c.name == name)
            .is_some_and(|c| c.auto_remove);
        if auto_remove {
            state.live.remove(name);
        }
        Ok(futures::future::ready(Ok(exit_code)).boxed())
    }

    async fn exec(&self, name: &str, exec: &ExecSpec, stdin: Option<Bytes>) -> Result<ExecOutput> {
        {
            let mut state = self.state();
            if !state.live.contains(name) {
                return Err(DockerError::ContainerExec {
                    name: name.to_string(),
                    message: "no such container".into(),
                });
            }
            state.active_execs += 1;
            state.max_active_execs = state.max_active_execs.max(state.active_execs);
            state.execs.push((name.to_string(), exec.clone()));
            state.exec_stdin.push(stdin.unwrap_or_default());
        }

        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }

        let mut state = self.state();
        state.active_execs -= 1;
        if state.failing_execs > 0 {
            state.failing_execs -= 1;
            return Err(DockerError::ContainerExec {
                name: name.to_string(),
                message: "connection reset".into(),
            });
        }
        drop(state);
        Ok((self.responder)(name, &exec.cmd))
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.live.remove(name);
        state.stopped.push(name.to_string());
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().live.contains(name))
    }
}

/// Stdout of a sandbox answering with `status` and `body`.
pub fn http_output(status: u16, body: &[u8]) -> ExecOutput {
    let mut raw = format!("HTTP/1.1 {status} OK\r\ncontent-type: text/plain\r\n\r\n").into_bytes();
    raw.extend_from_slice(body);
    ExecOutput {
        exit_code: 0,
        stdout: framed(&raw, "req-1\n25\n128\n17"),
        stderr: Bytes::new(),
    }
}

/// Wrap a raw response and execution info in protocol sentinels.
pub fn framed(raw_response: &[u8], info: &str) -> Bytes {
    Bytes::from(format!(
        "FC Invoke Start RequestId: req-1\n{RESPONSE_BEGIN}\n{}\n{RESPONSE_END}\n{EXECUTION_INFO_BEGIN}\n{}\n{EXECUTION_INFO_END}\n",
        STANDARD.encode(raw_response),
        STANDARD.encode(info)
    ))
}

pub fn orchestrator(engine: Arc<MockEngine>) -> Orchestrator {
    Orchestrator::new(
        engine,
        Arc::new(ContainerRegistry::new()),
        Arc::new(ImageResolver::fixed("1.9.13", "registry.example.com")),
    )
}

pub fn spec(code_dir: &Path) -> InvocationSpec {
    InvocationSpec::builder("demo", "hello", Runtime::Nodejs8)
        .handler("index.handler")
        .initializer("index.initializer")
        .code_uri(code_dir)
        .build()
        .unwrap()
}

pub fn settings(base: &Path) -> Arc<LocalSettings> {
    Arc::new(LocalSettings {
        nas_base_dir: base.join("nas"),
        ..Default::default()
    })
}

pub const NODE_IMAGE: &str = "aliyunfc/runtime-nodejs8:1.9.13";
