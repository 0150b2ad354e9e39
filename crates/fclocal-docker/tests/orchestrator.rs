//! Orchestrator invariants over an in-memory engine.

use async_trait::async_trait;
use bytes::Bytes;
use fclocal_docker::{
    AttachedIo, ContainerEngine, ContainerRegistry, ContainerSpec, DockerError, ExecOutput,
    ExecSpec, ExitWait, ImageResolver, Orchestrator, OutputChunk, Result,
};
use futures::{FutureExt, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakeEngine {
    images: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    live: Mutex<HashSet<String>>,
    /// Containers whose stop fails.
    stuck: HashSet<String>,
    fail_wait: bool,
    /// The container is auto-removed before its exit is read.
    removed_early: bool,
}

impl FakeEngine {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.record(format!("pull {reference}"));
        self.images.lock().unwrap().insert(reference.to_string());
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        self.record(format!("tag {source} {target}"));
        self.images.lock().unwrap().insert(target.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(format!("create {}", spec.name));
        self.live.lock().unwrap().insert(spec.name.clone());
        Ok(format!("id-{}", spec.name))
    }

    async fn attach_container(&self, _name: &str) -> Result<AttachedIo> {
        let chunks = vec![
            Ok(OutputChunk::Stdout(Bytes::from_static(b"out"))),
            Ok(OutputChunk::Stderr(Bytes::from_static(b"err"))),
            Ok(OutputChunk::Stdout(Bytes::from_static(b"put"))),
        ];
        Ok(AttachedIo {
            output: futures::stream::iter(chunks).boxed(),
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.record(format!("start {name}"));
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<ExitWait> {
        self.record(format!("wait {name}"));
        let result = if self.fail_wait {
            Err(DockerError::Timeout(std::time::Duration::from_secs(3)))
        } else if self.removed_early {
            self.live.lock().unwrap().remove(name);
            Err(DockerError::ContainerExec {
                name: name.to_string(),
                message: "container removed before its exit was observed".into(),
            })
        } else {
            self.live.lock().unwrap().remove(name);
            Ok(7)
        };
        Ok(futures::future::ready(result).boxed())
    }

    async fn exec(&self, name: &str, exec: &ExecSpec, _stdin: Option<Bytes>) -> Result<ExecOutput> {
        self.record(format!("exec {name} {}", exec.cmd.join(" ")));
        Ok(ExecOutput::default())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.record(format!("stop {name}"));
        if self.stuck.contains(name) {
            return Err(DockerError::ContainerStop {
                name: name.to_string(),
                message: "daemon hung".into(),
            });
        }
        self.live.lock().unwrap().remove(name);
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.live.lock().unwrap().contains(name))
    }
}

fn orchestrator(engine: Arc<FakeEngine>) -> Orchestrator {
    Orchestrator::new(
        engine,
        Arc::new(ContainerRegistry::new()),
        Arc::new(ImageResolver::fixed("1.9.13", "mirror.example.com")),
    )
}

fn spec(name: &str) -> ContainerSpec {
    ContainerSpec::builder(name, "aliyunfc/runtime-python3.6:1.9.13")
        .cmd(vec!["-h".into(), "index.handler".into()])
        .open_stdin()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_ensure_image_pulls_and_tags_once() {
    let engine = Arc::new(FakeEngine::default());
    let orchestrator = orchestrator(engine.clone());

    assert!(orchestrator
        .ensure_image("aliyunfc/runtime-python3.6:1.9.13")
        .await
        .unwrap());
    assert!(!orchestrator
        .ensure_image("aliyunfc/runtime-python3.6:1.9.13")
        .await
        .unwrap());

    assert_eq!(
        engine.calls(),
        vec![
            "pull mirror.example.com/aliyunfc/runtime-python3.6:1.9.13",
            "tag mirror.example.com/aliyunfc/runtime-python3.6:1.9.13 aliyunfc/runtime-python3.6:1.9.13",
        ]
    );
}

#[tokio::test]
async fn test_run_collects_streams_and_untracks() {
    let engine = Arc::new(FakeEngine::default());
    let orchestrator = orchestrator(engine.clone());

    let output = orchestrator
        .run(&spec("one-shot"), Some(Bytes::from_static(b"{\"k\":1}")))
        .await
        .unwrap();

    assert_eq!(output.exit_code, 7);
    assert_eq!(&output.stdout[..], b"output");
    assert_eq!(&output.stderr[..], b"err");
    assert!(orchestrator.registry().is_empty().await);

    let calls = engine.calls();
    let create = calls.iter().position(|c| c == "create one-shot").unwrap();
    let pull = calls.iter().position(|c| c.starts_with("pull")).unwrap();
    assert!(pull < create);

    let wait = calls.iter().position(|c| c == "wait one-shot").unwrap();
    let start = calls.iter().position(|c| c == "start one-shot").unwrap();
    assert!(wait < start);
}

#[tokio::test]
async fn test_run_fails_when_exit_is_lost() {
    let engine = Arc::new(FakeEngine {
        removed_early: true,
        ..Default::default()
    });
    let orchestrator = orchestrator(engine.clone());

    let err = orchestrator.run(&spec("build"), None).await.unwrap_err();
    assert!(matches!(err, DockerError::ContainerExec { .. }));
    assert!(!orchestrator.registry().contains("build").await);
}

#[tokio::test]
async fn test_run_failure_stops_container() {
    let engine = Arc::new(FakeEngine {
        fail_wait: true,
        ..Default::default()
    });
    let orchestrator = orchestrator(engine.clone());

    let err = orchestrator.run(&spec("hung"), None).await.unwrap_err();
    assert!(matches!(err, DockerError::Timeout(_)));
    assert!(engine.calls().contains(&"stop hung".to_string()));
    assert!(!orchestrator.registry().contains("hung").await);
}

#[tokio::test]
async fn test_start_tracks_until_stop() {
    let engine = Arc::new(FakeEngine::default());
    let orchestrator = orchestrator(engine.clone());

    let runner = orchestrator.start(&spec("warm")).await.unwrap();
    assert_eq!(runner.id(), "id-warm");
    assert!(orchestrator.registry().contains("warm").await);

    runner
        .exec(&ExecSpec::new(vec!["/var/fc/runtime/python3/mock".into()]), None)
        .await
        .unwrap();
    runner.stop().await.unwrap();
    assert!(orchestrator.registry().is_empty().await);
}

#[tokio::test]
async fn test_stop_all_runs_once() {
    let engine = Arc::new(FakeEngine::default());
    let orchestrator = orchestrator(engine.clone());

    let _a = orchestrator.start(&spec("a")).await.unwrap();
    let _b = orchestrator.start(&spec("b")).await.unwrap();

    assert_eq!(orchestrator.stop_all().await.unwrap(), 2);
    assert_eq!(orchestrator.stop_all().await.unwrap(), 0);

    let stops: Vec<_> = engine
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("stop"))
        .collect();
    assert_eq!(stops, vec!["stop a", "stop b"]);

    let err = orchestrator.start(&spec("late")).await.unwrap_err();
    assert!(matches!(err, DockerError::ContainerCreate { .. }));
}

#[tokio::test]
async fn test_stop_all_continues_past_failures() {
    let engine = Arc::new(FakeEngine {
        stuck: HashSet::from(["a".to_string()]),
        ..Default::default()
    });
    let orchestrator = orchestrator(engine.clone());

    let _a = orchestrator.start(&spec("a")).await.unwrap();
    let _b = orchestrator.start(&spec("b")).await.unwrap();

    let err = orchestrator.stop_all().await.unwrap_err();
    assert!(matches!(err, DockerError::Shutdown { failed: 1, total: 2 }));
    assert!(orchestrator.registry().contains("a").await);
    assert!(!orchestrator.registry().contains("b").await);
}
