//! Runner replacement after code changes.

mod common;

use common::{orchestrator, settings, spec, MockEngine};
use fclocal_core::{
    run_reload_loop, HttpInvoke, InvokeRequest, Invoker, RunnerController, DEFAULT_DEBOUNCE,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const RUNNER: &str = "fclocal-demo-hello-run";

#[tokio::test(start_paused = true)]
async fn test_burst_of_changes_reloads_once() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let orchestrator = orchestrator(engine.clone());
    let controller = Arc::new(RunnerController::new(orchestrator.clone()));
    let invoker = Invoker::new(
        spec(dir.path()),
        settings(dir.path()),
        orchestrator,
        HttpInvoke::new(controller.clone(), false),
    );
    invoker.invoke(InvokeRequest::new("before")).await.unwrap();
    assert!(!controller.initializer_pending().await);

    let (tx, rx) = mpsc::channel(16);
    let reloader = tokio::spawn(run_reload_loop(rx, controller.clone(), DEFAULT_DEBOUNCE));

    for file in ["index.js", "lib/a.js", "lib/b.js"] {
        tx.send(dir.path().join(file)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;

    {
        let state = engine.state();
        assert_eq!(state.stopped, vec![RUNNER]);
        assert_eq!(state.created.len(), 2);
    }
    assert!(controller.initializer_pending().await);

    drop(tx);
    reloader.await.unwrap();

    invoker.invoke(InvokeRequest::new("after")).await.unwrap();
    let state = engine.state();
    assert_eq!(state.created.len(), 2);
    assert_eq!(state.execs.len(), 2);
    assert!(state.execs[1].1.cmd.contains(&"-i".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_requests_during_reload_are_served() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new().with_exec_delay(Duration::from_millis(200)));
    let orchestrator = orchestrator(engine.clone());
    let controller = Arc::new(RunnerController::new(orchestrator.clone()));
    let invoker = Arc::new(Invoker::new(
        spec(dir.path()),
        settings(dir.path()),
        orchestrator,
        HttpInvoke::new(controller.clone(), false),
    ));
    invoker.warm_up().await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    let reloader = tokio::spawn(run_reload_loop(rx, controller.clone(), Duration::from_millis(10)));

    let in_flight = {
        let invoker = invoker.clone();
        tokio::spawn(async move { invoker.invoke(InvokeRequest::new("slow")).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    tx.send(dir.path().join("index.js")).await.unwrap();

    let queued = {
        let invoker = invoker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            invoker.invoke(InvokeRequest::new("queued")).await
        })
    };

    in_flight.await.unwrap().unwrap();
    queued.await.unwrap().unwrap();
    drop(tx);
    reloader.await.unwrap();

    let state = engine.state();
    assert_eq!(state.execs.len(), 2);
    assert_eq!(state.max_active_execs, 1);
    assert_eq!(state.stopped, vec![RUNNER]);
    assert_eq!(state.created.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_closing_channel_flushes_pending_reload() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let orchestrator = orchestrator(engine.clone());
    let controller = Arc::new(RunnerController::new(orchestrator.clone()));
    let invoker = Invoker::new(
        spec(dir.path()),
        settings(dir.path()),
        orchestrator,
        HttpInvoke::new(controller.clone(), false),
    );
    invoker.warm_up().await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    tx.send(dir.path().join("index.js")).await.unwrap();
    drop(tx);
    run_reload_loop(rx, controller, Duration::from_secs(60)).await;

    let state = engine.state();
    assert_eq!(state.stopped, vec![RUNNER]);
    assert_eq!(state.created.len(), 2);
}

#[tokio::test]
async fn test_replace_without_runner_is_noop() {
    let engine = Arc::new(MockEngine::new());
    let controller = RunnerController::new(orchestrator(engine.clone()));

    assert!(!controller.replace().await.unwrap());
    let state = engine.state();
    assert!(state.created.is_empty());
    assert!(state.stopped.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reload_picks_up_new_library_paths() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new());
    let orchestrator = orchestrator(engine.clone());
    let controller = Arc::new(RunnerController::new(orchestrator.clone()));
    let invoker = Arc::new(Invoker::new(
        spec(dir.path()),
        settings(dir.path()),
        orchestrator,
        HttpInvoke::new(controller, false),
    ));
    invoker.warm_up().await.unwrap();

    let conf_dir = dir.path().join(".fun/root/etc/ld.so.conf.d");
    std::fs::create_dir_all(&conf_dir).unwrap();
    std::fs::write(conf_dir.join("deps.conf"), "/usr/local/mylib\n").unwrap();

    let (tx, rx) = mpsc::channel(16);
    tx.send(conf_dir.join("deps.conf")).await.unwrap();
    drop(tx);
    run_reload_loop(rx, invoker.clone(), DEFAULT_DEBOUNCE).await;

    let library_path = |spec: &fclocal_docker::ContainerSpec| {
        spec.env
            .iter()
            .find_map(|var| var.strip_prefix("LD_LIBRARY_PATH=").map(str::to_string))
            .unwrap_or_default()
    };
    let state = engine.state();
    assert_eq!(state.stopped, vec![RUNNER]);
    assert_eq!(state.created.len(), 2);
    assert!(!library_path(&state.created[0]).contains("/code/.fun/root/usr/local/mylib"));
    assert!(library_path(&state.created[1]).starts_with("/code/.fun/root/usr/local/mylib"));
    drop(state);

    invoker.invoke(InvokeRequest::new("after")).await.unwrap();
    assert_eq!(engine.state().created.len(), 2);
}
