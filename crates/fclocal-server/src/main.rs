//! fclocal entry point.
//!
//! ## Modes
//!
//! - **serve** (default): HTTP triggers and API invocations on `FCLOCAL_HTTP_PORT`
//! - **invoke**: run one function with the event read from stdin, write its
//!   output through and exit with the container's exit code

use anyhow::Context;
use fclocal_core::{ControllerSet, DirectInvoke, InvokeRequest, Invoker, LocalSettings};
use fclocal_docker::{ContainerRegistry, DockerEngine, ImageResolver, Orchestrator};
use fclocal_server::{http, AppState, Manifest, ServerConfig, ServerMode};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit code after an interrupt, as a shell reports SIGINT.
const INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr; stdout carries function output in invoke mode
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("fclocal=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ServerConfig::from_env();
    tracing::debug!(?config, "Configuration loaded");

    config.validate()?;
    config.validate_warn();

    let manifest = Manifest::load(&config.manifest_path)
        .with_context(|| format!("Failed to load {}", config.manifest_path.display()))?;

    let engine = DockerEngine::connect().context("Failed to connect to docker")?;
    engine.ping().await.context("Docker daemon not reachable")?;

    let orchestrator = Orchestrator::new(
        Arc::new(engine),
        Arc::new(ContainerRegistry::new()),
        Arc::new(ImageResolver::new(
            config.image_version.clone(),
            config.registry_mirrors.clone(),
        )),
    );

    let settings = Arc::new(LocalSettings {
        nas_base_dir: manifest.base_dir().join(".fun").join("nas"),
        tmp_dir: config.tmp_dir.clone(),
        docker_toolbox: config.docker_toolbox,
        credentials: config.credentials.clone(),
        ..Default::default()
    });

    match config.mode {
        ServerMode::Serve => serve(&config, &manifest, settings, orchestrator).await,
        ServerMode::Invoke => invoke(&config, &manifest, settings, orchestrator).await,
    }
}

async fn serve(
    config: &ServerConfig,
    manifest: &Manifest,
    settings: Arc<LocalSettings>,
    orchestrator: Orchestrator,
) -> anyhow::Result<ExitCode> {
    let state = Arc::new(
        AppState::from_manifest(manifest, settings, config.debug_config()?, orchestrator.clone())
            .await?,
    );

    let watchers = if config.watch { state.watch() } else { Vec::new() };
    state.warm_up().await;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = state.clone();
    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(http_state, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(http_addr = %config.http_addr, "Server ready");

    let server_exited = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Received shutdown signal, cleaning up...");
            false
        }
        _ = &mut http_handle => {
            tracing::error!("HTTP server exited unexpectedly");
            true
        }
    };

    let _ = shutdown_tx.send(());

    for watcher in watchers {
        watcher.stop();
    }

    let cleanup = async {
        let failed_runners = state.shutdown().await;
        let stopped = orchestrator.stop_all().await;
        (failed_runners, stopped)
    };

    let clean = match tokio::time::timeout(config.shutdown_grace, cleanup).await {
        Ok((failed_runners, Ok(stopped))) => {
            tracing::info!(stopped, failed_runners, "Containers cleaned up");
            failed_runners == 0
        }
        Ok((_, Err(e))) => {
            tracing::error!(error = %e, "Error during container cleanup");
            false
        }
        Err(_) => {
            tracing::error!(grace_secs = config.shutdown_grace.as_secs(), "Container cleanup timed out");
            false
        }
    };

    if !server_exited
        && tokio::time::timeout(config.shutdown_grace, &mut http_handle)
            .await
            .is_err()
    {
        tracing::warn!("HTTP server did not drain in time, closing");
        http_handle.abort();
    }

    tracing::info!("Server shutdown complete");
    Ok(if clean && !server_exited {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn invoke(
    config: &ServerConfig,
    manifest: &Manifest,
    settings: Arc<LocalSettings>,
    orchestrator: Orchestrator,
) -> anyhow::Result<ExitCode> {
    let (service, function) = config.target_function()?;
    let def = manifest
        .find(&service, &function)
        .with_context(|| format!("Function {service}/{function} not found in manifest"))?;
    let spec = def.to_spec(&manifest.base_dir(), config.debug_config()?, config.reuse)?;

    let mut event = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut event)
        .await
        .context("Failed to read event from stdin")?;

    let controllers = ControllerSet::new(orchestrator.clone());
    let strategy = if spec.reuse {
        DirectInvoke::reuse(controllers.get(&spec.reuse_key()).await)
    } else {
        DirectInvoke::one_shot()
    };
    let invoker = Invoker::new(spec, settings, orchestrator.clone(), strategy);

    let result = tokio::select! {
        result = invoker.invoke(InvokeRequest::new(event)) => Some(result),
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Received interrupt, stopping containers...");
            None
        }
    };

    let failed_runners = controllers.shutdown().await;
    let cleanup = tokio::time::timeout(config.shutdown_grace, orchestrator.stop_all()).await;
    let clean = match cleanup {
        Ok(Ok(_)) => failed_runners == 0,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Error during container cleanup");
            false
        }
        Err(_) => {
            tracing::error!("Container cleanup timed out");
            false
        }
    };

    let Some(result) = result else {
        return Ok(ExitCode::from(INTERRUPTED));
    };
    let outcome = result?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&outcome.stdout).await?;
    stdout.flush().await?;
    let mut stderr = tokio::io::stderr();
    stderr.write_all(&outcome.stderr).await?;
    stderr.flush().await?;

    if !clean {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::from(outcome.exit_code.rem_euclid(256) as u8))
}
