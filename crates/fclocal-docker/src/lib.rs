//! # fclocal-docker
//!
//! Container engine layer for fclocal.
//! Provides the engine seam, a Docker implementation over bollard, and the
//! orchestration primitives the invoke lifecycle is built from.
//!
//! ## Quick Start
//!
//! ```no_run
//! use fclocal_docker::{ContainerRegistry, ContainerSpec, DockerEngine, ImageResolver, Orchestrator};
//! use std::sync::Arc;
//!
//! # async fn example() -> fclocal_docker::Result<()> {
//! let orchestrator = Orchestrator::new(
//!     Arc::new(DockerEngine::connect()?),
//!     Arc::new(ContainerRegistry::new()),
//!     Arc::new(ImageResolver::default()),
//! );
//!
//! let spec = ContainerSpec::builder("fclocal_demo", "aliyunfc/runtime-nodejs8:1.9.13")
//!     .cmd(vec!["-h".into(), "index.handler".into(), "--stdin".into()])
//!     .open_stdin()
//!     .build()?;
//!
//! // Pulls the image if needed, runs to completion, removes the container
//! let output = orchestrator.run(&spec, Some("{}".into())).await?;
//! println!("exit code: {}", output.exit_code);
//!
//! // Stop anything still running (e.g. from a signal handler)
//! orchestrator.stop_all().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Engine Seam**: `ContainerEngine` trait, with a bollard-backed `DockerEngine`
//! - **Image Resolution**: Versioned runtime images, mirror probing, pull + re-tag
//! - **One-shot Runs**: Create, attach, start, feed stdin, wait, demux output
//! - **Runners**: Long-lived containers serving many `exec` calls
//! - **Tracked Shutdown**: Every created container is stopped exactly once on shutdown

mod docker;
mod engine;
mod error;
mod image;
mod orchestrator;
mod registry;
mod runner;
mod spec;

pub use docker::DockerEngine;
pub use engine::{drain, AttachedIo, ContainerEngine, ExecOutput, ExitWait, OutputChunk};
pub use error::{DockerError, Result};
pub use image::{ImageKind, ImageResolver, DEFAULT_IMAGE_VERSION, DEFAULT_REGISTRY};
pub use orchestrator::Orchestrator;
pub use registry::ContainerRegistry;
pub use runner::Runner;
pub use spec::{ContainerSpec, ContainerSpecBuilder, ExecSpec, MountSpec};
