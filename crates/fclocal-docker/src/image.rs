//! Runtime image naming and registry mirror selection.
//!
//! Images are named `aliyunfc/runtime-<name>:<version>` (or `build-<version>`
//! for build images). Pulls go through the first reachable registry mirror,
//! probed once per process; the pulled image is then re-tagged to its
//! canonical name so the local presence check matches next time.

use futures::future::select_ok;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Image version used when none is configured.
pub const DEFAULT_IMAGE_VERSION: &str = "1.9.13";

/// Registry used when no mirror answers.
pub const DEFAULT_REGISTRY: &str = "registry.hub.docker.com";

/// Repository path probed on each mirror.
const PROBE_PATH: &str = "v2/aliyunfc/runtime-nodejs8/tags/list";

/// Per-mirror probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Kind of runtime image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Image used to run functions.
    Run,
    /// Image used for build/install steps.
    Build,
}

/// Resolves runtime image names and the registry to pull them from.
#[derive(Debug)]
pub struct ImageResolver {
    version: String,
    mirrors: Vec<String>,
    registry: OnceCell<String>,
    client: reqwest::Client,
}

impl Default for ImageResolver {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_VERSION, Vec::new())
    }
}

impl ImageResolver {
    /// Create a resolver for `version`, probing `mirrors` (host names) in a race.
    pub fn new(version: impl Into<String>, mirrors: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            version: version.into(),
            mirrors,
            registry: OnceCell::new(),
            client,
        }
    }

    /// Create a resolver that never probes and always uses `registry`.
    pub fn fixed(version: impl Into<String>, registry: impl Into<String>) -> Self {
        let resolver = Self::new(version, Vec::new());
        // A fresh cell cannot be already set.
        let _ = resolver.registry.set(registry.into());
        resolver
    }

    /// Configured image version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Canonical image name for a runtime image name such as `nodejs8` or `python3.6`.
    pub fn image_name(&self, runtime_image: &str, kind: ImageKind) -> String {
        match kind {
            ImageKind::Run => format!("aliyunfc/runtime-{runtime_image}:{}", self.version),
            ImageKind::Build => format!("aliyunfc/runtime-{runtime_image}:build-{}", self.version),
        }
    }

    /// Registry to pull from. Probed once, then cached for the process.
    pub async fn registry(&self) -> &str {
        self.registry
            .get_or_init(|| async {
                let chosen = self.probe().await;
                tracing::info!(registry = %chosen, "Selected image registry");
                chosen
            })
            .await
    }

    /// Full reference to pull for a canonical image name.
    pub async fn pull_reference(&self, image: &str) -> String {
        format!("{}/{image}", self.registry().await)
    }

    async fn probe(&self) -> String {
        if self.mirrors.is_empty() {
            return DEFAULT_REGISTRY.to_string();
        }

        let probes = self.mirrors.iter().map(|mirror| {
            let client = self.client.clone();
            let url = format!("https://{mirror}/{PROBE_PATH}");
            let mirror = mirror.clone();
            Box::pin(async move {
                let response = tokio::time::timeout(PROBE_TIMEOUT, client.get(&url).send())
                    .await
                    .map_err(|_| format!("{url}: timed out"))?
                    .map_err(|e| format!("{url}: {e}"))?;
                if response.status().is_success() {
                    Ok(mirror)
                } else {
                    Err(format!("{url}: status {}", response.status()))
                }
            })
        });

        match select_ok(probes).await {
            Ok((mirror, _)) => mirror,
            Err(last) => {
                tracing::debug!(error = %last, "No registry mirror reachable, using default");
                DEFAULT_REGISTRY.to_string()
            }
        }
    }
}
