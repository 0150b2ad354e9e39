//! Shared server state: one set of invokers per manifest function.

use crate::error::{Result, ServerError};
use crate::manifest::{HttpTrigger, Manifest};
use fclocal_core::{
    ApiInvoke, CodeWatcher, ControllerSet, Credentials, DebugConfig, HttpInvoke, Invoker,
    LocalSettings, Reload, DEFAULT_DEBOUNCE,
};
use fclocal_docker::Orchestrator;
use std::collections::HashMap;
use std::sync::Arc;

/// Path prefix of HTTP trigger routes.
pub const PROXY_PREFIX: &str = "/2016-08-15/proxy";

/// An HTTP trigger and the invoker behind it.
#[derive(Debug)]
pub struct HttpRoute {
    pub trigger: HttpTrigger,
    pub invoker: Arc<Invoker<HttpInvoke>>,
    /// Route prefix stripped from the request path before it reaches the function.
    pub prefix: String,
}

/// Invokers for one function.
#[derive(Debug)]
pub struct FunctionEntry {
    pub api: Invoker<ApiInvoke>,
    pub http: Option<HttpRoute>,
}

/// State shared by every request handler.
#[derive(Debug)]
pub struct AppState {
    functions: HashMap<(String, String), Arc<FunctionEntry>>,
    credentials: Credentials,
    controllers: ControllerSet,
}

impl AppState {
    /// Build invokers for every function in the manifest.
    ///
    /// HTTP triggers of the same function share one runner controller.
    pub async fn from_manifest(
        manifest: &Manifest,
        settings: Arc<LocalSettings>,
        debug: DebugConfig,
        orchestrator: Orchestrator,
    ) -> Result<Self> {
        let base_dir = manifest.base_dir();
        let controllers = ControllerSet::new(orchestrator.clone());
        let mut functions = HashMap::new();

        for def in &manifest.functions {
            let spec = def.to_spec(&base_dir, debug.clone(), false)?;

            let http = match def.http_trigger() {
                Some(trigger) => {
                    let controller = controllers.get(&spec.reuse_key()).await;
                    let strategy = HttpInvoke::new(controller, spec.debug.is_enabled());
                    let prefix = format!("{PROXY_PREFIX}/{}/{}", def.service_name, def.function_name);
                    tracing::info!(
                        service = %def.service_name,
                        function = %def.function_name,
                        trigger = %trigger.name,
                        methods = ?trigger.methods,
                        url = %prefix,
                        "HTTP trigger registered"
                    );
                    Some(HttpRoute {
                        trigger,
                        invoker: Arc::new(Invoker::new(
                            spec.clone(),
                            settings.clone(),
                            orchestrator.clone(),
                            strategy,
                        )),
                        prefix,
                    })
                }
                None => None,
            };

            let api = Invoker::new(spec, settings.clone(), orchestrator.clone(), ApiInvoke);
            let key = (def.service_name.clone(), def.function_name.clone());
            if functions
                .insert(key, Arc::new(FunctionEntry { api, http }))
                .is_some()
            {
                return Err(ServerError::Manifest(format!(
                    "duplicate function {}/{}",
                    def.service_name, def.function_name
                )));
            }
        }

        Ok(Self {
            functions,
            credentials: settings.credentials.clone(),
            controllers,
        })
    }

    pub fn function(&self, service: &str, function: &str) -> Result<Arc<FunctionEntry>> {
        self.functions
            .get(&(service.to_string(), function.to_string()))
            .cloned()
            .ok_or_else(|| ServerError::FunctionNotFound {
                service: service.to_string(),
                function: function.to_string(),
            })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn http_routes(&self) -> impl Iterator<Item = &HttpRoute> {
        self.functions.values().filter_map(|entry| entry.http.as_ref())
    }

    /// Start persistent runners ahead of the first request.
    ///
    /// Failures are logged; the runner is created again on first use.
    pub async fn warm_up(&self) {
        for route in self.http_routes() {
            let spec = route.invoker.spec();
            if spec.debug.is_enabled() {
                continue;
            }
            if let Err(e) = route.invoker.warm_up().await {
                tracing::warn!(function = %spec.function_name, error = %e, "Failed to warm up runner");
            }
        }
    }

    /// Watch the code of every HTTP trigger backed by a persistent runner.
    ///
    /// Archives and single files are not watched.
    pub fn watch(&self) -> Vec<CodeWatcher> {
        let mut watchers = Vec::new();
        for route in self.http_routes() {
            let spec = route.invoker.spec();
            if spec.debug.is_enabled() || !spec.code_uri.is_dir() {
                continue;
            }
            let target: Arc<dyn Reload> = route.invoker.clone();
            match CodeWatcher::spawn(&spec.code_uri, spec.runtime, target, DEFAULT_DEBOUNCE) {
                Ok(watcher) => watchers.push(watcher),
                Err(e) => tracing::warn!(
                    function = %spec.function_name,
                    error = %e,
                    "Failed to watch code directory"
                ),
            }
        }
        watchers
    }

    /// Stop every persistent runner. Returns the number of failures.
    pub async fn shutdown(&self) -> usize {
        self.controllers.shutdown().await
    }
}
