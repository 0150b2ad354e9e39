//! HTTP server for triggers and API invocations.
//!
//! Routes:
//!
//! - `GET /health`
//! - `ANY /2016-08-15/proxy/{service}/{function}[/{path}]`: HTTP trigger
//! - `POST /2016-08-15/services/{service}/functions/{function}/invocations`: API invoke

use crate::config::MAX_BODY_BYTES;
use crate::error::{Result, ServerError};
use crate::signature;
use crate::state::AppState;
use crate::trigger::{build_http_params, parse_query, render_api_response, render_http_response};
use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Path, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Json, Response},
    routing::{any, get, post},
    Router,
};
use bytes::Bytes;
use fclocal_core::InvokeRequest;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(state: Arc<AppState>) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/2016-08-15/proxy/:service/:function", any(http_trigger_handler))
        .route("/2016-08-15/proxy/:service/:function/*path", any(http_trigger_handler))
        .route(
            "/2016-08-15/services/:service/functions/:function/invocations",
            post(api_invoke_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "fclocal"
    }))
}

fn path_param<'a>(params: &'a HashMap<String, String>, key: &str) -> &'a str {
    params.get(key).map(String::as_str).unwrap_or_default()
}

async fn http_trigger_handler(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let service = path_param(&params, "service");
    let function = path_param(&params, "function");

    let entry = state.function(service, function)?;
    let route = entry.http.as_ref().ok_or_else(|| ServerError::FunctionNotFound {
        service: service.to_string(),
        function: function.to_string(),
    })?;

    if !route.trigger.allows(method.as_str()) {
        return Err(ServerError::MethodNotAllowed(method.to_string()));
    }

    if !route.trigger.anonymous {
        signature::verify(
            state.credentials(),
            method.as_str(),
            uri.path(),
            &headers,
            &parse_query(uri.query()),
        )?;
    }

    let client_ip = connect
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();
    let http_params = build_http_params(method.as_str(), &uri, &headers, &route.prefix, &client_ip);

    tracing::debug!(%service, %function, %method, path = %http_params.path, "HTTP trigger request");

    let request = InvokeRequest::new(body).with_http_params(http_params.encode()?);
    let outcome = route.invoker.invoke(request).await?;
    Ok(render_http_response(&outcome))
}

async fn api_invoke_handler(
    State(state): State<Arc<AppState>>,
    Path((service, function)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    signature::verify(
        state.credentials(),
        "POST",
        uri.path(),
        &headers,
        &parse_query(uri.query()),
    )?;

    let entry = state.function(&service, &function)?;
    tracing::debug!(%service, %function, bytes = body.len(), "API invoke request");

    let outcome = entry.api.invoke(InvokeRequest::new(body)).await?;
    Ok(render_api_response(&outcome))
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::result::Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
