//! Translation between host HTTP requests and sandbox invocations.
//!
//! Two renderers sit on top of a finished [`InvokeOutcome`]:
//!
//! - [`render_api_response`]: body passthrough with `x-fc-*` metadata headers.
//! - [`render_http_response`]: status and headers come from the function's
//!   own `x-fc-http-params` header, the body passes through unchanged.
//!
//! Failed invocations never surface as server errors: both renderers fall
//! back to a 500 with a JSON body classified as handled or unhandled.

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use fclocal_core::{
    unhandled_error_body, HttpParams, InvocationErrorKind, InvokeOutcome, ResponseEnvelope,
    TriggerResponseParams, HTTP_PARAMS_HEADER,
};
use serde_json::Value;
use std::collections::BTreeMap;

const OCTET_STREAM: &str = "application/octet-stream";
const JSON: &str = "application/json";
const ERROR_TYPE_HEADER: &str = "x-fc-error-type";
const EXPOSE_HEADERS: &str = "Date,x-fc-request-id,x-fc-error-type,x-fc-code-checksum,x-fc-invocation-duration,x-fc-max-memory-usage,x-fc-log-result,x-fc-invocation-code-version";

/// Parse a query string into multi-valued, percent-decoded pairs.
///
/// `+` is treated as a space, matching form encoding.
pub fn parse_query(query: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in query.unwrap_or_default().split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        if key.is_empty() {
            continue;
        }
        map.entry(key).or_default().push(decode_component(value));
    }
    map
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

/// Host name from the `host` header, without the port.
fn host_name(headers: &HeaderMap) -> String {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or_default().to_string();
    }
    host.split(':').next().unwrap_or_default().to_string()
}

/// Build the call metadata handed to the sandbox for an HTTP trigger.
///
/// `prefix` is the trigger's route prefix; `path` is what follows it.
pub fn build_http_params(
    method: &str,
    uri: &Uri,
    headers: &HeaderMap,
    prefix: &str,
    client_ip: &str,
) -> HttpParams {
    let mut headers_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        headers_map
            .entry(name.as_str().to_ascii_lowercase())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    HttpParams {
        request_uri: uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| uri.path().to_string()),
        method: method.to_string(),
        path: uri.path().strip_prefix(prefix).unwrap_or_default().to_string(),
        client_ip: client_ip.to_string(),
        queries_map: parse_query(uri.query()),
        headers_map,
        host: host_name(headers),
    }
}

fn is_ascii_field(text: &str) -> bool {
    !text.is_empty() && text.is_ascii()
}

/// Whether a function-supplied header may be forwarded to the caller.
///
/// Keys must be non-blank ASCII; values must be an ASCII string or an array
/// of ASCII strings.
pub fn validate_header(key: &str, value: &Value) -> bool {
    if key.trim().is_empty() || !key.is_ascii() {
        return false;
    }
    match value {
        Value::String(s) => is_ascii_field(s),
        Value::Array(values) => values
            .iter()
            .all(|v| v.as_str().is_some_and(is_ascii_field)),
        _ => false,
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => tracing::debug!(header = name, "Dropping header with invalid value"),
    }
}

fn envelope(outcome: &InvokeOutcome) -> ResponseEnvelope {
    outcome
        .decoded
        .as_ref()
        .map(|d| d.envelope.clone())
        .unwrap_or_default()
}

fn log_function_errors(stderr: &Bytes) {
    if !stderr.is_empty() {
        tracing::error!(target: "fclocal::function", "{}", String::from_utf8_lossy(stderr).trim_end());
    }
}

fn response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Render an API invocation: the body passes through as an octet stream.
pub fn render_api_response(outcome: &InvokeOutcome) -> Response {
    let envelope = envelope(outcome);
    let status = envelope
        .status_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut headers = HeaderMap::new();
    set_header(&mut headers, "content-type", OCTET_STREAM);
    set_header(&mut headers, "x-fc-request-id", &envelope.request_id);
    set_header(&mut headers, "x-fc-invocation-duration", &envelope.billed_time);
    set_header(&mut headers, "x-fc-invocation-service-version", "LATEST");
    set_header(&mut headers, "x-fc-max-memory-usage", &envelope.memory_usage);
    set_header(&mut headers, "access-control-expose-headers", EXPOSE_HEADERS);

    let mut body = envelope.body.clone();
    if let Some(kind) = InvocationErrorKind::classify(&outcome.stderr, &body) {
        log_function_errors(&outcome.stderr);
        set_header(&mut headers, "content-type", JSON);
        set_header(&mut headers, ERROR_TYPE_HEADER, kind.as_str());
        if kind == InvocationErrorKind::Unhandled {
            body = unhandled_error_body(&envelope);
        }
    }

    response(status, headers, body)
}

/// Render an HTTP trigger invocation.
pub fn render_http_response(outcome: &InvokeOutcome) -> Response {
    let envelope = envelope(outcome);
    let sandbox_status = envelope
        .status_code
        .and_then(|code| StatusCode::from_u16(code).ok());

    match sandbox_status {
        Some(status) if status.is_success() && outcome.stderr.is_empty() => {
            render_trigger_success(&envelope)
        }
        _ => render_trigger_failure(outcome, &envelope, sandbox_status),
    }
}

fn render_trigger_success(envelope: &ResponseEnvelope) -> Response {
    let params = match envelope.header(HTTP_PARAMS_HEADER) {
        Some(raw) => TriggerResponseParams::decode(raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring malformed {HTTP_PARAMS_HEADER} header");
            TriggerResponseParams::default()
        }),
        None => TriggerResponseParams::default(),
    };

    let status = params
        .status
        .map(|code| StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .unwrap_or(StatusCode::OK);

    let mut headers = HeaderMap::new();
    for (key, value) in params.headers_map.iter().flatten() {
        if !validate_header(key, value) {
            tracing::warn!(header = %key, "Dropping header with non-ASCII name or value");
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            tracing::warn!(header = %key, "Dropping header with invalid name");
            continue;
        };
        let values: Vec<&str> = match value {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => tracing::warn!(header = %key, "Dropping header with invalid value"),
            }
        }
    }

    response(status, headers, envelope.body.clone())
}

fn render_trigger_failure(
    outcome: &InvokeOutcome,
    envelope: &ResponseEnvelope,
    sandbox_status: Option<StatusCode>,
) -> Response {
    log_function_errors(&outcome.stderr);

    let status = sandbox_status
        .filter(|s| !s.is_success())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
    if let Some(kind) = InvocationErrorKind::classify(&outcome.stderr, &envelope.body) {
        set_header(&mut headers, ERROR_TYPE_HEADER, kind.as_str());
    }

    let body = if envelope.body.is_empty() {
        unhandled_error_body(envelope)
    } else {
        envelope.body.clone()
    };

    response(status, headers, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use fclocal_core::DecodedOutput;
    use serde_json::json;

    fn outcome(status: Option<u16>, headers: Vec<(String, String)>, body: &str, stderr: &str) -> InvokeOutcome {
        InvokeOutcome {
            exit_code: 0,
            stdout: Bytes::new(),
            stderr: Bytes::copy_from_slice(stderr.as_bytes()),
            decoded: Some(DecodedOutput {
                envelope: ResponseEnvelope {
                    status_code: status,
                    headers,
                    body: Bytes::copy_from_slice(body.as_bytes()),
                    request_id: "req-1".into(),
                    billed_time: "25".into(),
                    memory_limit: "128".into(),
                    memory_usage: "17".into(),
                },
                passthrough: Vec::new(),
            }),
        }
    }

    fn params_header(value: serde_json::Value) -> Vec<(String, String)> {
        vec![(
            HTTP_PARAMS_HEADER.to_string(),
            STANDARD.encode(value.to_string()),
        )]
    }

    async fn body_of(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
    }

    #[test]
    fn test_parse_query() {
        let map = parse_query(Some("a=1&a=2&b=hello+world&c=%E4%BD%A0&flag&=x"));
        assert_eq!(map["a"], vec!["1", "2"]);
        assert_eq!(map["b"], vec!["hello world"]);
        assert_eq!(map["c"], vec!["你"]);
        assert_eq!(map["flag"], vec![""]);
        assert_eq!(map.len(), 4);
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_build_http_params() {
        let uri: Uri = "/2016-08-15/proxy/demo/hello/users/1?x=1&x=2".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("localhost:8000"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let params = build_http_params("GET", &uri, &headers, "/2016-08-15/proxy/demo/hello", "10.0.0.1");

        assert_eq!(params.request_uri, "/2016-08-15/proxy/demo/hello/users/1?x=1&x=2");
        assert_eq!(params.path, "/users/1");
        assert_eq!(params.client_ip, "10.0.0.1");
        assert_eq!(params.host, "localhost");
        assert_eq!(params.queries_map["x"], vec!["1", "2"]);
        assert_eq!(params.headers_map["x-multi"], vec!["a", "b"]);
        assert_eq!(params.headers_map["host"], vec!["localhost:8000"]);
    }

    #[test]
    fn test_validate_header() {
        assert!(validate_header("x-ok", &json!("value")));
        assert!(validate_header("set-cookie", &json!(["a=1", "b=2"])));
        assert!(!validate_header("  ", &json!("value")));
        assert!(!validate_header("x-ünicode", &json!("value")));
        assert!(!validate_header("x-bad", &json!("välue")));
        assert!(!validate_header("x-bad", &json!(["ok", "nö"])));
        assert!(!validate_header("x-bad", &json!([1, 2])));
        assert!(!validate_header("x-bad", &json!(42)));
    }

    #[tokio::test]
    async fn test_api_response_headers() {
        let response = render_api_response(&outcome(Some(200), Vec::new(), "testBody", ""));
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        assert_eq!(headers["content-type"], OCTET_STREAM);
        assert_eq!(headers["x-fc-request-id"], "req-1");
        assert_eq!(headers["x-fc-invocation-duration"], "25");
        assert_eq!(headers["x-fc-invocation-service-version"], "LATEST");
        assert_eq!(headers["x-fc-max-memory-usage"], "17");
        assert_eq!(headers["access-control-expose-headers"], EXPOSE_HEADERS);
        assert!(headers.get(ERROR_TYPE_HEADER).is_none());
        assert_eq!(body_of(response).await, "testBody");
    }

    #[tokio::test]
    async fn test_api_response_unhandled_error() {
        let response = render_api_response(&outcome(None, Vec::new(), "", "boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()["content-type"], JSON);
        assert_eq!(response.headers()[ERROR_TYPE_HEADER], "UnhandledInvocationError");

        let body: Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(
            body["errorMessage"],
            "Process exited unexpectedly before completing request (duration: 25ms, maxMemoryUsage: 17MB)"
        );
    }

    #[tokio::test]
    async fn test_api_response_handled_error_keeps_body() {
        let response = render_api_response(&outcome(Some(200), Vec::new(), "{\"errorMessage\":\"x\"}", "trace"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ERROR_TYPE_HEADER], "HandledInvocationError");
        assert_eq!(body_of(response).await, "{\"errorMessage\":\"x\"}");
    }

    #[tokio::test]
    async fn test_http_response_uses_function_params() {
        let headers = params_header(json!({
            "status": 201,
            "headersMap": {
                "x-custom": "yes",
                "set-cookie": ["a=1", "b=2"],
                "x-bad": "nöpe"
            }
        }));
        let response = render_http_response(&outcome(Some(200), headers, "created", ""));

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-custom"], "yes");
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert!(response.headers().get("x-bad").is_none());
        assert_eq!(body_of(response).await, "created");
    }

    #[tokio::test]
    async fn test_http_response_defaults_without_params() {
        let response = render_http_response(&outcome(Some(204), Vec::new(), "ok", ""));
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().is_empty());
        assert_eq!(body_of(response).await, "ok");
    }

    #[tokio::test]
    async fn test_http_response_accepts_headers_alias() {
        let headers = params_header(json!({ "status": 302, "headers": { "location": "/next" } }));
        let response = render_http_response(&outcome(Some(200), headers, "", ""));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "/next");
    }

    #[tokio::test]
    async fn test_http_response_non_2xx_sandbox_status() {
        let response = render_http_response(&outcome(Some(502), Vec::new(), "upstream", ""));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["content-type"], JSON);
        assert!(response.headers().get(ERROR_TYPE_HEADER).is_none());
        assert_eq!(body_of(response).await, "upstream");
    }

    #[tokio::test]
    async fn test_http_response_stderr_is_failure() {
        let response = render_http_response(&outcome(Some(200), Vec::new(), "", "crash"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[ERROR_TYPE_HEADER], "UnhandledInvocationError");
        let body: Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert!(body["errorMessage"].as_str().unwrap().contains("duration: 25ms"));
    }

    #[tokio::test]
    async fn test_http_response_without_envelope() {
        let response = render_http_response(&InvokeOutcome::default());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()["content-type"], JSON);
    }
}
