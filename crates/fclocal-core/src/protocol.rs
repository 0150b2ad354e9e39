//! Wire protocol between the host and the sandbox's runtime adapter.
//!
//! Outbound, the event is written to the container's stdin and HTTP call
//! metadata travels as base64 JSON ([`HttpParams`]). Inbound, stdout is a
//! line protocol:
//!
//! ```text
//! <diagnostic lines>
//! --------------------response begin-----------------
//! <base64 raw HTTP response, possibly wrapped>
//! --------------------response end-----------------
//! --------------------execution info begin-----------------
//! <base64 "requestId\nbilledTime\nmemoryLimit\nmemoryUsage">
//! --------------------execution info end-----------------
//! ```
//!
//! Callers go through [`OutputDecoder`] so the framing can be swapped out.

use crate::error::{CoreError, Result};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const RESPONSE_BEGIN: &str = "--------------------response begin-----------------";
pub const RESPONSE_END: &str = "--------------------response end-----------------";
pub const EXECUTION_INFO_BEGIN: &str = "--------------------execution info begin-----------------";
pub const EXECUTION_INFO_END: &str = "--------------------execution info end-----------------";

/// Response header carrying the function's real status and headers.
pub const HTTP_PARAMS_HEADER: &str = "x-fc-http-params";

const MAX_RESPONSE_HEADERS: usize = 128;

/// Accepts wrapped or unpadded base64, like the sandbox emits.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    LENIENT
        .decode(compact)
        .map_err(|e| CoreError::Protocol(format!("invalid base64: {e}")))
}

/// Decoded function response plus execution metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseEnvelope {
    /// `None` when the sandbox produced no response section.
    pub status_code: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub request_id: String,
    /// Milliseconds, as reported.
    pub billed_time: String,
    /// MB, as reported.
    pub memory_limit: String,
    /// MB, as reported.
    pub memory_usage: String,
}

impl ResponseEnvelope {
    /// First header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Result of decoding sandbox stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedOutput {
    pub envelope: ResponseEnvelope,
    /// Diagnostic lines outside both sections, in order.
    pub passthrough: Vec<String>,
}

impl DecodedOutput {
    /// Re-emit diagnostic lines through the log.
    pub fn emit_diagnostics(&self) {
        for line in &self.passthrough {
            tracing::info!(target: "fclocal::function", "{line}");
        }
    }
}

/// Turns raw sandbox stdout into a structured response.
pub trait OutputDecoder: Send + Sync + std::fmt::Debug {
    fn decode(&self, stdout: &[u8]) -> Result<DecodedOutput>;
}

/// Decoder for the sentinel-delimited line protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct SentinelDecoder;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Response,
    ExecutionInfo,
}

impl OutputDecoder for SentinelDecoder {
    fn decode(&self, stdout: &[u8]) -> Result<DecodedOutput> {
        // section payloads are base64, so lossy decoding only affects diagnostics
        let text = String::from_utf8_lossy(stdout);

        let mut section = Section::None;
        let mut response_lines = Vec::new();
        let mut execution_info = None;
        let mut passthrough = Vec::new();

        for line in text.split('\n') {
            if line.starts_with(RESPONSE_BEGIN) {
                section = Section::Response;
            } else if line.starts_with(RESPONSE_END) || line.starts_with(EXECUTION_INFO_END) {
                section = Section::None;
            } else if line.starts_with(EXECUTION_INFO_BEGIN) {
                section = Section::ExecutionInfo;
            } else {
                match section {
                    Section::Response => response_lines.push(line),
                    Section::ExecutionInfo => execution_info = Some(line),
                    Section::None => {
                        if !line.is_empty() {
                            passthrough.push(line.to_string());
                        }
                    }
                }
            }
        }

        let mut envelope = if response_lines.is_empty() {
            ResponseEnvelope::default()
        } else {
            let raw = decode_base64(&response_lines.join("\n"))?;
            parse_http_response(&raw)?
        };

        // Metadata only; a bad block must not cost the response.
        match execution_info.map(decode_base64).transpose() {
            Ok(Some(info)) => {
                let info = String::from_utf8_lossy(&info);
                let mut fields = info.split('\n').map(str::to_string);
                envelope.request_id = fields.next().unwrap_or_default();
                envelope.billed_time = fields.next().unwrap_or_default();
                envelope.memory_limit = fields.next().unwrap_or_default();
                envelope.memory_usage = fields.next().unwrap_or_default();
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Ignoring undecodable execution info"),
        }

        tracing::trace!(
            status = ?envelope.status_code,
            body_len = envelope.body.len(),
            request_id = %envelope.request_id,
            "Sandbox output decoded"
        );
        Ok(DecodedOutput {
            envelope,
            passthrough,
        })
    }
}

/// Parse a raw HTTP/1.x response. The body is everything after the header
/// block, byte for byte.
pub fn parse_http_response(raw: &[u8]) -> Result<ResponseEnvelope> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let header_len = match response.parse(raw) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(CoreError::Protocol("incomplete HTTP response".into()))
        }
        Err(e) => return Err(CoreError::Protocol(format!("malformed HTTP response: {e}"))),
    };

    Ok(ResponseEnvelope {
        status_code: response.code,
        headers: response
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect(),
        body: Bytes::copy_from_slice(&raw[header_len..]),
        ..Default::default()
    })
}

/// HTTP call metadata handed to the sandbox for HTTP triggers.
///
/// Every header and query value is an array, even when single-valued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpParams {
    #[serde(rename = "requestURI")]
    pub request_uri: String,
    pub method: String,
    /// Path below the trigger prefix.
    pub path: String,
    #[serde(rename = "clientIP")]
    pub client_ip: String,
    pub queries_map: BTreeMap<String, Vec<String>>,
    pub headers_map: BTreeMap<String, Vec<String>>,
    pub host: String,
}

impl HttpParams {
    /// Base64 JSON, as placed in `FC_HTTP_PARAMS`.
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        Ok(serde_json::from_slice(&decode_base64(encoded)?)?)
    }
}

/// Status and headers a function attached to its HTTP trigger response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponseParams {
    pub status: Option<u16>,
    /// Values are strings or arrays of strings.
    #[serde(alias = "headers")]
    pub headers_map: Option<Map<String, Value>>,
}

impl TriggerResponseParams {
    /// Decode the `x-fc-http-params` header value.
    pub fn decode(encoded: &str) -> Result<Self> {
        Ok(serde_json::from_slice(&decode_base64(encoded)?)?)
    }
}

/// How a failed invocation is reported to HTTP callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationErrorKind {
    /// The function reported an error and produced a body.
    Handled,
    /// The process died before producing a response.
    Unhandled,
}

impl InvocationErrorKind {
    /// Classify an invocation. A clean error stream means no error.
    pub fn classify(stderr: &[u8], body: &[u8]) -> Option<Self> {
        if stderr.is_empty() {
            None
        } else if body.is_empty() {
            Some(Self::Unhandled)
        } else {
            Some(Self::Handled)
        }
    }

    /// Value of the `x-fc-error-type` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handled => "HandledInvocationError",
            Self::Unhandled => "UnhandledInvocationError",
        }
    }
}

/// JSON body reported when the sandbox died before responding.
pub fn unhandled_error_body(envelope: &ResponseEnvelope) -> Bytes {
    let message = format!(
        "Process exited unexpectedly before completing request (duration: {}ms, maxMemoryUsage: {}MB)",
        envelope.billed_time, envelope.memory_usage
    );
    Bytes::from(serde_json::json!({ "errorMessage": message }).to_string())
}
