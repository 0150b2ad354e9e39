//! Request signatures in the managed service's `FC <keyId>:<mac>` scheme.

use crate::error::{Result, ServerError};
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use fclocal_core::Credentials;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

const CANONICAL_HEADER_PREFIX: &str = "x-fc-";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// The text that gets signed.
///
/// `path` is the raw request path; it is percent-decoded before signing.
/// Query pairs are appended only when the request has a query.
pub fn string_to_sign(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    queries: &BTreeMap<String, Vec<String>>,
) -> String {
    let mut canonical: Vec<(String, String)> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(CANONICAL_HEADER_PREFIX))
        .map(|name| {
            let values: Vec<&str> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            (name.as_str().to_string(), values.join(", "))
        })
        .collect();
    canonical.sort();

    let decoded_path = urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string());

    let mut text = format!(
        "{}\n{}\n{}\n{}\n",
        method.to_ascii_uppercase(),
        header(headers, "content-md5"),
        header(headers, "content-type"),
        header(headers, "date"),
    );
    for (name, value) in canonical {
        text.push_str(&name);
        text.push(':');
        text.push_str(&value);
        text.push('\n');
    }
    text.push_str(&decoded_path);

    if !queries.is_empty() {
        let mut pairs: Vec<String> = queries
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |v| format!("{key}={v}")))
            .collect();
        pairs.sort();
        text.push('\n');
        text.push_str(&pairs.join("\n"));
    }

    text
}

/// Signature the server expects in the `authorization` header.
pub fn compute(
    credentials: &Credentials,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    queries: &BTreeMap<String, Vec<String>>,
) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(credentials.access_key_secret.as_bytes())?;
    mac.update(string_to_sign(method, path, headers, queries).as_bytes());
    let digest = STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!("FC {}:{digest}", credentials.access_key_id))
}

/// Check the `authorization` header against the computed signature.
pub fn verify(
    credentials: &Credentials,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    queries: &BTreeMap<String, Vec<String>>,
) -> Result<()> {
    let expected = compute(credentials, method, path, headers, queries)?;
    let actual = header(headers, "authorization");
    if actual != expected {
        tracing::warn!(path, "Request signature mismatch");
        return Err(ServerError::SignatureMismatch {
            expected,
            actual: actual.to_string(),
        });
    }
    Ok(())
}
