//! # fclocal-server
//!
//! Local HTTP front end for serverless functions running in containers.
//!
//! Reads a function manifest, serves each function's HTTP trigger and the
//! API invoke endpoint, and replaces warm runners when code changes.
//!
//! ## Quick Start
//!
//! ```bash
//! export FCLOCAL_MANIFEST=/path/to/fclocal.json
//! export FCLOCAL_ACCESS_KEY_ID=...
//! export FCLOCAL_ACCESS_KEY_SECRET=...
//! cargo run -p fclocal-server
//! ```
//!
//! Invoke one function with an event from stdin:
//!
//! ```bash
//! echo '{"key":"value"}' | FCLOCAL_MODE=invoke FCLOCAL_FUNCTION=demo/hello cargo run -p fclocal-server
//! ```
//!
//! ## Endpoints
//!
//! | Route | Description |
//! |-------|-------------|
//! | `GET /health` | Liveness check |
//! | `ANY /2016-08-15/proxy/{service}/{function}/...` | HTTP trigger, restricted to the trigger's methods |
//! | `POST /2016-08-15/services/{service}/functions/{function}/invocations` | API invoke, body passthrough |
//!
//! Requests are signed as `FC <accessKeyId>:<HMAC-SHA256>` in the
//! `authorization` header; anonymous HTTP triggers skip the check.

mod config;
mod error;
pub mod http;
mod manifest;
pub mod signature;
mod state;
pub mod trigger;

pub use config::{ConfigError, ServerConfig, ServerMode, MAX_BODY_BYTES};
pub use error::{Result, ServerError};
pub use manifest::{FunctionDef, HttpTrigger, Manifest};
pub use state::{AppState, FunctionEntry, HttpRoute, PROXY_PREFIX};
