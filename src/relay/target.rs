//! Relay target trait and HTTP implementation
//!
//! A target performs one outbound call. Any received response counts as a
//! completed call regardless of its status code; only transport-level
//! failures are errors.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// One outbound call derived from a work request
#[derive(Debug, Clone, PartialEq)]
pub struct TargetCall {
    pub method: Method,
    pub url: String,
    /// JSON body; `None` sends no body
    pub body: Option<Value>,
}

/// Destination of relayed calls
#[async_trait]
pub trait RelayTarget: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Perform the call and return the decoded response body
    async fn call(&self, call: TargetCall) -> Result<Value>;
}

// ─────────────────────────────────────────────────────────────────
// HTTP Target
// ─────────────────────────────────────────────────────────────────

/// Options for the HTTP client used by [`HttpTarget`]
#[derive(Debug, Clone, Default)]
pub struct HttpTargetOptions {
    /// Per-call timeout; `None` leaves reqwest's default (no timeout)
    pub timeout: Option<Duration>,

    /// Skip TLS certificate verification
    pub accept_invalid_certs: bool,
}

/// reqwest-backed relay target
pub struct HttpTarget {
    client: Client,
}

impl HttpTarget {
    /// Build the HTTP client
    pub fn new(options: &HttpTargetOptions) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(options.accept_invalid_certs);

        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RelayTarget for HttpTarget {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn call(&self, call: TargetCall) -> Result<Value> {
        let mut request = self.client.request(call.method.clone(), call.url.as_str());
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        debug!(
            method = %call.method,
            url = %call.url,
            status = status.as_u16(),
            bytes = bytes.len(),
            "Target responded"
        );

        Ok(decode_body(&bytes))
    }
}

/// JSON bodies are relayed as JSON, anything else as a string
pub fn decode_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::String(String::new());
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Parse a request method, case-insensitively
pub fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| Error::bad_request(format!("invalid HTTP method '{}'", method)))
}
