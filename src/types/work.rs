//! Work request and result types
//!
//! A `WorkRequest` is decoded from an inbound coordinator event and consumed
//! exactly once by the relay dispatcher, which answers it with exactly one
//! `WorkResult` carrying the same correlation token.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────
// Request Kind
// ─────────────────────────────────────────────────────────────────

/// Which inbound event carried a work request.
///
/// The completion event name is paired with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    /// `predict` answered by `predicted`
    #[default]
    Predict,
    /// `handle` answered by `response`
    Handle,
}

impl RequestKind {
    /// Map an inbound event name to a request kind
    pub fn from_event(name: &str) -> Option<Self> {
        match name {
            "predict" => Some(RequestKind::Predict),
            "handle" => Some(RequestKind::Handle),
            _ => None,
        }
    }

    /// Inbound event name
    pub fn event_name(&self) -> &'static str {
        match self {
            RequestKind::Predict => "predict",
            RequestKind::Handle => "handle",
        }
    }

    /// Outbound completion event name
    pub fn completion_event(&self) -> &'static str {
        match self {
            RequestKind::Predict => "predicted",
            RequestKind::Handle => "response",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

// ─────────────────────────────────────────────────────────────────
// Correlation Id
// ─────────────────────────────────────────────────────────────────

/// Opaque correlation token, echoed back unchanged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Value);

impl CorrelationId {
    pub fn new(value: Value) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(Value::String(id.to_string()))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Work Request
// ─────────────────────────────────────────────────────────────────

/// A unit of work received from the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct WorkRequest {
    /// Correlation token
    pub id: CorrelationId,

    /// Body forwarded to the target service
    pub payload: Value,

    /// HTTP verb (default applied by the dispatcher)
    pub method: Option<String>,

    /// Suffix appended to the target base URL
    pub path: Option<String>,

    /// Coordinator-side timestamp, kept for logging only
    pub sent_at: Option<Value>,

    /// When the agent decoded the request
    pub received_at: DateTime<Utc>,

    /// Inbound event that carried the request
    pub kind: RequestKind,
}

impl WorkRequest {
    /// Create a request with only an id and payload
    pub fn new(id: impl Into<CorrelationId>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            method: None,
            path: None,
            sent_at: None,
            received_at: Utc::now(),
            kind: RequestKind::Predict,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_kind(mut self, kind: RequestKind) -> Self {
        self.kind = kind;
        self
    }
}

// ─────────────────────────────────────────────────────────────────
// Work Result
// ─────────────────────────────────────────────────────────────────

/// Completion report for one work request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    /// Correlation token of the originating request
    pub id: CorrelationId,

    /// Whether the outbound call completed without transport error
    pub success: bool,

    /// Response payload, or `{}` on failure
    pub data: Value,

    /// Selects the completion event name; not part of the payload
    #[serde(skip)]
    pub kind: RequestKind,
}

impl WorkResult {
    /// Successful completion carrying the response body
    pub fn success(request: &WorkRequest, data: Value) -> Self {
        Self {
            id: request.id.clone(),
            success: true,
            data,
            kind: request.kind,
        }
    }

    /// Failed completion; failure detail is never sent to the coordinator
    pub fn failure(request: &WorkRequest) -> Self {
        Self {
            id: request.id.clone(),
            success: false,
            data: Value::Object(serde_json::Map::new()),
            kind: request.kind,
        }
    }

    /// Name of the event used to report this result
    pub fn event_name(&self) -> &'static str {
        self.kind.completion_event()
    }
}
