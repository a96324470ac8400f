//! Coordinator event payloads
//!
//! Named Socket.IO events exchanged with the coordinator, and decoding of
//! inbound events into typed values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{AgentIdentity, CorrelationId, Credential, RequestKind, WorkRequest};

// ─────────────────────────────────────────────────────────────────
// Event Names
// ─────────────────────────────────────────────────────────────────

/// Coordinator greeting, triggers registration
pub const EVENT_WELCOME: &str = "welcome";

/// Agent registration
pub const EVENT_REGISTER: &str = "register";

/// Registration acknowledgement
pub const EVENT_REGISTERED: &str = "registered";

// ─────────────────────────────────────────────────────────────────
// Handshake Messages
// ─────────────────────────────────────────────────────────────────

/// Greeting sent by the coordinator after connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    /// Greeting text; any JSON type is accepted and only logged
    #[serde(default)]
    pub msg: Option<Value>,
}

impl WelcomeMessage {
    /// Greeting rendered for logs
    pub fn greeting(&self) -> Option<String> {
        self.msg.as_ref().map(|msg| match msg {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }
}

/// Registration sent in reply to a valid welcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub token: Credential,
    pub id: AgentIdentity,
}

/// Registration acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisteredAck {
    /// Session id assigned by the coordinator
    #[serde(default)]
    pub sid: Option<String>,
}

// ─────────────────────────────────────────────────────────────────
// Work Request Payload
// ─────────────────────────────────────────────────────────────────

/// Wire shape of a `predict` / `handle` argument
#[derive(Debug, Clone, Deserialize)]
struct WorkRequestPayload {
    #[serde(default)]
    id: Option<Value>,

    #[serde(default)]
    data: Value,

    #[serde(default)]
    timestamp: Option<Value>,

    #[serde(default)]
    method: Option<Value>,

    #[serde(default)]
    path: Option<Value>,
}

impl WorkRequestPayload {
    fn into_request(self, kind: RequestKind) -> Result<WorkRequest> {
        let id = match self.id {
            Some(Value::Null) | None => {
                return Err(Error::malformed("work request without correlation id"))
            }
            Some(id) => CorrelationId::new(id),
        };

        let method = text_field(&id, "method", self.method);
        let path = text_field(&id, "path", self.path);

        let mut request = WorkRequest::new(id, self.data).with_kind(kind);
        if let Some(method) = method.filter(|m| !m.trim().is_empty()) {
            request = request.with_method(method);
        }
        if let Some(path) = path.filter(|p| !p.is_empty()) {
            request = request.with_path(path);
        }
        request.sent_at = self.timestamp;
        Ok(request)
    }
}

/// Optional string field; other JSON types count as absent so the request
/// still gets its result
fn text_field(id: &CorrelationId, field: &'static str, value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) => Some(text),
        None | Some(Value::Null) => None,
        Some(other) => {
            warn!(%id, field, value = %other, "Ignoring non-string field");
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Inbound Events
// ─────────────────────────────────────────────────────────────────

/// Decoded coordinator event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Greeting; `None` when the payload is absent or `null`
    Welcome(Option<WelcomeMessage>),

    /// Registration acknowledged
    Registered(RegisteredAck),

    /// Work to relay
    WorkRequest(WorkRequest),

    /// Any event the agent does not act on
    Other { name: String },
}

impl InboundEvent {
    /// Decode a named event and its arguments
    pub fn decode(name: &str, args: Vec<Value>) -> Result<Self> {
        let first = args.into_iter().next();

        if name == EVENT_WELCOME {
            return Ok(InboundEvent::Welcome(decode_welcome(first)));
        }

        if name == EVENT_REGISTERED {
            let ack = match first {
                Some(Value::Object(map)) => {
                    serde_json::from_value(Value::Object(map)).unwrap_or_default()
                }
                _ => RegisteredAck::default(),
            };
            return Ok(InboundEvent::Registered(ack));
        }

        if let Some(kind) = RequestKind::from_event(name) {
            let payload = match first {
                Some(value @ Value::Object(_)) => value,
                _ => return Err(Error::malformed(format!("'{}' payload must be an object", name))),
            };
            let payload: WorkRequestPayload = serde_json::from_value(payload)?;
            return Ok(InboundEvent::WorkRequest(payload.into_request(kind)?));
        }

        Ok(InboundEvent::Other {
            name: name.to_string(),
        })
    }

    /// Event name for logging
    pub fn type_name(&self) -> &str {
        match self {
            InboundEvent::Welcome(_) => EVENT_WELCOME,
            InboundEvent::Registered(_) => EVENT_REGISTERED,
            InboundEvent::WorkRequest(request) => request.kind.event_name(),
            InboundEvent::Other { name } => name,
        }
    }
}

fn decode_welcome(arg: Option<Value>) -> Option<WelcomeMessage> {
    match arg {
        None | Some(Value::Null) => None,
        Some(Value::Object(mut map)) => Some(WelcomeMessage {
            msg: map.remove("msg").filter(|msg| !msg.is_null()),
        }),
        Some(_) => Some(WelcomeMessage { msg: None }),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_welcome_valid() {
        let event = InboundEvent::decode("welcome", vec![json!({"msg": "hi"})]).unwrap();
        assert_eq!(
            event,
            InboundEvent::Welcome(Some(WelcomeMessage { msg: Some(json!("hi")) }))
        );
    }

    #[test]
    fn test_welcome_absent_or_null_is_invalid() {
        assert_eq!(
            InboundEvent::decode("welcome", vec![]).unwrap(),
            InboundEvent::Welcome(None)
        );
        assert_eq!(
            InboundEvent::decode("welcome", vec![Value::Null]).unwrap(),
            InboundEvent::Welcome(None)
        );
    }

    #[test]
    fn test_welcome_any_defined_payload_is_valid() {
        let event = InboundEvent::decode("welcome", vec![json!({"msg": 5})]).unwrap();
        match event {
            InboundEvent::Welcome(Some(welcome)) => {
                assert_eq!(welcome.greeting().as_deref(), Some("5"));
            }
            other => panic!("Expected welcome, got {:?}", other),
        }

        for payload in [json!("hi"), json!(12), json!([1, 2])] {
            assert_eq!(
                InboundEvent::decode("welcome", vec![payload]).unwrap(),
                InboundEvent::Welcome(Some(WelcomeMessage { msg: None }))
            );
        }
    }

    #[test]
    fn test_welcome_without_msg_field_still_valid() {
        let event = InboundEvent::decode("welcome", vec![json!({})]).unwrap();
        assert_eq!(event, InboundEvent::Welcome(Some(WelcomeMessage { msg: None })));
    }

    #[test]
    fn test_registered_ack() {
        let event = InboundEvent::decode("registered", vec![json!({"sid": "s-1"})]).unwrap();
        assert_eq!(
            event,
            InboundEvent::Registered(RegisteredAck { sid: Some("s-1".into()) })
        );

        let event = InboundEvent::decode("registered", vec![]).unwrap();
        assert_eq!(event, InboundEvent::Registered(RegisteredAck::default()));
    }

    #[test]
    fn test_register_request_wire_format() {
        let register = RegisterRequest {
            token: Credential::new("tok"),
            id: AgentIdentity::from_config(Some("agent-1")),
        };
        assert_eq!(
            serde_json::to_value(&register).unwrap(),
            json!({"token": "tok", "id": "agent-1"})
        );
    }

    #[test]
    fn test_predict_event_decodes_request() {
        let event = InboundEvent::decode(
            "predict",
            vec![json!({
                "id": "req-9",
                "data": {"a": 1},
                "timestamp": 1700000000000u64,
                "method": "GET",
                "path": "/x"
            })],
        )
        .unwrap();

        match event {
            InboundEvent::WorkRequest(request) => {
                assert_eq!(request.id, CorrelationId::from("req-9"));
                assert_eq!(request.payload, json!({"a": 1}));
                assert_eq!(request.method.as_deref(), Some("GET"));
                assert_eq!(request.path.as_deref(), Some("/x"));
                assert_eq!(request.sent_at, Some(json!(1700000000000u64)));
                assert_eq!(request.kind, RequestKind::Predict);
            }
            other => panic!("Expected work request, got {:?}", other),
        }
    }

    #[test]
    fn test_handle_event_minimal_payload() {
        let event = InboundEvent::decode("handle", vec![json!({"id": 3})]).unwrap();
        match event {
            InboundEvent::WorkRequest(request) => {
                assert_eq!(request.id, CorrelationId::new(json!(3)));
                assert_eq!(request.payload, Value::Null);
                assert!(request.method.is_none());
                assert!(request.path.is_none());
                assert_eq!(request.kind, RequestKind::Handle);
            }
            other => panic!("Expected work request, got {:?}", other),
        }
    }

    #[test]
    fn test_non_string_method_and_path_are_ignored() {
        let event = InboundEvent::decode(
            "predict",
            vec![json!({"id": "r1", "data": {}, "method": 5, "path": ["a"]})],
        )
        .unwrap();
        match event {
            InboundEvent::WorkRequest(request) => {
                assert_eq!(request.id, CorrelationId::from("r1"));
                assert!(request.method.is_none());
                assert!(request.path.is_none());
            }
            other => panic!("Expected work request, got {:?}", other),
        }

        let event =
            InboundEvent::decode("handle", vec![json!({"id": 4, "method": null, "path": {}})]).unwrap();
        assert!(matches!(event, InboundEvent::WorkRequest(ref r) if r.path.is_none()));
    }

    #[test]
    fn test_work_request_without_id_is_malformed() {
        assert!(InboundEvent::decode("predict", vec![json!({"data": {}})]).is_err());
        assert!(InboundEvent::decode("predict", vec![json!({"id": null})]).is_err());
        assert!(InboundEvent::decode("predict", vec![]).is_err());
        assert!(InboundEvent::decode("handle", vec![json!("req")]).is_err());
    }

    #[test]
    fn test_unknown_event() {
        let event = InboundEvent::decode("metrics", vec![json!({})]).unwrap();
        assert_eq!(event.type_name(), "metrics");
    }
}
