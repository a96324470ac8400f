//! Engine.IO / Socket.IO packet framing
//!
//! The coordinator speaks Socket.IO over a WebSocket transport. Every text
//! frame is one Engine.IO packet; Engine.IO `message` packets carry one
//! Socket.IO packet. Binary attachments are not supported.
//!
//! Socket.IO packet layout:
//!
//! ```text
//! <type>[<namespace>,][<ack id>][<json>]
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

/// Default namespace
pub const ROOT_NAMESPACE: &str = "/";

/// Default Socket.IO mount path
pub const DEFAULT_PATH: &str = "/socket.io/";

// ─────────────────────────────────────────────────────────────────
// Engine Revision
// ─────────────────────────────────────────────────────────────────

/// Engine.IO protocol revision spoken on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EngineRevision {
    /// Socket.IO 2.x servers: client sends pings, namespace auto-connects
    V3,
    /// Socket.IO 3.x/4.x servers: server sends pings, client connects namespace
    V4,
}

impl Default for EngineRevision {
    fn default() -> Self {
        EngineRevision::V4
    }
}

impl TryFrom<u8> for EngineRevision {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            3 => Ok(EngineRevision::V3),
            4 => Ok(EngineRevision::V4),
            other => Err(format!("unsupported Engine.IO revision {} (expected 3 or 4)", other)),
        }
    }
}

impl std::str::FromStr for EngineRevision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let value: u8 = s
            .trim()
            .parse()
            .map_err(|_| format!("'{}' is not an Engine.IO revision", s))?;
        Self::try_from(value)
    }
}

impl From<EngineRevision> for u8 {
    fn from(revision: EngineRevision) -> u8 {
        match revision {
            EngineRevision::V3 => 3,
            EngineRevision::V4 => 4,
        }
    }
}

impl fmt::Display for EngineRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// Build the WebSocket endpoint for a coordinator address.
///
/// `http`/`https` map to `ws`/`wss`. A bare host gets the default
/// `/socket.io/` path; any other path is taken as the Engine.IO mount path,
/// never as a namespace. Extra query pairs are appended after the transport
/// parameters.
pub fn endpoint_url(
    address: &str,
    revision: EngineRevision,
    query: &BTreeMap<String, String>,
) -> Result<Url> {
    let mut url = Url::parse(address)
        .map_err(|e| Error::unreachable(address, format!("invalid URL: {}", e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::unreachable(
                address,
                format!("unsupported scheme '{}'", other),
            ))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::unreachable(address, "cannot switch to WebSocket scheme"))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(DEFAULT_PATH);
    }

    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("EIO", &revision.to_string());
        pairs.append_pair("transport", "websocket");
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }

    Ok(url)
}

// ─────────────────────────────────────────────────────────────────
// Engine.IO Packets
// ─────────────────────────────────────────────────────────────────

/// Handshake data sent by the server in the `open` packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    /// Engine session id
    pub sid: String,

    /// Possible transport upgrades
    #[serde(default)]
    pub upgrades: Vec<String>,

    /// Heartbeat interval (ms)
    pub ping_interval: u64,

    /// Heartbeat timeout (ms)
    pub ping_timeout: u64,
}

/// One Engine.IO packet (one WebSocket text frame)
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(Option<String>),
    Pong(Option<String>),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

impl EnginePacket {
    /// Decode a text frame
    pub fn decode(frame: &str) -> Result<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| Error::malformed("empty Engine.IO frame"))?;
        let body = chars.as_str();
        let optional = |s: &str| (!s.is_empty()).then(|| s.to_string());

        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(body)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(optional(body))),
            '3' => Ok(EnginePacket::Pong(optional(body))),
            '4' => Ok(EnginePacket::Message(SocketPacket::decode(body)?)),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(Error::malformed(format!(
                "unknown Engine.IO packet type '{}'",
                other
            ))),
        }
    }

    /// Encode as a text frame
    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(handshake) => format!(
                "0{}",
                serde_json::to_value(handshake).unwrap_or(Value::Null)
            ),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{}", data.as_deref().unwrap_or("")),
            EnginePacket::Pong(data) => format!("3{}", data.as_deref().unwrap_or("")),
            EnginePacket::Message(packet) => format!("4{}", packet.encode()),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Socket.IO Packets
// ─────────────────────────────────────────────────────────────────

/// One Socket.IO packet
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Option<Value>,
    },
}

impl SocketPacket {
    /// Namespace connect request for the root namespace
    pub fn connect() -> Self {
        SocketPacket::Connect {
            namespace: ROOT_NAMESPACE.to_string(),
            data: None,
        }
    }

    /// Namespace disconnect for the root namespace
    pub fn disconnect() -> Self {
        SocketPacket::Disconnect {
            namespace: ROOT_NAMESPACE.to_string(),
        }
    }

    /// Event on the root namespace with a single serialized argument
    pub fn event(name: &str, payload: &impl Serialize) -> Result<Self> {
        Ok(SocketPacket::Event {
            namespace: ROOT_NAMESPACE.to_string(),
            ack_id: None,
            name: name.to_string(),
            args: vec![serde_json::to_value(payload)?],
        })
    }

    fn type_digit(&self) -> char {
        match self {
            SocketPacket::Connect { .. } => '0',
            SocketPacket::Disconnect { .. } => '1',
            SocketPacket::Event { .. } => '2',
            SocketPacket::Ack { .. } => '3',
            SocketPacket::ConnectError { .. } => '4',
        }
    }

    fn namespace(&self) -> &str {
        match self {
            SocketPacket::Connect { namespace, .. }
            | SocketPacket::Disconnect { namespace }
            | SocketPacket::Event { namespace, .. }
            | SocketPacket::Ack { namespace, .. }
            | SocketPacket::ConnectError { namespace, .. } => namespace,
        }
    }

    /// Decode the body of an Engine.IO `message` packet
    pub fn decode(body: &str) -> Result<Self> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| Error::malformed("empty Socket.IO packet"))?;
        let mut rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(Error::malformed("binary Socket.IO packets are not supported"));
        }

        let mut namespace = ROOT_NAMESPACE.to_string();
        if rest.starts_with('/') {
            let end = rest.find(',').unwrap_or(rest.len());
            namespace = rest[..end].to_string();
            rest = rest.get(end + 1..).unwrap_or("");
        }

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse::<u64>()
                .map_err(|e| Error::malformed(format!("invalid ack id: {}", e)))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        match kind {
            '0' => Ok(SocketPacket::Connect { namespace, data }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => {
                let mut items = match data {
                    Some(Value::Array(items)) => items.into_iter(),
                    _ => return Err(Error::malformed("event payload must be a JSON array")),
                };
                let name = match items.next() {
                    Some(Value::String(name)) => name,
                    _ => return Err(Error::malformed("event name must be a string")),
                };
                Ok(SocketPacket::Event {
                    namespace,
                    ack_id,
                    name,
                    args: items.collect(),
                })
            }
            '3' => {
                let ack_id = ack_id.ok_or_else(|| Error::malformed("ack without id"))?;
                let args = match data {
                    Some(Value::Array(items)) => items,
                    None => Vec::new(),
                    Some(_) => return Err(Error::malformed("ack payload must be a JSON array")),
                };
                Ok(SocketPacket::Ack { namespace, ack_id, args })
            }
            '4' => Ok(SocketPacket::ConnectError { namespace, data }),
            other => Err(Error::malformed(format!(
                "unknown Socket.IO packet type '{}'",
                other
            ))),
        }
    }

    /// Encode as the body of an Engine.IO `message` packet
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.type_digit());

        let namespace = self.namespace();
        if namespace != ROOT_NAMESPACE {
            out.push_str(namespace);
            out.push(',');
        }

        match self {
            SocketPacket::Connect { data, .. } | SocketPacket::ConnectError { data, .. } => {
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
            }
            SocketPacket::Disconnect { .. } => {}
            SocketPacket::Event { ack_id, name, args, .. } => {
                if let Some(id) = ack_id {
                    out.push_str(&id.to_string());
                }
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                out.push_str(&Value::Array(items).to_string());
            }
            SocketPacket::Ack { ack_id, args, .. } => {
                out.push_str(&ack_id.to_string());
                out.push_str(&Value::Array(args.clone()).to_string());
            }
        }

        out
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
    fn test_revision_from_str() {
        assert_eq!("3".parse::<EngineRevision>(), Ok(EngineRevision::V3));
        assert_eq!(" 4 ".parse::<EngineRevision>(), Ok(EngineRevision::V4));
        assert!("5".parse::<EngineRevision>().is_err());
        assert!("four".parse::<EngineRevision>().is_err());
    }

    #[test]
    fn test_decode_open_handshake() {
        let frame = r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
        match EnginePacket::decode(frame).unwrap() {
            EnginePacket::Open(handshake) => {
                assert_eq!(handshake.sid, "abc");
                assert_eq!(handshake.ping_interval, 25000);
                assert_eq!(handshake.ping_timeout, 20000);
            }
            other => panic!("Expected open packet, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_pong_frames() {
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping(None));
        assert_eq!(
            EnginePacket::decode("2probe").unwrap(),
            EnginePacket::Ping(Some("probe".to_string()))
        );
        assert_eq!(EnginePacket::Pong(None).encode(), "3");
        assert_eq!(EnginePacket::Pong(Some("probe".into())).encode(), "3probe");
    }

    #[test]
    fn test_decode_event_with_payload() {
        let frame = r#"42["welcome",{"msg":"hello agent"}]"#;
        match EnginePacket::decode(frame).unwrap() {
            EnginePacket::Message(SocketPacket::Event { namespace, ack_id, name, args }) => {
                assert_eq!(namespace, "/");
                assert_eq!(ack_id, None);
                assert_eq!(name, "welcome");
                assert_eq!(args, vec![json!({"msg": "hello agent"})]);
            }
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_event_without_args() {
        match SocketPacket::decode(r#"2["welcome"]"#).unwrap() {
            SocketPacket::Event { name, args, .. } => {
                assert_eq!(name, "welcome");
                assert!(args.is_empty());
            }
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_namespace_and_ack_id() {
        match SocketPacket::decode(r#"2/admin,17["predict",{"id":"a"}]"#).unwrap() {
            SocketPacket::Event { namespace, ack_id, name, .. } => {
                assert_eq!(namespace, "/admin");
                assert_eq!(ack_id, Some(17));
                assert_eq!(name, "predict");
            }
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_connect_variants() {
        assert_eq!(
            SocketPacket::decode("0").unwrap(),
            SocketPacket::Connect { namespace: "/".into(), data: None }
        );
        assert_eq!(
            SocketPacket::decode(r#"0{"sid":"xyz"}"#).unwrap(),
            SocketPacket::Connect { namespace: "/".into(), data: Some(json!({"sid": "xyz"})) }
        );
        assert_eq!(
            SocketPacket::decode(r#"4{"message":"Not authorized"}"#).unwrap(),
            SocketPacket::ConnectError {
                namespace: "/".into(),
                data: Some(json!({"message": "Not authorized"}))
            }
        );
    }

    #[test]
    fn test_reject_malformed_packets() {
        assert!(EnginePacket::decode("").is_err());
        assert!(EnginePacket::decode("9").is_err());
        assert!(SocketPacket::decode(r#"2{"not":"array"}"#).is_err());
        assert!(SocketPacket::decode(r#"2[42]"#).is_err());
        assert!(SocketPacket::decode(r#"51-["upload",{"_placeholder":true,"num":0}]"#).is_err());
    }

    #[test]
    fn test_encode_event() {
        let packet = SocketPacket::event("register", &json!({"token": "", "id": "agent-1"})).unwrap();
        let frame = EnginePacket::Message(packet).encode();
        assert!(frame.starts_with(r#"42["register","#));

        let body: Value = serde_json::from_str(&frame[2..]).unwrap();
        assert_eq!(body, json!(["register", {"id": "agent-1", "token": ""}]));
    }

    #[test]
    fn test_encode_namespace_packets() {
        assert_eq!(EnginePacket::Message(SocketPacket::connect()).encode(), "40");
        assert_eq!(EnginePacket::Message(SocketPacket::disconnect()).encode(), "41");

        let packet = SocketPacket::Event {
            namespace: "/relay".into(),
            ack_id: Some(3),
            name: "response".into(),
            args: vec![json!(1)],
        };
        assert_eq!(packet.encode(), r#"2/relay,3["response",1]"#);
    }

    #[test]
    fn test_endpoint_url_defaults() {
        let url = endpoint_url("http://127.0.0.1:8888", EngineRevision::V4, &BTreeMap::new()).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:8888/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn test_endpoint_url_custom_path_and_query() {
        let mut query = BTreeMap::new();
        query.insert("pool".to_string(), "gpu".to_string());

        let url = endpoint_url("https://gate.example.com/relay/", EngineRevision::V3, &query).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/relay/");
        assert_eq!(url.query(), Some("EIO=3&transport=websocket&pool=gpu"));
    }

    #[test]
    fn test_endpoint_url_rejects_other_schemes() {
        assert!(endpoint_url("ftp://host", EngineRevision::V4, &BTreeMap::new()).is_err());
        assert!(endpoint_url("not a url", EngineRevision::V4, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_engine_revision_serde() {
        assert_eq!(serde_json::to_string(&EngineRevision::V3).unwrap(), "3");
        let parsed: EngineRevision = serde_json::from_str("4").unwrap();
        assert_eq!(parsed, EngineRevision::V4);
        assert!(serde_json::from_str::<EngineRevision>("5").is_err());
    }
}
