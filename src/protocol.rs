//! graphql-transport-ws Wire Protocol
//!
//! Single responsibility: the message kinds, their shape rules, and the
//! stateless encode/validate/decode functions. No I/O.
//!
//! # Wire Format
//!
//! Every frame is a JSON object discriminated by `type`:
//!
//! ```text
//! { "type": "connection_init", "payload"?: {...} }
//! { "type": "connection_ack",  "payload"?: {...} }
//! { "type": "ping",            "payload"?: {...} }
//! { "type": "pong",            "payload"?: {...} }
//! { "type": "subscribe", "id": "<id>", "payload": { "query": "...", "operationName"?, "variables"?, "extensions"? } }
//! { "type": "next",      "id": "<id>", "payload": {...} }
//! { "type": "error",     "id": "<id>", "payload": [ { "message": "..." }, ... ] }
//! { "type": "complete",  "id": "<id>" }
//! ```
//!
//! A frame that does not match its kind's shape is rejected whole.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Sub-protocol negotiated on the WebSocket upgrade.
pub const GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

/// Largest close reason that fits a single control frame next to the code.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// A free-form JSON object payload.
pub type Payload = Map<String, Value>;

/// Rewrites JSON values during decode (reviver) or encode (replacer).
///
/// Called with the property key (array index as a string, `""` for the root)
/// and the value; returns the value to keep.
pub type ValueTransform = Arc<dyn Fn(&str, Value) -> Value + Send + Sync>;

/// Protocol validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ConnectionInit,
    ConnectionAck,
    Ping,
    Pong,
    Subscribe,
    Next,
    Error,
    Complete,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ConnectionInit => "connection_init",
            MessageType::ConnectionAck => "connection_ack",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Subscribe => "subscribe",
            MessageType::Next => "next",
            MessageType::Error => "error",
            MessageType::Complete => "complete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "connection_init" => MessageType::ConnectionInit,
            "connection_ack" => MessageType::ConnectionAck,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "subscribe" => MessageType::Subscribe,
            "next" => MessageType::Next,
            "error" => MessageType::Error,
            "complete" => MessageType::Complete,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The payload of a `subscribe` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub query: String,
    #[serde(
        rename = "operationName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Payload>,
}

impl SubscribePayload {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            operation_name: None,
            variables: None,
            extensions: None,
        }
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn with_variables(mut self, variables: Payload) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_extensions(mut self, extensions: Payload) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

/// A single error reported by the peer for an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    /// `locations`, `path`, `extensions` and anything else the peer sent.
    #[serde(flatten)]
    pub details: Payload,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Payload::new(),
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    Next {
        id: String,
        payload: Payload,
    },
    Error {
        id: String,
        payload: Vec<GraphQLError>,
    },
    Complete {
        id: String,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ConnectionInit { .. } => MessageType::ConnectionInit,
            Message::ConnectionAck { .. } => MessageType::ConnectionAck,
            Message::Ping { .. } => MessageType::Ping,
            Message::Pong { .. } => MessageType::Pong,
            Message::Subscribe { .. } => MessageType::Subscribe,
            Message::Next { .. } => MessageType::Next,
            Message::Error { .. } => MessageType::Error,
            Message::Complete { .. } => MessageType::Complete,
        }
    }

    /// Operation id, for the kinds that carry one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Subscribe { id, .. }
            | Message::Next { id, .. }
            | Message::Error { id, .. }
            | Message::Complete { id } => Some(id),
            _ => None,
        }
    }

    /// `next`, `error` and `complete` flow from the peer to an operation.
    pub fn is_operation_result(&self) -> bool {
        matches!(
            self,
            Message::Next { .. } | Message::Error { .. } | Message::Complete { .. }
        )
    }
}

/// Close codes the protocol assigns meaning to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    NormalClosure,
    GoingAway,
    ProtocolError,
    NoStatusReceived,
    AbnormalClosure,
    InternalError,
    InternalServerError,
    InternalClientError,
    BadRequest,
    BadResponse,
    Unauthorized,
    Forbidden,
    SubprotocolNotAcceptable,
    ConnectionInitialisationTimeout,
    ConnectionAcknowledgementTimeout,
    SubscriberAlreadyExists,
    TooManyInitialisationRequests,
    /// The client gave up on the socket before it settled.
    Terminated,
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::NormalClosure,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1005 => CloseCode::NoStatusReceived,
            1006 => CloseCode::AbnormalClosure,
            1011 => CloseCode::InternalError,
            4500 => CloseCode::InternalServerError,
            4005 => CloseCode::InternalClientError,
            4400 => CloseCode::BadRequest,
            4004 => CloseCode::BadResponse,
            4401 => CloseCode::Unauthorized,
            4403 => CloseCode::Forbidden,
            4406 => CloseCode::SubprotocolNotAcceptable,
            4408 => CloseCode::ConnectionInitialisationTimeout,
            4504 => CloseCode::ConnectionAcknowledgementTimeout,
            4409 => CloseCode::SubscriberAlreadyExists,
            4429 => CloseCode::TooManyInitialisationRequests,
            4499 => CloseCode::Terminated,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::NormalClosure => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::NoStatusReceived => 1005,
            CloseCode::AbnormalClosure => 1006,
            CloseCode::InternalError => 1011,
            CloseCode::InternalServerError => 4500,
            CloseCode::InternalClientError => 4005,
            CloseCode::BadRequest => 4400,
            CloseCode::BadResponse => 4004,
            CloseCode::Unauthorized => 4401,
            CloseCode::Forbidden => 4403,
            CloseCode::SubprotocolNotAcceptable => 4406,
            CloseCode::ConnectionInitialisationTimeout => 4408,
            CloseCode::ConnectionAcknowledgementTimeout => 4504,
            CloseCode::SubscriberAlreadyExists => 4409,
            CloseCode::TooManyInitialisationRequests => 4429,
            CloseCode::Terminated => 4499,
            CloseCode::Other(other) => other,
        }
    }
}

/// How and why a transport closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn with_code(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::new(code.into(), reason)
    }

    pub fn close_code(&self) -> CloseCode {
        CloseCode::from(self.code)
    }
}

impl fmt::Display for CloseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.reason)
        }
    }
}

/// Keep `reason` if it fits a close frame, otherwise use `fallback`.
pub fn limit_close_reason(reason: &str, fallback: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        reason.to_string()
    } else {
        fallback.to_string()
    }
}

/// Structural check of a decoded JSON value.
pub fn validate(value: &Value) -> bool {
    check_message(value).is_ok()
}

/// Decode a frame into a [`Message`], applying `reviver` to every value first.
pub fn decode(data: &[u8], reviver: Option<&ValueTransform>) -> Result<Message, ProtocolError> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

    let value = match reviver {
        Some(reviver) => revive("", value, reviver.as_ref()),
        None => value,
    };

    check_message(&value).map_err(ProtocolError::InvalidMessage)?;

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}

/// Encode a [`Message`] into a text frame, applying `replacer` before the
/// result is validated.
pub fn encode(message: &Message, replacer: Option<&ValueTransform>) -> Result<String, ProtocolError> {
    let value =
        serde_json::to_value(message).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))?;

    let value = match replacer {
        Some(replacer) => replace("", value, replacer.as_ref()),
        None => value,
    };

    check_message(&value).map_err(ProtocolError::InvalidMessage)?;

    serde_json::to_string(&value).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}

fn check_message(value: &Value) -> Result<(), String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "Message is expected to be an object".to_string())?;

    let kind = match obj.get("type") {
        Some(Value::String(s)) => {
            MessageType::parse(s).ok_or_else(|| format!("Invalid message 'type' property \"{}\"", s))?
        }
        Some(_) => return Err("Message is expected to have a string 'type' property".into()),
        None => return Err("Message is missing the 'type' property".into()),
    };

    match kind {
        MessageType::ConnectionInit
        | MessageType::ConnectionAck
        | MessageType::Ping
        | MessageType::Pong => match obj.get("payload") {
            None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(format!(
                "\"{}\" message expects the 'payload' property to be an object or nullish or missing",
                kind
            )),
        },
        MessageType::Subscribe => {
            check_id(obj, kind)?;
            let payload = obj
                .get("payload")
                .and_then(Value::as_object)
                .ok_or_else(|| format!("\"{}\" message expects the 'payload' property to be an object", kind))?;
            if !matches!(payload.get("query"), Some(Value::String(_))) {
                return Err(format!(
                    "\"{}\" message payload expects the 'query' property to be a string",
                    kind
                ));
            }
            match payload.get("operationName") {
                None | Some(Value::Null) | Some(Value::String(_)) => {}
                Some(_) => {
                    return Err(format!(
                        "\"{}\" message payload expects the 'operationName' property to be a string or nullish or missing",
                        kind
                    ))
                }
            }
            for field in ["variables", "extensions"] {
                match payload.get(field) {
                    None | Some(Value::Null) | Some(Value::Object(_)) => {}
                    Some(_) => {
                        return Err(format!(
                            "\"{}\" message payload expects the '{}' property to be an object or nullish or missing",
                            kind, field
                        ))
                    }
                }
            }
            Ok(())
        }
        MessageType::Next => {
            check_id(obj, kind)?;
            match obj.get("payload") {
                Some(Value::Object(_)) => Ok(()),
                _ => Err(format!(
                    "\"{}\" message expects the 'payload' property to be an object",
                    kind
                )),
            }
        }
        MessageType::Error => {
            check_id(obj, kind)?;
            let errors = obj.get("payload").and_then(Value::as_array);
            let valid = errors.is_some_and(|errors| {
                !errors.is_empty()
                    && errors.iter().all(|e| {
                        e.as_object()
                            .is_some_and(|e| matches!(e.get("message"), Some(Value::String(_))))
                    })
            });
            if valid {
                Ok(())
            } else {
                Err(format!(
                    "\"{}\" message expects the 'payload' property to be a non-empty array of errors with a 'message'",
                    kind
                ))
            }
        }
        MessageType::Complete => check_id(obj, kind),
    }
}

fn check_id(obj: &Map<String, Value>, kind: MessageType) -> Result<(), String> {
    match obj.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(()),
        Some(Value::String(_)) => Err(format!("\"{}\" message requires a non-empty 'id' property", kind)),
        _ => Err(format!("\"{}\" message expects the 'id' property to be a string", kind)),
    }
}

/// Bottom-up: children first, then the value itself.
fn revive(key: &str, value: Value, f: &(dyn Fn(&str, Value) -> Value + Send + Sync)) -> Value {
    let value = match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let v = revive(&k, v, f);
                    (k, v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| revive(&i.to_string(), v, f))
                .collect(),
        ),
        other => other,
    };
    f(key, value)
}

/// Top-down: the value first, then whatever children it turned into.
fn replace(key: &str, value: Value, f: &(dyn Fn(&str, Value) -> Value + Send + Sync)) -> Value {
    match f(key, value) {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let v = replace(&k, v, f);
                    (k, v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| replace(&i.to_string(), v, f))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_round_trip_every_kind() {
        let messages = vec![
            Message::ConnectionInit { payload: None },
            Message::ConnectionInit {
                payload: Some(object(json!({ "token": "abc" }))),
            },
            Message::ConnectionAck { payload: None },
            Message::Ping {
                payload: Some(object(json!({ "at": 1 }))),
            },
            Message::Pong { payload: None },
            Message::Subscribe {
                id: "a".into(),
                payload: SubscribePayload::new("{ x }")
                    .with_operation_name("X")
                    .with_variables(object(json!({ "n": 1 }))),
            },
            Message::Next {
                id: "a".into(),
                payload: object(json!({ "data": { "x": 1 } })),
            },
            Message::Error {
                id: "a".into(),
                payload: vec![GraphQLError {
                    message: "boom".into(),
                    details: object(json!({ "path": ["x"] })),
                }],
            },
            Message::Complete { id: "a".into() },
        ];

        for message in messages {
            let encoded = encode(&message, None).unwrap();
            let decoded = decode(encoded.as_bytes(), None).unwrap();
            assert_eq!(decoded, message, "round trip of {}", encoded);
        }
    }

    #[test]
    fn test_wire_shape_uses_camel_case_operation_name() {
        let message = Message::Subscribe {
            id: "1".into(),
            payload: SubscribePayload::new("{ x }").with_operation_name("Op"),
        };
        let value: Value = serde_json::from_str(&encode(&message, None).unwrap()).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["payload"]["operationName"], "Op");
        assert!(value["payload"].get("variables").is_none());
    }

    #[test]
    fn test_nullable_fields_are_accepted() {
        let raw = r#"{"type":"subscribe","id":"1","payload":{"query":"{ x }","operationName":null,"variables":null,"extensions":null}}"#;
        let decoded = decode(raw.as_bytes(), None).unwrap();
        assert_eq!(
            decoded,
            Message::Subscribe {
                id: "1".into(),
                payload: SubscribePayload::new("{ x }"),
            }
        );

        assert!(validate(&json!({ "type": "connection_ack", "payload": null })));
    }

    #[test]
    fn test_invalid_shapes_are_rejected() {
        let invalid = vec![
            json!("connection_init"),
            json!({}),
            json!({ "type": 1 }),
            json!({ "type": "unknown" }),
            json!({ "type": "connection_init", "payload": "token" }),
            json!({ "type": "ping", "payload": [] }),
            json!({ "type": "subscribe", "payload": { "query": "{ x }" } }),
            json!({ "type": "subscribe", "id": "", "payload": { "query": "{ x }" } }),
            json!({ "type": "subscribe", "id": 1, "payload": { "query": "{ x }" } }),
            json!({ "type": "subscribe", "id": "1" }),
            json!({ "type": "subscribe", "id": "1", "payload": { "query": 5 } }),
            json!({ "type": "subscribe", "id": "1", "payload": { "query": "{ x }", "operationName": 3 } }),
            json!({ "type": "subscribe", "id": "1", "payload": { "query": "{ x }", "variables": [] } }),
            json!({ "type": "subscribe", "id": "1", "payload": { "query": "{ x }", "extensions": "e" } }),
            json!({ "type": "next", "id": "1" }),
            json!({ "type": "next", "id": "1", "payload": "data" }),
            json!({ "type": "error", "id": "1", "payload": [] }),
            json!({ "type": "error", "id": "1", "payload": [{ "msg": "x" }] }),
            json!({ "type": "error", "id": "1", "payload": [{ "message": 1 }] }),
            json!({ "type": "error", "id": "1", "payload": { "message": "x" } }),
            json!({ "type": "complete" }),
        ];

        for value in invalid {
            assert!(!validate(&value), "expected invalid: {}", value);
            let err = decode(value.to_string().as_bytes(), None).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidMessage(_)), "{}", value);
        }
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let err = decode(b"{not json", None).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedJson(_)));
    }

    #[test]
    fn test_encode_refuses_malformed_state() {
        let empty_id = Message::Complete { id: String::new() };
        assert!(encode(&empty_id, None).is_err());

        let no_errors = Message::Error {
            id: "1".into(),
            payload: vec![],
        };
        assert!(encode(&no_errors, None).is_err());
    }

    #[test]
    fn test_reviver_rewrites_primitives() {
        let reviver: ValueTransform = Arc::new(|key: &str, value: Value| match (key, &value) {
            ("x", Value::Number(n)) => json!(n.as_i64().unwrap_or_default() * 10),
            _ => value,
        });
        let raw = r#"{"type":"next","id":"1","payload":{"data":{"x":2}}}"#;
        let decoded = decode(raw.as_bytes(), Some(&reviver)).unwrap();
        match decoded {
            Message::Next { payload, .. } => assert_eq!(payload["data"]["x"], 20),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_replacer_output_is_validated() {
        let breaks_type: ValueTransform = Arc::new(|key: &str, value: Value| {
            if key == "type" {
                json!("bogus")
            } else {
                value
            }
        });
        let err = encode(&Message::Ping { payload: None }, Some(&breaks_type)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_close_codes_convert_both_ways() {
        for code in [1000u16, 1002, 1005, 1006, 4400, 4401, 4409, 4429, 4499, 4500, 4504, 4999] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
        assert_eq!(CloseCode::from(4401), CloseCode::Unauthorized);
        assert_eq!(CloseCode::from(4999), CloseCode::Other(4999));
    }

    #[test]
    fn test_limit_close_reason() {
        assert_eq!(limit_close_reason("short", "Bad Request"), "short");
        let long = "x".repeat(MAX_CLOSE_REASON_BYTES + 1);
        assert_eq!(limit_close_reason(&long, "Bad Request"), "Bad Request");
        let exact = "y".repeat(MAX_CLOSE_REASON_BYTES);
        assert_eq!(limit_close_reason(&exact, "Bad Request"), exact);
    }
}
