//! Frame codec
//!
//! Pure translation between protocol intents and JSON text frames. Every
//! frame is one JSON object whose `msg` field names its kind:
//!
//! | direction | msg | fields |
//! |---|---|---|
//! | out | `connect` | `version`, `support` |
//! | in | `connected` / `failed` | `session` / `version` |
//! | out | `method` | `id`, `method`, `params` |
//! | in | `result` | `id`, `result?`, `error?` |
//! | out | `sub` / `unsub` | `id`, `name`, `params` / `id` |
//! | in | `ready` / `nosub` | `subs` / `id`, `error?` |
//! | in | `added` / `changed` / `removed` | `collection`, `id`, `fields` |
//! | both | `ping` / `pong` | `id?` |
//!
//! Decoding never fails: malformed input comes back as
//! [`Envelope::Unparseable`] so the driver can log and drop it.

use crate::error::{DdpError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Protocol versions offered in the handshake, preferred first
pub const DDP_VERSIONS: [&str; 3] = ["1", "pre2", "pre1"];

#[derive(Debug, Serialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
enum Outgoing<'a> {
    Connect {
        version: &'a str,
        support: &'a [String],
    },
    Method {
        id: &'a str,
        method: &'a str,
        params: &'a [Value],
    },
    Sub {
        id: &'a str,
        name: &'a str,
        params: &'a [Value],
    },
    Unsub {
        id: &'a str,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a str>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a str>,
    },
}

fn encode(frame: &Outgoing<'_>) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Encode the version-negotiation frame. The first entry is the version
/// we ask for; the whole list is advertised as supported.
pub fn encode_handshake(supported_versions: &[String]) -> Result<String> {
    let version = supported_versions
        .first()
        .ok_or_else(|| DdpError::Configuration("no protocol versions configured".into()))?;
    encode(&Outgoing::Connect {
        version,
        support: supported_versions,
    })
}

pub fn encode_method_call(id: &str, method: &str, params: &[Value]) -> Result<String> {
    encode(&Outgoing::Method { id, method, params })
}

pub fn encode_subscribe(id: &str, name: &str, params: &[Value]) -> Result<String> {
    encode(&Outgoing::Sub { id, name, params })
}

pub fn encode_unsubscribe(id: &str) -> Result<String> {
    encode(&Outgoing::Unsub { id })
}

pub fn encode_ping(id: Option<&str>) -> Result<String> {
    encode(&Outgoing::Ping { id })
}

pub fn encode_pong(id: Option<&str>) -> Result<String> {
    encode(&Outgoing::Pong { id })
}

/// Error body carried by `result`, `nosub` and login failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code; servers send either a string or a number
    #[serde(default)]
    pub error: Value,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "errorType")]
    pub error_type: Option<String>,
}

impl ErrorBody {
    pub fn code(&self) -> String {
        match &self.error {
            Value::String(s) => s.clone(),
            Value::Null => "unknown".to_string(),
            other => other.to_string(),
        }
    }

    pub fn reason(&self) -> String {
        self.reason
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| self.code())
    }

    pub fn into_error(self) -> DdpError {
        DdpError::Protocol {
            code: self.code(),
            reason: self.reason(),
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.reason())
    }
}

/// Kind of a collection data push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Added,
    Changed,
    Removed,
}

/// A decoded `added` / `changed` / `removed` frame
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub kind: DataKind,
    pub collection: Option<String>,
    pub id: Option<String>,
    pub fields: Value,
}

impl DataFrame {
    /// `fields.eventName`, used by streamer collections to scope events
    pub fn event_name(&self) -> Option<&str> {
        self.fields.get("eventName").and_then(Value::as_str)
    }

    /// `fields.args`, empty when absent
    pub fn args(&self) -> Vec<Value> {
        match self.fields.get("args") {
            Some(Value::Array(args)) => args.clone(),
            _ => Vec::new(),
        }
    }
}

/// Push event handed to subscription sinks
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// Stable handle id of the subscription this event was matched to
    pub subscription_id: String,
    pub kind: DataKind,
    pub collection: Option<String>,
    pub id: Option<String>,
    pub event_name: Option<String>,
    pub args: Vec<Value>,
    pub fields: Value,
}

impl PushEvent {
    pub(crate) fn from_frame(subscription_id: &str, frame: &DataFrame) -> Self {
        Self {
            subscription_id: subscription_id.to_string(),
            kind: frame.kind,
            collection: frame.collection.clone(),
            id: frame.id.clone(),
            event_name: frame.event_name().map(str::to_string),
            args: frame.args(),
            fields: frame.fields.clone(),
        }
    }
}

/// Typed view of one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Connected { session: String },
    Failed { version: Option<String> },
    Result {
        id: String,
        result: Option<Value>,
        error: Option<ErrorBody>,
    },
    Updated { methods: Vec<String> },
    Ready { subs: Vec<String> },
    Nosub { id: String, error: Option<ErrorBody> },
    Data(DataFrame),
    Ping { id: Option<String> },
    Pong { id: Option<String> },
    Error { reason: String, offending: Option<Value> },
    /// Legacy `{"server_id": ..}` greeting
    ServerId,
    Unparseable { raw: String, reason: String },
}

impl Envelope {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Connected { .. } => "connected",
            Envelope::Failed { .. } => "failed",
            Envelope::Result { .. } => "result",
            Envelope::Updated { .. } => "updated",
            Envelope::Ready { .. } => "ready",
            Envelope::Nosub { .. } => "nosub",
            Envelope::Data(frame) => match frame.kind {
                DataKind::Added => "added",
                DataKind::Changed => "changed",
                DataKind::Removed => "removed",
            },
            Envelope::Ping { .. } => "ping",
            Envelope::Pong { .. } => "pong",
            Envelope::Error { .. } => "error",
            Envelope::ServerId => "server_id",
            Envelope::Unparseable { .. } => "unparseable",
        }
    }
}

fn unparseable(raw: &str, reason: impl Into<String>) -> Envelope {
    Envelope::Unparseable {
        raw: raw.to_string(),
        reason: reason.into(),
    }
}

fn take_string(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
    match obj.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

fn take_strings(obj: &mut Map<String, Value>, key: &str) -> Vec<String> {
    match obj.remove(key) {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Error bodies are usually objects, but a bare string or number is
/// still an error answer and must settle the operation it belongs to.
fn take_error(obj: &mut Map<String, Value>) -> Option<ErrorBody> {
    match obj.remove("error")? {
        Value::Null => None,
        Value::Object(body) => Some(
            serde_json::from_value(Value::Object(body.clone())).unwrap_or_else(|_| ErrorBody {
                error: body.get("error").cloned().unwrap_or(Value::Null),
                reason: body.get("reason").map(value_text),
                message: body.get("message").map(value_text),
                error_type: None,
            }),
        ),
        Value::String(text) => Some(ErrorBody {
            error: Value::String(text.clone()),
            reason: Some(text),
            message: None,
            error_type: None,
        }),
        other => Some(ErrorBody {
            error: other,
            reason: None,
            message: None,
            error_type: None,
        }),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decode one inbound text frame
pub fn decode(raw: &str) -> Envelope {
    let mut obj = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(obj)) => obj,
        Ok(_) => return unparseable(raw, "frame is not a JSON object"),
        Err(e) => return unparseable(raw, e.to_string()),
    };

    let msg = match take_string(&mut obj, "msg") {
        Some(msg) => msg,
        None if obj.contains_key("server_id") => return Envelope::ServerId,
        None => return unparseable(raw, "missing msg field"),
    };

    match msg.as_str() {
        "connected" => match take_string(&mut obj, "session") {
            Some(session) => Envelope::Connected { session },
            None => unparseable(raw, "connected without session"),
        },
        "failed" => Envelope::Failed {
            version: take_string(&mut obj, "version"),
        },
        "result" => {
            let Some(id) = take_string(&mut obj, "id") else {
                return unparseable(raw, "result without id");
            };
            Envelope::Result {
                error: take_error(&mut obj),
                result: obj.remove("result"),
                id,
            }
        }
        "updated" => Envelope::Updated {
            methods: take_strings(&mut obj, "methods"),
        },
        "ready" => Envelope::Ready {
            subs: take_strings(&mut obj, "subs"),
        },
        "nosub" => {
            let Some(id) = take_string(&mut obj, "id") else {
                return unparseable(raw, "nosub without id");
            };
            Envelope::Nosub {
                error: take_error(&mut obj),
                id,
            }
        }
        "added" | "changed" | "removed" => {
            let kind = match msg.as_str() {
                "added" => DataKind::Added,
                "changed" => DataKind::Changed,
                _ => DataKind::Removed,
            };
            Envelope::Data(DataFrame {
                kind,
                collection: take_string(&mut obj, "collection"),
                id: take_string(&mut obj, "id"),
                fields: obj.remove("fields").unwrap_or(Value::Null),
            })
        }
        "ping" => Envelope::Ping {
            id: take_string(&mut obj, "id"),
        },
        "pong" => Envelope::Pong {
            id: take_string(&mut obj, "id"),
        },
        "error" => Envelope::Error {
            reason: take_string(&mut obj, "reason").unwrap_or_else(|| "unspecified".into()),
            offending: obj.remove("offendingMessage"),
        },
        other => unparseable(raw, format!("unknown msg kind '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_json(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_encode_handshake_offers_all_versions() {
        let versions: Vec<String> = DDP_VERSIONS.iter().map(|v| v.to_string()).collect();
        let frame = as_json(&encode_handshake(&versions).unwrap());
        assert_eq!(
            frame,
            json!({"msg": "connect", "version": "1", "support": ["1", "pre2", "pre1"]})
        );
    }

    #[test]
    fn test_encode_handshake_without_versions_fails() {
        assert!(matches!(
            encode_handshake(&[]),
            Err(DdpError::Configuration(_))
        ));
    }

    #[test]
    fn test_encode_method_and_subscription_frames() {
        let call = as_json(&encode_method_call("c1", "echo", &[json!("x")]).unwrap());
        assert_eq!(call, json!({"msg": "method", "id": "c1", "method": "echo", "params": ["x"]}));

        let sub = as_json(&encode_subscribe("7", "room-events", &[json!("r1"), json!(false)]).unwrap());
        assert_eq!(
            sub,
            json!({"msg": "sub", "id": "7", "name": "room-events", "params": ["r1", false]})
        );

        let unsub = as_json(&encode_unsubscribe("7").unwrap());
        assert_eq!(unsub, json!({"msg": "unsub", "id": "7"}));
    }

    #[test]
    fn test_encode_ping_pong_optional_id() {
        assert_eq!(as_json(&encode_ping(None).unwrap()), json!({"msg": "ping"}));
        assert_eq!(
            as_json(&encode_pong(Some("p9")).unwrap()),
            json!({"msg": "pong", "id": "p9"})
        );
    }

    #[test]
    fn test_decode_handshake_frames() {
        assert_eq!(
            decode(r#"{"msg":"connected","session":"abc"}"#),
            Envelope::Connected { session: "abc".into() }
        );
        assert_eq!(
            decode(r#"{"msg":"failed","version":"1"}"#),
            Envelope::Failed { version: Some("1".into()) }
        );
        assert_eq!(decode(r#"{"server_id":"0"}"#), Envelope::ServerId);
    }

    #[test]
    fn test_decode_result_with_numeric_error_code() {
        let envelope = decode(
            r#"{"msg":"result","id":"4","error":{"error":403,"reason":"User not found","errorType":"Meteor.Error"}}"#,
        );
        match envelope {
            Envelope::Result { id, result, error: Some(error) } => {
                assert_eq!(id, "4");
                assert!(result.is_none());
                assert_eq!(error.code(), "403");
                assert_eq!(error.reason(), "User not found");
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_decode_non_object_error_bodies() {
        match decode(r#"{"msg":"result","id":"5","error":"boom"}"#) {
            Envelope::Result { id, error: Some(error), .. } => {
                assert_eq!(id, "5");
                assert_eq!(error.code(), "boom");
                assert_eq!(error.reason(), "boom");
            }
            other => panic!("unexpected envelope: {:?}", other),
        }

        match decode(r#"{"msg":"nosub","id":"s1","error":404}"#) {
            Envelope::Nosub { id, error: Some(error) } => {
                assert_eq!(id, "s1");
                assert_eq!(error.code(), "404");
            }
            other => panic!("unexpected envelope: {:?}", other),
        }

        match decode(r#"{"msg":"result","id":"6","error":{"error":"x","reason":17}}"#) {
            Envelope::Result { error: Some(error), .. } => {
                assert_eq!(error.code(), "x");
                assert_eq!(error.reason(), "17");
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_decode_result_payload() {
        assert_eq!(
            decode(r#"{"msg":"result","id":"c1","result":{"msg":"x"}}"#),
            Envelope::Result {
                id: "c1".into(),
                result: Some(json!({"msg": "x"})),
                error: None,
            }
        );
    }

    #[test]
    fn test_decode_subscription_frames() {
        assert_eq!(
            decode(r#"{"msg":"ready","subs":["s1","s2"]}"#),
            Envelope::Ready { subs: vec!["s1".into(), "s2".into()] }
        );
        assert_eq!(
            decode(r#"{"msg":"nosub","id":"s1"}"#),
            Envelope::Nosub { id: "s1".into(), error: None }
        );
    }

    #[test]
    fn test_decode_stream_push() {
        let envelope = decode(
            r#"{"msg":"changed","collection":"stream-room-messages","id":"id","fields":{"eventName":"r1","args":[{"msg":"hi"}]}}"#,
        );
        let Envelope::Data(frame) = envelope else {
            panic!("expected data frame");
        };
        assert_eq!(frame.kind, DataKind::Changed);
        assert_eq!(frame.collection.as_deref(), Some("stream-room-messages"));
        assert_eq!(frame.event_name(), Some("r1"));
        assert_eq!(frame.args(), vec![json!({"msg": "hi"})]);
    }

    #[test]
    fn test_decode_fails_soft() {
        for raw in ["not json", "[1,2]", r#"{"foo":1}"#, r#"{"msg":"bogus"}"#, r#"{"msg":"result"}"#] {
            assert!(
                matches!(decode(raw), Envelope::Unparseable { .. }),
                "{} should be unparseable",
                raw
            );
        }
    }
}
