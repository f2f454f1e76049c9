//! JSON-RPC 2.0 envelope types.
//!
//! Mirrors the teacher's `serde_json::Value`-backed envelope with narrow typed
//! accessors layered on top, rather than a fully-typed enum: `params`/`result`/
//! `error.data` stay `serde_json::Value` since schema validation is out of scope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A JSON-RPC request/response id. Client ids may be numbers or strings;
/// proxy-synthesized ids are always the tagged string form (see [`crate::session`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Str(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A parsed JSON-RPC 2.0 envelope, kept as `Value` to avoid asserting a schema
/// the wire format does not guarantee.
#[derive(Debug, Clone)]
pub struct Message(pub Value);

impl Message {
    pub fn from_value(value: Value) -> Self {
        Message(value)
    }

    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    pub fn params(&self) -> Option<&Value> {
        self.0.get("params")
    }

    pub fn id(&self) -> Option<RequestId> {
        match self.0.get("id") {
            Some(Value::Number(n)) => n.as_i64().map(RequestId::Number),
            Some(Value::String(s)) => Some(RequestId::Str(s.clone())),
            _ => None,
        }
    }

    /// True when the message has a `method` but no `id` — a notification.
    pub fn is_notification(&self) -> bool {
        self.0.get("method").is_some() && self.0.get("id").is_none()
    }

    /// True when the message carries a `result` or `error` (i.e. is a response).
    pub fn is_response(&self) -> bool {
        self.0.get("result").is_some() || self.0.get("error").is_some()
    }

    pub fn is_request_for(&self, id: &RequestId) -> bool {
        self.is_response() && self.id().as_ref() == Some(id)
    }

    pub fn is_initialize(&self) -> bool {
        self.method() == Some("initialize")
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message(value)
    }
}

/// Build the proxy-synthesized `initialize` request used to replay session state
/// into a freshly spawned child.
pub fn build_initialize_request(id: &RequestId, params: Value) -> Message {
    Message(serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": params,
    }))
}

/// Build the proxy-synthesized `tools/list` request used after a restart.
pub fn build_tools_list_request(id: &RequestId) -> Message {
    Message(serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/list",
    }))
}

/// Build the `notifications/tools/list_changed` notification broadcast to the client
/// after every successful restart.
pub fn build_tools_list_changed(tools: Value) -> Message {
    Message(serde_json::json!({
        "jsonrpc": "2.0",
        "method": "notifications/tools/list_changed",
        "params": { "tools": tools },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_id_round_trips() {
        let msg = Message::from_value(serde_json::json!({
            "jsonrpc": "2.0", "id": 7, "method": "ping"
        }));
        assert_eq!(msg.id(), Some(RequestId::Number(7)));
        assert!(!msg.is_notification());
        assert!(!msg.is_response());
    }

    #[test]
    fn string_id_round_trips() {
        let msg = Message::from_value(serde_json::json!({
            "jsonrpc": "2.0", "id": "relay:1", "result": {}
        }));
        assert_eq!(msg.id(), Some(RequestId::Str("relay:1".into())));
        assert!(msg.is_response());
        assert!(msg.is_request_for(&RequestId::Str("relay:1".into())));
    }

    #[test]
    fn notification_has_no_id() {
        let msg = Message::from_value(serde_json::json!({
            "jsonrpc": "2.0", "method": "notifications/initialized"
        }));
        assert!(msg.is_notification());
        assert_eq!(msg.id(), None);
    }

    #[test]
    fn initialize_detected() {
        let msg = Message::from_value(serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}
        }));
        assert!(msg.is_initialize());
    }

    #[test]
    fn tools_list_changed_shape() {
        let msg = build_tools_list_changed(serde_json::json!([]));
        assert_eq!(
            msg.method(),
            Some("notifications/tools/list_changed")
        );
        assert_eq!(msg.id(), None);
    }
}
