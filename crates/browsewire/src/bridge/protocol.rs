//! Wire protocol types for client-server communication.
//!
//! JSON-RPC 2.0 over newline-delimited frames:
//! - **Outbound**: requests (with id) and notifications (without id)
//! - **Inbound**: responses (id + result or error) and server-initiated messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation id pairing a request to its response.
pub type RequestId = u64;

/// Error payload carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// Fire-and-forget message from client to server (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct OutboundNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutboundNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

/// Messages from client to server.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Request(Request),
    Notification(OutboundNotification),
}

impl Outbound {
    pub fn method(&self) -> &str {
        match self {
            Self::Request(r) => &r.method,
            Self::Notification(n) => &n.method,
        }
    }
}

/// Response to one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, RpcError>,
}

/// Unsolicited server message: no id, or a server-initiated method call.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: Option<String>,
    pub params: Option<Value>,
    pub raw: Value,
}

/// Messages from server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Notification(Notification),
}

#[derive(Deserialize)]
struct RawInbound {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

impl Inbound {
    /// Classify a decoded JSON document.
    ///
    /// Anything with a `method` is server-initiated and goes to the notification
    /// queue even if it carries an id, so it can never be mistaken for the reply
    /// to one of our requests.
    pub fn from_value(value: Value) -> Result<Self, String> {
        if !value.is_object() {
            return Err(format!("expected a JSON object, got {}", type_name(&value)));
        }

        let raw: RawInbound =
            serde_json::from_value(value.clone()).map_err(|e| format!("invalid envelope: {e}"))?;

        if raw.method.is_some() || raw.id.is_none() {
            return Ok(Self::Notification(Notification {
                method: raw.method,
                params: raw.params,
                raw: value,
            }));
        }

        let id = raw
            .id
            .as_ref()
            .and_then(Value::as_u64)
            .ok_or_else(|| format!("unsupported response id: {}", raw.id.unwrap_or_default()))?;

        let outcome = match (raw.result, raw.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        };

        Ok(Self::Response(Response { id, outcome }))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_with_jsonrpc_version() {
        let req = Request::new(7, "tools/call", Some(json!({"name": "browser_snapshot"})));
        insta::assert_json_snapshot!(req, @r#"
        {
          "jsonrpc": "2.0",
          "id": 7,
          "method": "tools/call",
          "params": {
            "name": "browser_snapshot"
          }
        }
        "#);
    }

    #[test]
    fn notification_omits_id_and_empty_params() {
        let out = Outbound::Notification(OutboundNotification::new(
            "notifications/initialized",
            None,
        ));
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
        );
        assert_eq!(out.method(), "notifications/initialized");
    }

    #[test]
    fn classifies_success_response() {
        let inbound =
            Inbound::from_value(json!({"jsonrpc": "2.0", "id": 3, "result": {"ok": true}}))
                .unwrap();
        assert_eq!(
            inbound,
            Inbound::Response(Response {
                id: 3,
                outcome: Ok(json!({"ok": true})),
            })
        );
    }

    #[test]
    fn classifies_error_response() {
        let inbound = Inbound::from_value(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32602, "message": "Invalid params"}
        }))
        .unwrap();
        match inbound {
            Inbound::Response(Response { id, outcome }) => {
                assert_eq!(id, 4);
                let err = outcome.unwrap_err();
                assert_eq!(err.code, -32602);
                assert_eq!(err.message, "Invalid params");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn error_without_message_still_reaches_its_id() {
        let inbound = Inbound::from_value(json!({"jsonrpc": "2.0", "id": 5, "error": {"code": -32000}})).unwrap();
        assert_eq!(
            inbound,
            Inbound::Response(Response {
                id: 5,
                outcome: Err(RpcError {
                    code: -32000,
                    message: String::new(),
                    data: None,
                }),
            })
        );
    }

    #[test]
    fn frame_without_id_is_notification() {
        let inbound = Inbound::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {"level": "info"}
        }))
        .unwrap();
        match inbound {
            Inbound::Notification(n) => {
                assert_eq!(n.method.as_deref(), Some("notifications/message"));
                assert_eq!(n.params, Some(json!({"level": "info"})));
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn server_request_with_id_is_not_a_response() {
        let inbound =
            Inbound::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "roots/list"}))
                .unwrap();
        assert!(matches!(inbound, Inbound::Notification(_)));
    }

    #[test]
    fn null_id_is_notification() {
        let inbound = Inbound::from_value(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "Parse error"}
        }))
        .unwrap();
        assert!(matches!(inbound, Inbound::Notification(_)));
    }

    #[test]
    fn rejects_non_objects_and_string_ids() {
        assert!(Inbound::from_value(json!([1, 2, 3])).is_err());
        assert!(Inbound::from_value(json!({"id": "abc", "result": 1})).is_err());
    }
}
