//! JSON-RPC 2.0 wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: RpcId,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Unwrap the result value or return the error object.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// `params` of a subscription notification.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionParams {
    pub subscription: Value,
    #[serde(default)]
    pub result: Value,
}

/// A server-pushed subscription notification (no `id`).
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionNotification {
    pub method: String,
    pub params: SubscriptionParams,
}

/// Anything the node may send over the socket.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response(JsonRpcResponse),
    Notification(SubscriptionNotification),
}

impl Incoming {
    /// Classify a text frame. Returns `None` for anything that is neither a
    /// response nor a subscription notification.
    pub fn parse(text: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(text).ok()?;
        if val.get("method").is_some() && val.get("id").is_none() {
            return serde_json::from_value(val).ok().map(Self::Notification);
        }
        serde_json::from_value(val).ok().map(Self::Response)
    }
}

/// Normalised subscription id. Nodes return either a string or a number.
pub fn subscription_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(7, "chain_getBlockHash", vec![Value::from(12u64)]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"chain_getBlockHash\""));
        assert!(json.contains("\"params\":[12]"));
        assert!(json.contains("\"id\":7"));
    }

    #[test]
    fn parse_response_and_error() {
        let ok = r#"{"jsonrpc":"2.0","id":1,"result":"0xabc"}"#;
        match Incoming::parse(ok) {
            Some(Incoming::Response(resp)) => {
                assert_eq!(resp.id, RpcId::Number(1));
                assert_eq!(resp.into_result().unwrap(), Value::from("0xabc"));
            }
            other => panic!("expected response, got {other:?}"),
        }

        let err = r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#;
        match Incoming::parse(err) {
            Some(Incoming::Response(resp)) => {
                let e = resp.into_result().unwrap_err();
                assert_eq!(e.code, -32601);
                assert_eq!(e.to_string(), "JSON-RPC error -32601: Method not found");
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn parse_notification() {
        let text = r#"{"jsonrpc":"2.0","method":"state_storage","params":{"subscription":"abc","result":{"block":"0x01","changes":[]}}}"#;
        match Incoming::parse(text) {
            Some(Incoming::Notification(n)) => {
                assert_eq!(n.method, "state_storage");
                assert_eq!(subscription_key(&n.params.subscription).as_deref(), Some("abc"));
                assert_eq!(n.params.result["block"], "0x01");
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn numeric_subscription_ids() {
        assert_eq!(subscription_key(&Value::from(42u64)).as_deref(), Some("42"));
        assert_eq!(subscription_key(&Value::Null), None);
    }

    #[test]
    fn garbage_is_ignored() {
        assert!(Incoming::parse("not json").is_none());
        assert!(Incoming::parse(r#"{"hello":"world"}"#).is_none());
    }
}
