use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcResponse {
    Result(RpcResult),
    Error(RpcErrorResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResult {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub error: RpcError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const ERROR_PARSE: i64 = -32700;
pub const ERROR_INVALID_REQUEST: i64 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
pub const ERROR_INTERNAL: i64 = -32603;
/// The engine abandoned the request after a `$/cancelRequest`.
pub const ERROR_REQUEST_CANCELLED: i64 = -32800;

/// Matches a response `id` value against the numeric id the client issued.
/// Engines are allowed to echo ids back as strings.
pub fn matches_id(value: &Value, expected: u64) -> bool {
    match value {
        Value::Number(num) => num.as_u64() == Some(expected),
        Value::String(text) => text.parse::<u64>().ok() == Some(expected),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_has_no_id() {
        let note = RpcRequest::notification("exit", None);
        assert!(note.is_notification());
        let encoded = serde_json::to_value(&note).unwrap();
        assert_eq!(encoded, json!({"jsonrpc": "2.0", "method": "exit"}));
    }

    #[test]
    fn request_round_trip() {
        let request = RpcRequest::request(7, "shutdown", None);
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: RpcRequest = serde_json::from_str(&encoded).unwrap();
        assert!(!decoded.is_notification());
        assert!(matches_id(decoded.id.as_ref().unwrap(), 7));
    }

    #[test]
    fn response_union_distinguishes_errors() {
        let ok: RpcResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": {"success": true}}))
                .unwrap();
        assert!(matches!(ok, RpcResponse::Result(_)));

        let err: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32603, "message": "boom"}
        }))
        .unwrap();
        match err {
            RpcResponse::Error(response) => assert_eq!(response.error.code, ERROR_INTERNAL),
            RpcResponse::Result(_) => panic!("expected error response"),
        }
    }

    #[test]
    fn string_ids_match() {
        assert!(matches_id(&json!("42"), 42));
        assert!(!matches_id(&json!("41"), 42));
        assert!(!matches_id(&json!(null), 42));
    }
}
