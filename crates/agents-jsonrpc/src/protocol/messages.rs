//! JSON-RPC 2.0 Message Types
//!
//! Every transport speaks JSON-RPC 2.0. This module implements the request,
//! notification and response shapes, the classification of raw wire objects
//! into those shapes, and the expansion of batches into their members.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::error::RpcError;

/// JSON-RPC protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 Request
///
/// A request is a call to a specific method with optional parameters.
/// Each request has a unique ID that will be echoed in the response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always "2.0"
    pub jsonrpc: String,

    /// Unique request identifier
    pub id: RequestId,

    /// Method name to invoke
    pub method: String,

    /// Optional parameters for the method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    /// Add parameters to the request
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// JSON-RPC 2.0 Notification
///
/// A notification is like a request but has no ID and expects no response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcNotification {
    /// Protocol version, always "2.0"
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Optional parameters for the method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: None,
        }
    }

    /// Add parameters to the notification
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// JSON-RPC 2.0 Response
///
/// Exactly one of `result` and `error` is set. A successful response whose
/// result is JSON `null` carries `Some(Value::Null)`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    /// Protocol version, always "2.0"
    pub jsonrpc: String,

    /// Request ID this is responding to; `None` when the server sent `"id": null`
    pub id: Option<RequestId>,

    /// Successful result (mutually exclusive with error)
    pub result: Option<Value>,

    /// Error result (mutually exclusive with result)
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a successful response
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response
    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Check if this response is an error
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Get the result, returning an error if the response is an error
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(error) = self.error {
            Err(error)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

impl Serialize for JsonRpcResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", &self.jsonrpc)?;
        map.serialize_entry("id", &self.id)?;
        match &self.error {
            Some(error) => map.serialize_entry("error", error)?,
            None => map.serialize_entry("result", self.result.as_ref().unwrap_or(&Value::Null))?,
        }
        map.end()
    }
}

/// JSON-RPC 2.0 Error Object
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JsonRpcError {
    /// Error code (negative for protocol errors, positive for application errors)
    pub code: i64,

    /// Human-readable error message
    pub message: String,

    /// Optional additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error object without data
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " ({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for JsonRpcError {}

/// Standard JSON-RPC 2.0 error codes
pub mod error_codes {
    /// Parse error - Invalid JSON was received
    pub const PARSE_ERROR: i64 = -32700;

    /// Invalid Request - The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i64 = -32600;

    /// Method not found
    pub const METHOD_NOT_FOUND: i64 = -32601;

    /// Invalid params
    pub const INVALID_PARAMS: i64 = -32602;

    /// Internal error
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Request ID - can be a string or number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String ID
    String(String),
    /// Numeric ID
    Number(u64),
}

impl RequestId {
    /// A random UUIDv4 string id, for callers that do not keep a counter
    pub fn random() -> Self {
        RequestId::String(uuid::Uuid::new_v4().to_string())
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{}", s),
            RequestId::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Any single JSON-RPC message seen on the wire.
///
/// Batches never appear here: an array payload is expanded into its members
/// by [`parse_payload`] before anything else looks at it.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Has `id` and `method`
    Request(JsonRpcRequest),
    /// Has `method` and no `id`
    Notification(JsonRpcNotification),
    /// Has `id` and exactly one of `result` / `error`
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    /// Shorthand for building a request message
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        let mut request = JsonRpcRequest::new(id, method);
        request.params = params;
        JsonRpcMessage::Request(request)
    }

    /// Shorthand for building a notification message
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        let mut notification = JsonRpcNotification::new(method);
        notification.params = params;
        JsonRpcMessage::Notification(notification)
    }

    /// The correlation id, if any
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Notification(_) => None,
            JsonRpcMessage::Response(r) => r.id.as_ref(),
        }
    }

    /// The method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Notification(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, JsonRpcMessage::Response(_))
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcMessage::Request(r) => r.serialize(serializer),
            JsonRpcMessage::Notification(n) => n.serialize(serializer),
            JsonRpcMessage::Response(r) => r.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawMessage::deserialize(deserializer)?;
        raw.classify().map_err(de::Error::custom)
    }
}

/// Flat view of a wire object before classification.
#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, deserialize_with = "present")]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// Distinguishes a field that is present with value `null` from one that is absent.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl RawMessage {
    fn classify(self) -> Result<JsonRpcMessage, String> {
        let jsonrpc = self.jsonrpc.unwrap_or_else(|| JSONRPC_VERSION.to_string());
        let id = match self.id {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<RequestId>(value)
                    .map_err(|_| "id must be a string or non-negative integer".to_string())?,
            ),
        };

        match (self.method, id) {
            (Some(method), Some(id)) => Ok(JsonRpcMessage::Request(JsonRpcRequest {
                jsonrpc,
                id,
                method,
                params: self.params,
            })),
            (Some(method), None) => Ok(JsonRpcMessage::Notification(JsonRpcNotification {
                jsonrpc,
                method,
                params: self.params,
            })),
            (None, id) => match (self.result, self.error) {
                (Some(result), None) => Ok(JsonRpcMessage::Response(JsonRpcResponse {
                    jsonrpc,
                    id,
                    result: Some(result),
                    error: None,
                })),
                (None, Some(error)) => Ok(JsonRpcMessage::Response(JsonRpcResponse {
                    jsonrpc,
                    id,
                    result: None,
                    error: Some(error),
                })),
                (Some(_), Some(_)) => Err("response carries both result and error".to_string()),
                (None, None) => {
                    Err("message has neither method nor result/error".to_string())
                }
            },
        }
    }
}

/// Classify an already-decoded JSON value, expanding batches.
///
/// Each element of a batch is classified independently so that a single bad
/// element does not take its siblings down with it.
pub fn parse_value(value: Value) -> Vec<Result<JsonRpcMessage, RpcError>> {
    match value {
        Value::Array(items) if items.is_empty() => {
            vec![Err(RpcError::protocol("empty batch"))]
        }
        Value::Array(items) => items.into_iter().map(parse_single).collect(),
        other => vec![parse_single(other)],
    }
}

/// Decode a wire payload (object or batch array) into messages.
pub fn parse_payload(bytes: &[u8]) -> Vec<Result<JsonRpcMessage, RpcError>> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => parse_value(value),
        Err(e) => vec![Err(RpcError::protocol(format!("invalid JSON: {}", e)))],
    }
}

fn parse_single(value: Value) -> Result<JsonRpcMessage, RpcError> {
    if !value.is_object() {
        return Err(RpcError::protocol(format!(
            "expected a JSON-RPC object, got {}",
            value
        )));
    }
    serde_json::from_value(value)
        .map_err(|e| RpcError::protocol(format!("invalid JSON-RPC message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::new(1u64, "tools/list");
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_notification_serialization() {
        let notif = JsonRpcMessage::notification("notifications/initialized", None);
        let json = serde_json::to_string(&notif).unwrap();
        assert!(json.contains("\"method\":\"notifications/initialized\""));
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_classifies_request_notification_response() {
        let req: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#).unwrap();
        assert!(req.is_request());
        assert_eq!(req.id(), Some(&RequestId::Number(7)));

        let notif: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"progress","params":{}}"#).unwrap();
        assert!(notif.is_notification());
        assert_eq!(notif.method(), Some("progress"));

        let resp: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","result":{"ok":true}}"#).unwrap();
        assert!(resp.is_response());
        assert_eq!(resp.id(), Some(&RequestId::String("abc".into())));
    }

    #[test]
    fn test_null_result_is_a_response() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        match msg {
            JsonRpcMessage::Response(r) => {
                assert_eq!(r.result, Some(Value::Null));
                assert_eq!(r.into_result().unwrap(), Value::Null);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_error_response() {
        let json =
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#;
        let msg: JsonRpcMessage = serde_json::from_str(json).unwrap();
        let JsonRpcMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert!(resp.is_error());
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_rejects_result_and_error_together() {
        let json = r#"{"id":1,"result":1,"error":{"code":1,"message":"x"}}"#;
        assert!(serde_json::from_str::<JsonRpcMessage>(json).is_err());
    }

    #[test]
    fn test_rejects_message_without_method_or_outcome() {
        assert!(serde_json::from_str::<JsonRpcMessage>(r#"{"id":1}"#).is_err());
    }

    #[test]
    fn test_null_id_error_response_is_uncorrelated() {
        let json = r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#;
        let msg: JsonRpcMessage = serde_json::from_str(json).unwrap();
        assert!(msg.is_response());
        assert!(msg.id().is_none());
    }

    #[test]
    fn test_response_serializes_null_result() {
        let resp = JsonRpcMessage::Response(JsonRpcResponse::success(3u64, Value::Null));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 3, "result": null}));
    }

    #[test]
    fn test_parse_payload_expands_batch_in_order() {
        let payload = br#"[{"jsonrpc":"2.0","id":1,"result":"a"},{"jsonrpc":"2.0","id":2,"result":"b"}]"#;
        let messages: Vec<_> = parse_payload(payload)
            .into_iter()
            .map(|m| m.unwrap())
            .collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id(), Some(&RequestId::Number(1)));
        assert_eq!(messages[1].id(), Some(&RequestId::Number(2)));
    }

    #[test]
    fn test_parse_payload_isolates_bad_batch_element() {
        let payload = br#"[{"jsonrpc":"2.0","method":"a"}, 42, {"jsonrpc":"2.0","method":"b"}]"#;
        let results = parse_payload(payload);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_protocol());
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_parse_payload_rejects_empty_batch_and_garbage() {
        assert!(parse_payload(b"[]")[0].is_err());
        assert!(parse_payload(b"{not json")[0].is_err());
        assert!(parse_payload(b"\"just a string\"")[0].is_err());
    }

    #[test]
    fn test_random_ids_are_distinct_strings() {
        let a = RequestId::random();
        let b = RequestId::random();
        assert!(matches!(a, RequestId::String(_)));
        assert_ne!(a, b);
    }
}
