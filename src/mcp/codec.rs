//! Wire codec for JSON-RPC messages.
//!
//! Maps [`Message`] to and from the `{"jsonrpc": "2.0", ...}` object shape.
//! Classification is by field presence: `method` + `id` is a request,
//! `method` alone a notification, `result` a response, `error` an error.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::mcp::protocol::{
    JsonRpcError, JsonRpcErrorResponse, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    Message, RequestId, JSONRPC_VERSION,
};

/// Encode a message into its wire object.
///
/// Fails with invalid-params if a request or notification carries params
/// that are not an object or array; such a message would not decode.
pub fn encode(message: &Message) -> Result<Value> {
    let mut obj = Map::new();
    obj.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));

    match message {
        Message::Request(req) => {
            obj.insert("id".to_string(), req.id.to_value());
            obj.insert("method".to_string(), Value::String(req.method.clone()));
            encode_params(&mut obj, req.params.as_ref())?;
        }
        Message::Notification(notif) => {
            obj.insert("method".to_string(), Value::String(notif.method.clone()));
            encode_params(&mut obj, notif.params.as_ref())?;
        }
        Message::Response(resp) => {
            obj.insert("id".to_string(), resp.id.to_value());
            obj.insert("result".to_string(), resp.result.clone());
        }
        Message::Error(err) => return Ok(encode_error(err)),
    }

    Ok(Value::Object(obj))
}

/// Encode an error reply. Error replies always have a wire form.
pub fn encode_error(err: &JsonRpcErrorResponse) -> Value {
    let mut error = Map::new();
    error.insert("code".to_string(), Value::from(err.error.code));
    error.insert(
        "message".to_string(),
        Value::String(err.error.message.clone()),
    );
    if let Some(data) = &err.error.data {
        error.insert("data".to_string(), data.clone());
    }

    let mut obj = Map::new();
    obj.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
    obj.insert("id".to_string(), err.id.to_value());
    obj.insert("error".to_string(), Value::Object(error));
    Value::Object(obj)
}

fn encode_params(obj: &mut Map<String, Value>, params: Option<&Value>) -> Result<()> {
    match params {
        None => Ok(()),
        Some(p @ (Value::Object(_) | Value::Array(_))) => {
            obj.insert("params".to_string(), p.clone());
            Ok(())
        }
        Some(_) => Err(Error::InvalidParams(
            "params must be an object or array".to_string(),
        )),
    }
}

/// Decode a wire object into a message.
pub fn decode(value: &Value) -> Result<Message> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::Decode("message must be a JSON object".to_string()))?;

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => {
            return Err(Error::Decode(format!(
                "unsupported jsonrpc version: {}",
                other
            )))
        }
        None => return Err(Error::Decode("missing jsonrpc version".to_string())),
    }

    if let Some(method) = obj.get("method") {
        let method = method
            .as_str()
            .ok_or_else(|| Error::Decode("method must be a string".to_string()))?
            .to_string();
        let params = decode_params(obj)?;
        return match obj.get("id") {
            Some(id) => {
                let id = RequestId::from_value(id)?;
                if id.is_null() {
                    return Err(Error::Decode("request id must not be null".to_string()));
                }
                Ok(Message::Request(JsonRpcRequest { id, method, params }))
            }
            None => Ok(Message::Notification(JsonRpcNotification { method, params })),
        };
    }

    if let Some(result) = obj.get("result") {
        let id = require_id(obj)?;
        return Ok(Message::Response(JsonRpcResponse {
            id,
            result: result.clone(),
        }));
    }

    if let Some(error) = obj.get("error") {
        let id = require_id(obj)?;
        let mut error: JsonRpcError = serde_json::from_value(error.clone())
            .map_err(|e| Error::Decode(format!("malformed error object: {}", e)))?;
        // An explicit `"data": null` is kept, serde folds it into `None`.
        if error.data.is_none() && obj["error"].get("data").is_some() {
            error.data = Some(Value::Null);
        }
        return Ok(Message::Error(JsonRpcErrorResponse { id, error }));
    }

    Err(Error::Decode("unrecognized message shape".to_string()))
}

/// Decode one line of text.
///
/// Text that is not JSON at all is a parse error, distinct from a JSON value
/// that does not form a valid message.
pub fn decode_str(text: &str) -> Result<Message> {
    let value: Value = serde_json::from_str(text).map_err(|e| Error::Parse(e.to_string()))?;
    decode(&value)
}

/// Best-effort id recovery from an undecodable wire object, for the error reply.
pub fn recover_id(value: &Value) -> RequestId {
    value
        .get("id")
        .and_then(|id| RequestId::from_value(id).ok())
        .unwrap_or(RequestId::Null)
}

/// Whether an undecodable wire object should be answered with an error reply.
///
/// Replies and notification-shaped objects are never answered.
pub fn expects_reply(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => {
            !obj.contains_key("result")
                && !obj.contains_key("error")
                && (obj.contains_key("id") || !obj.contains_key("method"))
        }
        None => true,
    }
}

fn require_id(obj: &Map<String, Value>) -> Result<RequestId> {
    let id = obj
        .get("id")
        .ok_or_else(|| Error::Decode("missing id".to_string()))?;
    RequestId::from_value(id)
}

fn decode_params(obj: &Map<String, Value>) -> Result<Option<Value>> {
    match obj.get("params") {
        None | Some(Value::Null) => Ok(None),
        Some(p @ (Value::Object(_) | Value::Array(_))) => Ok(Some(p.clone())),
        Some(_) => Err(Error::Decode(
            "params must be an object or array".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::error_codes;
    use serde_json::json;

    fn assert_round_trip(message: Message) {
        let wire = encode(&message).unwrap();
        assert_eq!(wire["jsonrpc"], "2.0");
        let decoded = decode(&wire).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_round_trip_each_shape() {
        assert_round_trip(Message::Request(JsonRpcRequest::new(
            RequestId::Number(1),
            "tools/list",
            Some(json!({"cursor": "abc"})),
        )));
        assert_round_trip(Message::Request(JsonRpcRequest::new(
            RequestId::String("req-1".to_string()),
            "ping",
            None,
        )));
        assert_round_trip(Message::Notification(JsonRpcNotification::new(
            "notifications/initialized",
            None,
        )));
        assert_round_trip(Message::Response(JsonRpcResponse::new(
            RequestId::Number(i64::MAX),
            json!({}),
        )));
        assert_round_trip(Message::Error(JsonRpcErrorResponse::new(
            RequestId::Null,
            error_codes::PARSE_ERROR,
            "Parse error",
            Some(json!({"line": 3})),
        )));
        assert_round_trip(Message::Request(JsonRpcRequest::new(
            RequestId::Number(2),
            "ping",
            Some(Value::Null),
        )));
        assert_round_trip(Message::Notification(JsonRpcNotification::new(
            "notifications/progress",
            Some(json!([1, 2])),
        )));
        assert_round_trip(Message::Error(JsonRpcErrorResponse::new(
            RequestId::Number(3),
            error_codes::INTERNAL_ERROR,
            "boom",
            Some(Value::Null),
        )));
    }

    #[test]
    fn test_encode_rejects_scalar_params() {
        let request = Message::Request(JsonRpcRequest::new(
            RequestId::Number(1),
            "echo",
            Some(json!(5)),
        ));
        let err = encode(&request).unwrap_err();
        assert_eq!(err.code(), error_codes::INVALID_PARAMS);

        let notification = Message::Notification(JsonRpcNotification {
            method: "x".to_string(),
            params: Some(Value::Null),
        });
        assert!(encode(&notification).is_err());
    }

    #[test]
    fn test_classification() {
        let msg = decode(&json!({"jsonrpc": "2.0", "id": 7, "method": "ping"})).unwrap();
        assert!(matches!(msg, Message::Request(_)));

        let msg = decode(&json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}))
            .unwrap();
        assert!(matches!(msg, Message::Notification(_)));

        let msg = decode(&json!({"jsonrpc": "2.0", "id": 7, "result": {}})).unwrap();
        assert!(matches!(msg, Message::Response(_)));

        let msg = decode(&json!({
            "jsonrpc": "2.0",
            "id": "x",
            "error": {"code": -32601, "message": "Unknown method: foo"}
        }))
        .unwrap();
        match msg {
            Message::Error(e) => {
                assert_eq!(e.id, RequestId::String("x".to_string()));
                assert_eq!(e.error.code, -32601);
                assert!(e.error.data.is_none());
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_envelope() {
        assert!(matches!(decode(&json!([1, 2])), Err(Error::Decode(_))));
        assert!(matches!(
            decode(&json!({"id": 1, "method": "ping"})),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            decode(&json!({"jsonrpc": "1.0", "id": 1, "method": "ping"})),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            decode(&json!({"jsonrpc": "2.0", "id": 1})),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            decode(&json!({"jsonrpc": "2.0", "id": 1, "method": 5})),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            decode(&json!({"jsonrpc": "2.0", "id": 1, "method": "x", "params": "str"})),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            decode(&json!({"jsonrpc": "2.0", "id": 1, "error": {"message": "no code"}})),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_decode_rejects_fractional_id() {
        let err = decode(&json!({"jsonrpc": "2.0", "id": 1.5, "method": "ping"})).unwrap_err();
        assert_eq!(err.code(), error_codes::INVALID_REQUEST);
    }

    #[test]
    fn test_decode_str_parse_error() {
        let err = decode_str("{not json").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert_eq!(err.code(), error_codes::PARSE_ERROR);

        let msg = decode_str(r#"{"jsonrpc":"2.0","id":12345678901234567,"method":"ping"}"#).unwrap();
        assert_eq!(msg.id(), Some(&RequestId::Number(12_345_678_901_234_567)));
    }

    #[test]
    fn test_recover_id() {
        assert_eq!(
            recover_id(&json!({"id": 4, "method": 9})),
            RequestId::Number(4)
        );
        assert_eq!(recover_id(&json!({"id": 0.5})), RequestId::Null);
        assert_eq!(recover_id(&json!("garbage")), RequestId::Null);
    }

    #[test]
    fn test_expects_reply() {
        assert!(expects_reply(&json!({"id": 1, "method": 3})));
        assert!(expects_reply(&json!({"foo": 1})));
        assert!(expects_reply(&json!([])));
        assert!(!expects_reply(&json!({"method": "x"})));
        assert!(!expects_reply(&json!({"id": 1, "result": {}})));
    }
}
