//! Line-delimited JSON-RPC codec.
//!
//! One JSON document per line, newline-terminated. Encoding never emits raw
//! newlines inside a message because serde_json escapes them in strings.

use serde_json::{Map, Value};

use super::errors::McpError;
use super::types::{
    InboundMessage, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ServerRequest,
};

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Serialize a request or notification into a single newline-terminated line.
pub fn encode_request(server: &str, request: &JsonRpcRequest) -> Result<String, McpError> {
    let mut line = serde_json::to_string(request).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to serialize '{}': {e}", request.method),
    })?;
    line.push('\n');
    Ok(line)
}

/// Serialize a reply to a server-initiated request.
pub fn encode_reply(id: &Value, outcome: Result<Value, JsonRpcError>) -> String {
    let msg = match outcome {
        Ok(result) => serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => serde_json::json!({"jsonrpc": "2.0", "id": id, "error": error}),
    };
    let mut line = msg.to_string();
    line.push('\n');
    line
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Parse one line read from a server.
///
/// Blank lines yield `Ok(None)`. Anything that is not a well-formed
/// JSON-RPC 2.0 response, notification or request is a framing error.
pub fn decode_line(server: &str, line: &str) -> Result<Option<InboundMessage>, McpError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let framing = |reason: String| McpError::Framing {
        server: server.to_string(),
        reason,
    };

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| framing(format!("invalid JSON: {e}")))?;
    let Value::Object(mut obj) = value else {
        return Err(framing("message is not a JSON object".into()));
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some("2.0") => {}
        other => {
            return Err(framing(format!(
                "missing or unsupported jsonrpc version: {other:?}"
            )))
        }
    }

    let message = match (obj.remove("method"), obj.remove("id")) {
        (Some(Value::String(method)), None) => InboundMessage::Notification {
            method,
            params: obj.remove("params"),
        },
        (Some(Value::String(method)), Some(id)) => InboundMessage::Request(ServerRequest {
            id,
            method,
            params: obj.remove("params"),
        }),
        (Some(other), _) => {
            return Err(framing(format!("method must be a string, got {other}")));
        }
        (None, Some(Value::Null)) => InboundMessage::Unaddressed(decode_unaddressed(&framing, obj)?),
        (None, Some(id)) => InboundMessage::Response(decode_response(&framing, id, obj)?),
        (None, None) => return Err(framing("message has neither id nor method".into())),
    };

    Ok(Some(message))
}

/// An error response with `"id": null`, sent when the server could not read
/// the id of the request it is rejecting.
fn decode_unaddressed(
    framing: &impl Fn(String) -> McpError,
    mut obj: Map<String, Value>,
) -> Result<JsonRpcError, McpError> {
    let raw = obj
        .remove("error")
        .ok_or_else(|| framing("response with null id carries no error".into()))?;
    serde_json::from_value::<JsonRpcError>(raw)
        .map_err(|e| framing(format!("malformed error object in null-id response: {e}")))
}

fn decode_response(
    framing: &impl Fn(String) -> McpError,
    id: Value,
    mut obj: Map<String, Value>,
) -> Result<JsonRpcResponse, McpError> {
    let id = id
        .as_u64()
        .ok_or_else(|| framing(format!("response id {id} is not a non-negative integer")))?;

    let error = match obj.remove("error") {
        Some(raw) => Some(
            serde_json::from_value::<JsonRpcError>(raw)
                .map_err(|e| framing(format!("malformed error object in response {id}: {e}")))?,
        ),
        None => None,
    };
    let result = obj.remove("result");

    if result.is_none() && error.is_none() {
        return Err(framing(format!(
            "response {id} has neither result nor error"
        )));
    }

    Ok(JsonRpcResponse { id, result, error })
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(
    server: &str,
    method: &str,
    response: JsonRpcResponse,
) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            server: server.to_string(),
            method: method.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    Ok(response.result.unwrap_or(Value::Null))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
