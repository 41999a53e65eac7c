// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types for the newline-delimited JSON-RPC 2.0 child protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error code for "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// An outgoing request frame. Serialized as one line followed by `\n`.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION, id, method: method.into(), params }
    }
}

/// A JSON-RPC error object from a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A server-originated notification: a message with `method` and no `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Notification {
    /// The `params.conversationId` this notification belongs to, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        self.params.get("conversationId").and_then(Value::as_str)
    }

    /// Whether this notification terminates a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(method_slug(&self.method).as_str(), "turn.completed" | "turn.failed")
    }

    /// Human-readable failure reason for a `turn.failed` notification.
    pub fn failure_reason(&self) -> Option<String> {
        if method_slug(&self.method) != "turn.failed" {
            return None;
        }
        let reason = self
            .params
            .pointer("/error/message")
            .or_else(|| self.params.pointer("/turn/error/message"))
            .and_then(Value::as_str)
            .unwrap_or("turn failed");
        Some(reason.to_owned())
    }
}

/// A parsed incoming line.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// A reply to one of our requests.
    Response { id: i64, result: Result<Value, RpcErrorObject> },
    /// A server-initiated event.
    Notification(Notification),
}

/// Parse one stdout line. Returns `None` for unparsable or unclassifiable
/// lines; the reader logs and continues.
pub fn parse_line(line: &str) -> Option<Incoming> {
    let value: Value = serde_json::from_str(line).ok()?;

    if let Some(id) = value.get("id").and_then(Value::as_i64) {
        if let Some(error) = value.get("error") {
            let err: RpcErrorObject = serde_json::from_value(error.clone()).ok()?;
            return Some(Incoming::Response { id, result: Err(err) });
        }
        if let Some(result) = value.get("result") {
            return Some(Incoming::Response { id, result: Ok(result.clone()) });
        }
        // A request from the server (has id + method). Not part of the
        // consumed contract; callers drop it.
        return None;
    }

    let method = value.get("method").and_then(Value::as_str)?;
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    Some(Incoming::Notification(Notification { method: method.to_owned(), params }))
}

/// Normalize a notification method name so that `turn/completed` and
/// `turn.completed` compare equal. The upstream schema has used both
/// punctuations across versions.
pub fn method_slug(method: &str) -> String {
    method.replace('/', ".")
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
