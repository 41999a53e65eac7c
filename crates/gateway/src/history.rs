// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thread listing and history: `listConversations`/`getConversation`
//! passthroughs with shape normalization.

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::GateError;
use crate::rpc::CallError;
use crate::session::{conversation_items, item_conversation_id, Session};

/// Preview strings are clipped to this many characters.
const PREVIEW_LEN: usize = 80;

#[derive(Debug, Serialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub preview: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ThreadList {
    pub threads: Vec<ThreadSummary>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ThreadHistory {
    pub thread_id: String,
    pub preview: Option<String>,
    pub turns: Vec<Value>,
    pub created_at: Option<String>,
}

/// `listConversations` passthrough.
pub async fn list_threads(
    session: &Session,
    limit: Option<u64>,
    cursor: Option<&str>,
) -> Result<ThreadList, GateError> {
    let mut params = json!({});
    if let Some(limit) = limit {
        params["limit"] = json!(limit);
    }
    if let Some(cursor) = cursor {
        params["cursor"] = json!(cursor);
    }

    let result = session.call("listConversations", Some(params)).await?;

    let threads = conversation_items(&result)
        .iter()
        .filter_map(|item| {
            let thread_id = item_conversation_id(item)?.to_owned();
            Some(ThreadSummary {
                thread_id,
                preview: string_field(item, &["preview"]).map(|p| truncate(&p, PREVIEW_LEN)),
                created_at: string_field(item, &["createdAt", "created_at", "timestamp"]),
                updated_at: string_field(item, &["updatedAt", "updated_at", "timestamp"]),
            })
        })
        .collect();

    let next_cursor = string_field(&result, &["nextCursor", "next_cursor"]);
    Ok(ThreadList { threads, next_cursor })
}

/// `getConversation` passthrough. An upstream JSON-RPC error means the
/// conversation does not exist for this user; a transport failure is a 502.
pub async fn get_thread(session: &Session, thread_id: &str) -> Result<ThreadHistory, GateError> {
    let params = json!({"conversationId": thread_id});
    let result = match session.call_raw("getConversation", Some(params)).await {
        Ok(result) => result,
        Err(CallError::Rpc(_)) => return Err(GateError::thread_not_found(thread_id)),
        Err(err) => return Err(GateError::upstream(format!("getConversation: {err}"))),
    };

    let turns = result
        .get("turns")
        .or_else(|| result.get("entries"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let preview = derive_preview(&turns)
        .or_else(|| string_field(&result, &["preview"]))
        .map(|p| truncate(&p, PREVIEW_LEN));

    Ok(ThreadHistory {
        thread_id: thread_id.to_owned(),
        preview,
        turns,
        created_at: string_field(&result, &["createdAt", "created_at", "timestamp"]),
    })
}

/// Preview: the first agent message in the oldest turn.
fn derive_preview(turns: &[Value]) -> Option<String> {
    let oldest = turns.first()?;
    let items = oldest.get("items").and_then(Value::as_array)?;
    items.iter().find_map(|item| {
        let kind = item.get("type").or_else(|| item.get("itemType"))?.as_str()?;
        if kind != "agentMessage" {
            return None;
        }
        item.get("text").and_then(Value::as_str).map(ToOwned::to_owned)
    })
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| value.get(key).and_then(Value::as_str)).map(ToOwned::to_owned)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_owned();
    }
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;
