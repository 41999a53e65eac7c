// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn note(method: &str, params: Value) -> Notification {
    Notification { method: method.to_owned(), params }
}

#[test]
fn agent_message_text_matches_completed_items_only() {
    let completed = note(
        "item/completed",
        json!({"conversationId": "c1", "item": {"type": "agentMessage", "text": "4"}}),
    );
    assert_eq!(agent_message_text(&completed), Some("4"));

    // Alternate key spelling used by some revisions.
    let completed = note(
        "item.completed",
        json!({"conversationId": "c1", "item": {"itemType": "agentMessage", "text": "four"}}),
    );
    assert_eq!(agent_message_text(&completed), Some("four"));

    let user_item = note(
        "item/completed",
        json!({"conversationId": "c1", "item": {"type": "userMessage", "text": "2+2?"}}),
    );
    assert_eq!(agent_message_text(&user_item), None);

    let delta = note("item/agentMessage/delta", json!({"conversationId": "c1", "delta": "4"}));
    assert_eq!(agent_message_text(&delta), None);
}

#[test]
fn delta_text_matches_both_punctuations() {
    let slash = note("item/agentMessage/delta", json!({"delta": "a"}));
    assert_eq!(delta_text(&slash), Some("a"));

    let dotted = note("item.agentMessage.delta", json!({"delta": "b"}));
    assert_eq!(delta_text(&dotted), Some("b"));

    let other = note("item/started", json!({"delta": "c"}));
    assert_eq!(delta_text(&other), None);
}

#[test]
fn chat_request_defaults() {
    let req: ChatRequest =
        match serde_json::from_value(json!({"messages": [{"content": "hello"}]})) {
            Ok(r) => r,
            Err(e) => panic!("deserialize failed: {e}"),
        };
    assert!(req.stream, "stream defaults to true");
    assert!(req.thread_id.is_none());
    assert!(req.user_id.is_none());
    assert_eq!(req.messages.len(), 1);
    assert_eq!(req.messages[0].content, "hello");
}

#[test]
fn chat_request_uses_only_declared_fields() {
    let req: ChatRequest = match serde_json::from_value(json!({
        "messages": [
            {"role": "user", "content": "first"},
            {"role": "user", "content": "last"},
        ],
        "thread_id": "t1",
        "stream": false,
        "user_id": "alice",
    })) {
        Ok(r) => r,
        Err(e) => panic!("deserialize failed: {e}"),
    };
    assert!(!req.stream);
    assert_eq!(req.thread_id.as_deref(), Some("t1"));
    assert_eq!(req.user_id.as_deref(), Some("alice"));
    assert_eq!(req.messages.last().map(|m| m.content.as_str()), Some("last"));
}
