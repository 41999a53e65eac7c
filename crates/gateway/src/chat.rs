// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Chat orchestrator: translates one HTTP chat request into a turn against
//! the user's agent session and renders the result as an SSE stream or an
//! aggregated JSON envelope.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::{ErrorKind, GateError};
use crate::rpc::message::method_slug;
use crate::rpc::Notification;
use crate::session::{SessionLease, TurnHandle};
use crate::state::AppState;

/// `POST /chat` request body. Only the last message's content is used.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
}

fn default_stream() -> bool {
    true
}

/// Non-streaming response envelope.
#[derive(Debug, Serialize)]
pub struct ChatEnvelope {
    pub thread_id: String,
    pub message: String,
    pub events: Vec<Value>,
}

/// Run one chat turn for an already-resolved user.
pub async fn handle_chat(
    state: &Arc<AppState>,
    user_id: &str,
    req: ChatRequest,
) -> Result<Response, GateError> {
    let text = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
    if text.trim().is_empty() {
        return Err(GateError::validation("Empty message"));
    }

    let lease = state.manager.acquire(user_id).await?;
    let turn = match lease
        .session()
        .send_turn(req.thread_id.clone(), &text, req.model.as_deref())
        .await
    {
        Ok(turn) => turn,
        Err(err) => {
            if err.kind == ErrorKind::Upstream {
                lease.discard_dead().await;
            }
            return Err(err);
        }
    };

    debug!(user_id, thread_id = %turn.thread_id(), stream = req.stream, "turn started");
    let timeout = state.config.turn_timeout();
    if req.stream {
        Ok(stream_turn(lease, turn, timeout))
    } else {
        let envelope = aggregate_turn(lease, turn, timeout).await?;
        Ok(Json(envelope).into_response())
    }
}

/// Streaming path. Frames are `data: <json>\n\n`; the first frame announces
/// the conversation id, the sentinel `[DONE]` ends the stream.
///
/// The spawned task owns the lease and the turn handle: when the client
/// disconnects the receiver drops, the next send fails, and dropping the
/// handle unsubscribes and releases the turn lock. The upstream turn runs to
/// completion with its tail discarded.
fn stream_turn(lease: SessionLease, mut turn: TurnHandle, timeout: Duration) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(32);

    tokio::spawn(async move {
        let session = Arc::clone(lease.session());
        let deadline = tokio::time::Instant::now() + timeout;

        let opening = json!({"type": "session", "thread_id": turn.thread_id()});
        if send_frame(&tx, opening.to_string()).await.is_err() {
            return;
        }

        loop {
            match tokio::time::timeout_at(deadline, turn.next_event()).await {
                Ok(Some(note)) => {
                    let terminal = note.is_terminal();
                    let payload = match serde_json::to_string(&note) {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                    if send_frame(&tx, payload).await.is_err() {
                        debug!(thread_id = %turn.thread_id(), "client disconnected mid-stream");
                        return;
                    }
                    if terminal {
                        break;
                    }
                }
                Ok(None) => {
                    let frame =
                        json!({"type": "error", "detail": "Agent stream ended unexpectedly"});
                    let _ = send_frame(&tx, frame.to_string()).await;
                    lease.discard_dead().await;
                    break;
                }
                Err(_) => {
                    // A slow turn is not a sick session: flag a probe
                    // instead of killing the child.
                    warn!(thread_id = %turn.thread_id(), "turn timed out mid-stream");
                    session.flag_probe();
                    let frame = json!({
                        "type": "error",
                        "detail": format!("Turn timed out after {}s", timeout.as_secs()),
                    });
                    let _ = send_frame(&tx, frame.to_string()).await;
                    break;
                }
            }
        }

        let _ = send_frame(&tx, "[DONE]".to_owned()).await;
    });

    Sse::new(ReceiverStream::new(rx)).into_response()
}

async fn send_frame(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    payload: String,
) -> Result<(), ()> {
    tx.send(Ok(Event::default().data(payload))).await.map_err(|_| ())
}

/// Non-streaming path: drain the handle, derive `message`, return the
/// envelope. Shares the subscription machinery with the streaming path.
async fn aggregate_turn(
    lease: SessionLease,
    mut turn: TurnHandle,
    timeout: Duration,
) -> Result<ChatEnvelope, GateError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut events: Vec<Value> = Vec::new();
    let mut completions = String::new();
    let mut deltas = String::new();
    let mut failure: Option<String> = None;

    loop {
        match tokio::time::timeout_at(deadline, turn.next_event()).await {
            Ok(Some(note)) => {
                if let Some(reason) = note.failure_reason() {
                    failure = Some(reason);
                }
                if let Some(text) = agent_message_text(&note) {
                    completions.push_str(text);
                }
                if let Some(delta) = delta_text(&note) {
                    deltas.push_str(delta);
                }
                let terminal = note.is_terminal();
                if let Ok(value) = serde_json::to_value(&note) {
                    events.push(value);
                }
                if terminal {
                    break;
                }
            }
            Ok(None) => {
                lease.discard_dead().await;
                return Err(GateError::upstream("Agent stream ended unexpectedly"));
            }
            Err(_) => {
                warn!(thread_id = %turn.thread_id(), "turn timed out");
                lease.session().flag_probe();
                return Err(GateError::timeout(format!(
                    "Turn timed out after {}s",
                    timeout.as_secs()
                )));
            }
        }
    }

    if let Some(reason) = failure {
        return Err(GateError::upstream(format!("Turn failed upstream: {reason}")));
    }

    let message = if completions.is_empty() { deltas } else { completions };
    Ok(ChatEnvelope { thread_id: turn.thread_id().to_owned(), message, events })
}

/// Text of a completed `agentMessage` item, if this notification is one.
fn agent_message_text(note: &Notification) -> Option<&str> {
    if method_slug(&note.method) != "item.completed" {
        return None;
    }
    let item = note.params.get("item")?;
    let kind = item.get("type").or_else(|| item.get("itemType"))?.as_str()?;
    if kind != "agentMessage" {
        return None;
    }
    item.get("text")?.as_str()
}

/// Delta text of an `agentMessage` delta notification.
fn delta_text(note: &Notification) -> Option<&str> {
    if method_slug(&note.method) != "item.agentMessage.delta" {
        return None;
    }
    note.params.get("delta")?.as_str()
}

#[cfg(test)]
#[path = "chat_tests.rs"]
mod tests;
