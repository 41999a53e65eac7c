// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-user agent sessions: one child process, one handshake, one turn at a
//! time.

pub mod launcher;
pub mod manager;
pub mod turn;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::GateError;
use crate::rpc::{CallError, RpcTransport};

pub use launcher::{CodexLauncher, Launcher};
pub use manager::{SessionLease, SessionManager};
pub use turn::TurnHandle;

/// Bound on each handshake RPC (`initialize`, `loginApiKey`).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on the health probe issued after a turn timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Page size used when walking `listConversations` during thread-id
/// validation.
const LIST_PAGE_SIZE: u64 = 100;

/// Session lifecycle. Transitions are monotonic except `Ready ↔ Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Draining,
    Dead,
}

/// One user's agent instance: data directory, child transport, known
/// conversations, and the turn lock serializing turns.
pub struct Session {
    user_id: String,
    data_dir: PathBuf,
    transport: Arc<RpcTransport>,
    conversations: Mutex<HashSet<String>>,
    state: Mutex<SessionState>,
    last_active: Mutex<Instant>,
    leases: AtomicUsize,
    needs_probe: AtomicBool,
    turn_gate: Arc<tokio::sync::Mutex<()>>,
    default_model: Option<String>,
}

impl Session {
    /// Create the data directory, launch the child, and run the handshake:
    /// `initialize`, then `loginApiKey` when an API key is configured.
    pub async fn start(
        user_id: &str,
        data_dir: PathBuf,
        launcher: &dyn Launcher,
        api_key: Option<&str>,
        default_model: Option<String>,
    ) -> Result<Arc<Self>, GateError> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| GateError::internal(format!("create data dir: {e}")))?;

        let transport = launcher
            .launch(user_id, &data_dir)
            .await
            .map_err(|e| GateError::upstream(format!("spawn agent: {e:#}")))?;

        let session = Arc::new(Self {
            user_id: user_id.to_owned(),
            data_dir,
            transport,
            conversations: Mutex::new(HashSet::new()),
            state: Mutex::new(SessionState::Starting),
            last_active: Mutex::new(Instant::now()),
            leases: AtomicUsize::new(0),
            needs_probe: AtomicBool::new(false),
            turn_gate: Arc::new(tokio::sync::Mutex::new(())),
            default_model,
        });

        if let Err(err) = session.handshake(api_key).await {
            session.set_state(SessionState::Dead);
            session.transport.close(Duration::from_secs(1)).await;
            return Err(err);
        }

        session.set_state(SessionState::Ready);
        info!(user_id, "session ready");
        Ok(session)
    }

    async fn handshake(&self, api_key: Option<&str>) -> Result<(), GateError> {
        let client_info = json!({
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        self.checked_call("initialize", Some(client_info), HANDSHAKE_TIMEOUT)
            .await
            .map_err(|e| GateError::upstream(format!("initialize failed: {e}")))?;

        if let Some(key) = api_key {
            self.checked_call("loginApiKey", Some(json!({"apiKey": key})), HANDSHAKE_TIMEOUT)
                .await
                .map_err(|e| GateError::upstream(format!("loginApiKey failed: {e}")))?;
        }
        Ok(())
    }

    /// Issue an RPC with a deadline, refreshing `last_active` on success.
    async fn checked_call(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        let result = tokio::time::timeout(deadline, self.transport.call(method, params)).await;
        match result {
            Ok(Ok(value)) => {
                self.touch();
                Ok(value)
            }
            Ok(Err(err)) => {
                if matches!(err, CallError::Transport { .. }) {
                    self.set_state(SessionState::Dead);
                }
                Err(err)
            }
            Err(_) => Err(CallError::Transport {
                reason: format!("{method} timed out after {deadline:?}"),
                stderr_tail: self.transport.stderr_tail(),
            }),
        }
    }

    /// Forward an RPC for this session, keeping the raw failure kind so
    /// callers can distinguish protocol errors from a dead transport.
    pub async fn call_raw(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        self.checked_call(method, params, Duration::from_secs(30)).await
    }

    /// Forward an RPC for this session, mapping failures to API errors.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, GateError> {
        self.call_raw(method, params).await.map_err(|e| match e {
            CallError::Rpc(err) => GateError::upstream(format!("{method}: {}", err.message)),
            err => GateError::upstream(format!("{method}: {err}")),
        })
    }

    /// Start one turn: resolve or create the conversation, subscribe to its
    /// notifications, then issue the user message.
    ///
    /// Fails fast with a capacity error when another turn is in flight.
    pub async fn send_turn(
        self: &Arc<Self>,
        thread_id: Option<String>,
        text: &str,
        model: Option<&str>,
    ) -> Result<TurnHandle, GateError> {
        match self.state() {
            SessionState::Ready => {}
            SessionState::Draining => {
                return Err(GateError::capacity("Session is shutting down"));
            }
            _ => return Err(GateError::upstream("Session is not ready")),
        }

        let gate = Arc::clone(&self.turn_gate)
            .try_lock_owned()
            .map_err(|_| GateError::capacity("Session busy: a turn is already in progress"))?;

        let conversation_id = match thread_id {
            Some(id) => {
                self.validate_thread(&id).await?;
                id
            }
            None => self.new_conversation(model).await?,
        };

        // Subscribe before issuing the send so no notification can be missed.
        let stream = self.transport.subscribe_conversation(&conversation_id);

        let model = model.or(self.default_model.as_deref());
        let mut params = json!({
            "conversationId": conversation_id,
            "items": [{"type": "text", "text": text}],
        });
        if let Some(model) = model {
            params["model"] = Value::String(model.to_owned());
        }

        let sent = self.checked_call("sendUserTurn", Some(params.clone()), HANDSHAKE_TIMEOUT).await;
        if let Err(err) = sent {
            // Older protocol revisions expose `sendUserMessage` instead.
            if err.is_method_not_found() {
                debug!(user_id = %self.user_id, "sendUserTurn unavailable, trying sendUserMessage");
                self.checked_call("sendUserMessage", Some(params), HANDSHAKE_TIMEOUT)
                    .await
                    .map_err(|e| self.turn_error(e))?;
            } else {
                return Err(self.turn_error(err));
            }
        }

        Ok(TurnHandle::new(conversation_id, stream, gate))
    }

    fn turn_error(&self, err: CallError) -> GateError {
        warn!(user_id = %self.user_id, "turn dispatch failed: {err}");
        GateError::upstream(format!("Agent rejected the turn: {err}"))
    }

    async fn new_conversation(&self, model: Option<&str>) -> Result<String, GateError> {
        let mut params = json!({});
        if let Some(model) = model.or(self.default_model.as_deref()) {
            params["model"] = Value::String(model.to_owned());
        }
        let result = self
            .checked_call("newConversation", Some(params), HANDSHAKE_TIMEOUT)
            .await
            .map_err(|e| GateError::upstream(format!("newConversation: {e}")))?;

        let id = result
            .get("conversationId")
            .and_then(Value::as_str)
            .ok_or_else(|| GateError::upstream("newConversation returned no conversationId"))?;
        self.record_conversation(id);
        Ok(id.to_owned())
    }

    /// A client-supplied thread id is accepted iff this session created it,
    /// or the upstream confirms it belongs to this user. Checked before any
    /// write is issued.
    ///
    /// The upstream listing is paginated; the id may live on any page (the
    /// local cache is empty after a gateway restart), so this walks
    /// `nextCursor` until the id is found or the listing is exhausted.
    pub async fn validate_thread(&self, thread_id: &str) -> Result<(), GateError> {
        if self.conversations.lock().contains(thread_id) {
            return Ok(());
        }

        let mut cursor: Option<String> = None;
        loop {
            let mut params = json!({"limit": LIST_PAGE_SIZE});
            if let Some(cursor) = &cursor {
                params["cursor"] = Value::String(cursor.clone());
            }
            let listed = self
                .checked_call("listConversations", Some(params), HANDSHAKE_TIMEOUT)
                .await
                .map_err(|e| GateError::upstream(format!("listConversations: {e}")))?;

            let items = conversation_items(&listed);
            let known = items
                .iter()
                .filter_map(|item| item_conversation_id(item))
                .any(|id| id == thread_id);
            if known {
                self.record_conversation(thread_id);
                return Ok(());
            }

            cursor = listed
                .get("nextCursor")
                .or_else(|| listed.get("next_cursor"))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            // An empty page guards against an upstream that echoes a cursor
            // forever.
            if cursor.is_none() || items.is_empty() {
                return Err(GateError::thread_not_found(thread_id));
            }
        }
    }

    pub fn record_conversation(&self, id: &str) {
        self.conversations.lock().insert(id.to_owned());
    }

    /// Simulate a gateway restart: the child retains its conversations but
    /// the local cache starts empty.
    #[cfg(test)]
    pub(crate) fn forget_conversations(&self) {
        self.conversations.lock().clear();
    }

    /// Lightweight liveness check, run after a turn timeout before reuse.
    pub async fn probe(&self) -> Result<(), GateError> {
        self.checked_call("listConversations", Some(json!({"limit": 1})), PROBE_TIMEOUT)
            .await
            .map_err(|e| GateError::upstream(format!("health probe failed: {e}")))?;
        self.needs_probe.store(false, Ordering::Release);
        Ok(())
    }

    pub fn flag_probe(&self) {
        self.needs_probe.store(true, Ordering::Release);
    }

    pub fn probe_pending(&self) -> bool {
        self.needs_probe.load(Ordering::Acquire)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, next: SessionState) {
        *self.state.lock() = next;
    }

    pub fn is_dead(&self) -> bool {
        self.state() == SessionState::Dead || self.transport.is_closed()
    }

    /// Refresh the idle clock. Called on every inbound access and every
    /// successful RPC.
    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    pub(super) fn incr_leases(&self) {
        self.leases.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn decr_leases(&self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }

    /// Close the child transport. Pending calls complete with a transport
    /// failure; the grace period bounds how long the child may linger.
    pub async fn teardown(&self, grace: Duration) {
        self.set_state(SessionState::Dead);
        self.transport.close(grace).await;
    }
}

/// Items array of a `listConversations` result, tolerating both `items` and
/// `threads` keys.
pub(crate) fn conversation_items(result: &Value) -> Vec<Value> {
    result
        .get("items")
        .or_else(|| result.get("threads"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Conversation id of one listed item, tolerating schema drift.
pub(crate) fn item_conversation_id(item: &Value) -> Option<&str> {
    item.get("conversationId")
        .or_else(|| item.get("id"))
        .or_else(|| item.get("thread_id"))
        .and_then(Value::as_str)
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
