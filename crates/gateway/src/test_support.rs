// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: a scripted fake `codex app-server` speaking
//! the child stdio contract over an in-memory duplex pipe, plus builders for
//! manager/router tests.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

use crate::config::{GateConfig, SecurityMethod};
use crate::probe::CodexProbe;
use crate::rpc::RpcTransport;
use crate::session::{Launcher, SessionManager};
use crate::state::AppState;
use crate::transport::identity::IdentityEnforcer;

/// Behavior knobs for the fake agent.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Agent reply is `{reply_prefix}{prompt}`.
    pub reply_prefix: String,
    /// How many `agentMessage` delta frames the reply is split into.
    pub delta_chunks: usize,
    /// Prompts containing this marker produce a failed turn.
    pub fail_marker: String,
    /// Prompts containing this marker never reach a terminal notification.
    pub stall_marker: String,
    /// Respond to `sendUserTurn` with method-not-found, forcing the
    /// `sendUserMessage` fallback.
    pub reject_send_user_turn: bool,
    /// Refuse the `initialize` handshake.
    pub fail_initialize: bool,
    /// Emit `turn/completed`-style method names instead of `turn.completed`.
    pub slash_methods: bool,
    /// Clamp on the `limit` a `listConversations` request may ask for,
    /// forcing multi-page listings in pagination tests.
    pub list_page_cap: Option<usize>,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            reply_prefix: "You said: ".to_owned(),
            delta_chunks: 2,
            fail_marker: "[fail]".to_owned(),
            stall_marker: "[stall]".to_owned(),
            reject_send_user_turn: false,
            fail_initialize: false,
            slash_methods: true,
            list_page_cap: None,
        }
    }
}

#[derive(Debug, Default)]
struct FakeConversation {
    created_at: String,
    turns: Vec<Value>,
    preview: Option<String>,
}

/// Launcher that connects sessions to scripted fake agents and counts
/// spawns/terminations, the observable for reap tests.
pub struct FakeLauncher {
    pub behavior: FakeBehavior,
    pub spawned: Arc<AtomicUsize>,
    pub terminated: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new(behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            spawned: Arc::new(AtomicUsize::new(0)),
            terminated: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn terminated_count(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl Launcher for FakeLauncher {
    fn launch<'a>(
        &'a self,
        _user_id: &'a str,
        _data_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<RpcTransport>>> + Send + 'a>> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(256 * 1024);
            spawn_fake_codex(server, self.behavior.clone(), Arc::clone(&self.terminated));
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let (r, w) = tokio::io::split(client);
            Ok(RpcTransport::connect(r, w))
        })
    }
}

/// Config with fast timers and an isolated data dir for tests.
pub fn test_config() -> GateConfig {
    GateConfig {
        host: "127.0.0.1".to_owned(),
        port: 0,
        api_key: Some("sk-test".to_owned()),
        codex_bin: None,
        working_dir: None,
        data_dir: std::env::temp_dir().join("codexgate-tests").join(uuid::Uuid::new_v4().to_string()),
        model: None,
        max_sessions: 20,
        idle_timeout_secs: 900,
        cleanup_interval_secs: 60,
        turn_timeout_secs: 300,
        allow_user_override: true,
        security: SecurityMethod::None,
        keycloak_url: None,
        keycloak_realm: None,
        keycloak_client_id: None,
        keycloak_client_secret: None,
        log_format: "text".to_owned(),
        log_level: "info".to_owned(),
    }
}

/// App state wired to a fake launcher. Identity enforcement follows
/// `config.allow_user_override`.
pub fn test_state(config: GateConfig, launcher: Arc<FakeLauncher>) -> Arc<AppState> {
    let manager = SessionManager::new(config.clone(), launcher as Arc<dyn Launcher>);
    let identity = IdentityEnforcer::Disabled { allow_override: config.allow_user_override };
    Arc::new(AppState { config, manager, identity, codex: CodexProbe::default() })
}

/// Run a scripted fake agent on the server end of a duplex pipe.
///
/// Responses are written before the notifications a request triggers, and
/// all writes happen on one task, so ordering matches a real child.
pub fn spawn_fake_codex(
    io: DuplexStream,
    behavior: FakeBehavior,
    terminated: Arc<AtomicUsize>,
) {
    let (r, w) = tokio::io::split(io);
    tokio::spawn(async move {
        let mut w = w;
        let mut lines = BufReader::new(r).lines();
        let mut conversations: HashMap<String, FakeConversation> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        while let Ok(Some(line)) = lines.next_line().await {
            let req: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let id = req["id"].clone();
            let method = req["method"].as_str().unwrap_or_default().to_owned();
            let params = req["params"].clone();

            let keep_going = handle_request(
                &mut w,
                &behavior,
                &mut conversations,
                &mut order,
                id,
                &method,
                &params,
            )
            .await;
            if !keep_going {
                break;
            }
        }
        terminated.fetch_add(1, Ordering::SeqCst);
    });
}

async fn handle_request(
    w: &mut WriteHalf<DuplexStream>,
    behavior: &FakeBehavior,
    conversations: &mut HashMap<String, FakeConversation>,
    order: &mut Vec<String>,
    id: Value,
    method: &str,
    params: &Value,
) -> bool {
    match method {
        "initialize" => {
            if behavior.fail_initialize {
                return respond_err(w, id, -32000, "initialize refused").await;
            }
            let result = json!({"serverInfo": {"name": "fake-codex", "version": "0.0.0"}});
            respond_ok(w, id, result).await
        }
        "loginApiKey" => respond_ok(w, id, json!({})).await,
        "newConversation" => {
            let conv_id = uuid::Uuid::new_v4().to_string();
            conversations.insert(
                conv_id.clone(),
                FakeConversation {
                    created_at: format!("2026-01-01T00:00:{:02}Z", order.len()),
                    ..Default::default()
                },
            );
            order.push(conv_id.clone());
            respond_ok(w, id, json!({"conversationId": conv_id, "model": params["model"]})).await
        }
        "sendUserTurn" if behavior.reject_send_user_turn => {
            respond_err(w, id, -32601, "method not found").await
        }
        "sendUserTurn" | "sendUserMessage" => {
            run_turn(w, behavior, conversations, id, params).await
        }
        "listConversations" => {
            let limit = params["limit"].as_u64().unwrap_or(50) as usize;
            let limit = behavior.list_page_cap.map_or(limit, |cap| limit.min(cap));
            let offset: usize =
                params["cursor"].as_str().and_then(|c| c.parse().ok()).unwrap_or(0);
            let page: Vec<Value> = order
                .iter()
                .skip(offset)
                .take(limit)
                .filter_map(|conv_id| {
                    conversations.get(conv_id).map(|c| {
                        json!({
                            "conversationId": conv_id,
                            "preview": c.preview,
                            "createdAt": c.created_at,
                            "updatedAt": c.created_at,
                        })
                    })
                })
                .collect();
            let next_cursor = if offset + page.len() < order.len() {
                Value::String((offset + page.len()).to_string())
            } else {
                Value::Null
            };
            respond_ok(w, id, json!({"items": page, "nextCursor": next_cursor})).await
        }
        "getConversation" => {
            let conv_id = params["conversationId"].as_str().unwrap_or_default();
            match conversations.get(conv_id) {
                Some(c) => {
                    let result = json!({
                        "conversationId": conv_id,
                        "turns": c.turns,
                        "createdAt": c.created_at,
                        "preview": c.preview,
                    });
                    respond_ok(w, id, result).await
                }
                None => respond_err(w, id, -32002, "conversation not found").await,
            }
        }
        _ => respond_err(w, id, -32601, "method not found").await,
    }
}

async fn run_turn(
    w: &mut WriteHalf<DuplexStream>,
    behavior: &FakeBehavior,
    conversations: &mut HashMap<String, FakeConversation>,
    id: Value,
    params: &Value,
) -> bool {
    let conv_id = params["conversationId"].as_str().unwrap_or_default().to_owned();
    if !conversations.contains_key(&conv_id) {
        return respond_err(w, id, -32002, "conversation not found").await;
    }
    let text = params["items"][0]["text"].as_str().unwrap_or_default().to_owned();

    if !respond_ok(w, id, json!({})).await {
        return false;
    }

    let m = |name: &str| {
        if behavior.slash_methods {
            name.replace('.', "/")
        } else {
            name.to_owned()
        }
    };

    if !notify(w, &m("turn.started"), json!({"conversationId": conv_id})).await {
        return false;
    }
    let user_item = json!({"type": "userMessage", "text": text});
    if !notify(w, &m("item.started"), json!({"conversationId": conv_id, "item": user_item})).await {
        return false;
    }

    if text.contains(&behavior.fail_marker) {
        let params = json!({
            "conversationId": conv_id,
            "error": {"message": "simulated agent failure"},
        });
        return notify(w, &m("turn.failed"), params).await;
    }
    if text.contains(&behavior.stall_marker) {
        // Never reach a terminal notification; the gateway's turn timeout
        // is responsible for ending this turn.
        return true;
    }

    let reply = format!("{}{}", behavior.reply_prefix, text);
    let chunks = behavior.delta_chunks.max(1);
    let step = reply.len().div_ceil(chunks).max(1);
    let mut at = 0;
    while at < reply.len() {
        let mut end = (at + step).min(reply.len());
        while !reply.is_char_boundary(end) {
            end += 1;
        }
        let delta = &reply[at..end];
        let params = json!({"conversationId": conv_id, "delta": delta});
        if !notify(w, &m("item.agentMessage.delta"), params).await {
            return false;
        }
        at = end;
    }

    let agent_item = json!({"type": "agentMessage", "text": reply});
    let completed = json!({"conversationId": conv_id, "item": agent_item});
    if !notify(w, &m("item.completed"), completed).await {
        return false;
    }

    if let Some(conv) = conversations.get_mut(&conv_id) {
        conv.turns.push(json!({
            "items": [
                {"type": "userMessage", "text": text},
                {"type": "agentMessage", "text": reply},
            ]
        }));
        conv.preview.get_or_insert(reply.clone());
    }

    let params = json!({"conversationId": conv_id, "turn": {"status": "completed"}});
    notify(w, &m("turn.completed"), params).await
}

async fn respond_ok(w: &mut WriteHalf<DuplexStream>, id: Value, result: Value) -> bool {
    write_frame(w, json!({"jsonrpc": "2.0", "id": id, "result": result})).await
}

async fn respond_err(
    w: &mut WriteHalf<DuplexStream>,
    id: Value,
    code: i64,
    message: &str,
) -> bool {
    let frame = json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}});
    write_frame(w, frame).await
}

async fn notify(w: &mut WriteHalf<DuplexStream>, method: &str, params: Value) -> bool {
    write_frame(w, json!({"jsonrpc": "2.0", "method": method, "params": params})).await
}

async fn write_frame(w: &mut WriteHalf<DuplexStream>, frame: Value) -> bool {
    let mut line = frame.to_string().into_bytes();
    line.push(b'\n');
    w.write_all(&line).await.is_ok()
}
