// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the gateway API.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::chat::{handle_chat, ChatRequest};
use crate::error::GateError;
use crate::history;
use crate::state::AppState;

use super::identity::requested_user_id;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub endpoints: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub codex_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex_version: Option<String>,
    pub api_key_configured: bool,
}

#[derive(Debug, Deserialize)]
pub struct ThreadsQuery {
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    #[serde(default)]
    pub user_id: Option<String>,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /`
pub async fn root() -> impl IntoResponse {
    Json(RootResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec!["/status", "/threads", "/history", "/chat"],
    })
}

/// `GET /status`
pub async fn status(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let api_key_configured = s.config.api_key.is_some();
    Json(StatusResponse {
        status: s.codex.status(api_key_configured),
        codex_available: s.codex.available(),
        codex_version: s.codex.version.clone(),
        api_key_configured,
    })
}

/// `GET /threads`
pub async fn threads(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ThreadsQuery>,
) -> Result<Response, GateError> {
    let requested = requested_user_id(None, &headers, query.user_id.as_deref());
    let user_id = s.identity.resolve(requested.as_deref(), &headers).await?;

    let lease = s.manager.acquire(&user_id).await?;
    let result = history::list_threads(lease.session(), query.limit, query.cursor.as_deref()).await;
    if result.is_err() {
        lease.discard_dead().await;
    }
    Ok(Json(result?).into_response())
}

/// `GET /history?thread_id=...`
pub async fn thread_history(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, GateError> {
    let Some(thread_id) = query.thread_id.filter(|t| !t.is_empty()) else {
        return Err(GateError::validation("thread_id is required"));
    };
    let requested = requested_user_id(None, &headers, query.user_id.as_deref());
    let user_id = s.identity.resolve(requested.as_deref(), &headers).await?;

    let lease = s.manager.acquire(&user_id).await?;
    let result = history::get_thread(lease.session(), &thread_id).await;
    if result.is_err() {
        lease.discard_dead().await;
    }
    Ok(Json(result?).into_response())
}

/// `POST /chat`
pub async fn chat(
    State(s): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ChatQuery>,
    Json(body): Json<ChatRequest>,
) -> Result<Response, GateError> {
    let requested =
        requested_user_id(body.user_id.as_deref(), &headers, query.user_id.as_deref());
    let user_id = s.identity.resolve(requested.as_deref(), &headers).await?;
    handle_chat(&s, &user_id, body).await
}
