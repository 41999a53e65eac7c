// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport for the gateway.

pub mod http;
pub mod identity;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the axum `Router` with all gateway routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(http::root))
        .route("/status", get(http::status))
        .route("/threads", get(http::threads))
        .route("/history", get(http::thread_history))
        .route("/chat", post(http::chat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
