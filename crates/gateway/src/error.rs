// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Error kinds for the gateway API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Auth,
    Forbidden,
    NotFound,
    Capacity,
    Upstream,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Capacity => 503,
            Self::Upstream => 502,
            Self::Timeout => 504,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Capacity => "capacity",
            Self::Upstream => "upstream_failure",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-visible error body. Every error path responds with this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub detail: String,
}

/// An API error: a kind (mapped to an HTTP status) plus the detail string.
#[derive(Debug, Clone)]
pub struct GateError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl GateError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, detail)
    }

    pub fn thread_not_found(thread_id: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("Thread not found: {thread_id}"))
    }

    pub fn capacity(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Capacity, detail)
    }

    pub fn upstream(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for GateError {}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorDetail { detail: self.detail })).into_response()
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
