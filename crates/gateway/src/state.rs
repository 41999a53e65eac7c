// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use crate::config::GateConfig;
use crate::probe::CodexProbe;
use crate::session::SessionManager;
use crate::transport::identity::IdentityEnforcer;

/// Shared gateway state.
pub struct AppState {
    pub config: GateConfig,
    pub manager: Arc<SessionManager>,
    pub identity: IdentityEnforcer,
    /// Binary/version information captured once at startup.
    pub codex: CodexProbe,
}
