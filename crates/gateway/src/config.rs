// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// HTTP façade for `codex app-server` sessions.
#[derive(Debug, Clone, Parser)]
#[command(name = "codexgate", version, about)]
pub struct GateConfig {
    /// Host address to bind to.
    #[arg(long, env = "CODEX_GATE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP port to listen on.
    #[arg(long, env = "CODEX_GATE_PORT", default_value_t = 8099)]
    pub port: u16,

    /// API key forwarded to the child via env and `loginApiKey`.
    #[arg(long, env = "OPENAI_API_KEY")]
    pub api_key: Option<String>,

    /// Path to the codex binary. If unset, resolved from PATH.
    #[arg(long, env = "CODEX_GATE_BIN")]
    pub codex_bin: Option<PathBuf>,

    /// Working directory for spawned children.
    #[arg(long, env = "CODEX_GATE_WORKDIR")]
    pub working_dir: Option<PathBuf>,

    /// Base data directory; each user gets `{data_dir}/users/{user_id}`.
    #[arg(long, env = "CODEX_GATE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Default model override for new conversations.
    #[arg(long, env = "CODEX_GATE_MODEL")]
    pub model: Option<String>,

    /// Maximum number of live sessions.
    #[arg(long, env = "CODEX_GATE_MAX_SESSIONS", default_value_t = 20)]
    pub max_sessions: usize,

    /// Idle timeout in seconds before a session is reaped.
    #[arg(long = "idle-timeout", env = "CODEX_GATE_IDLE_TIMEOUT", default_value_t = 900)]
    pub idle_timeout_secs: u64,

    /// Reaper wake interval in seconds.
    #[arg(long = "cleanup-interval", env = "CODEX_GATE_CLEANUP_INTERVAL", default_value_t = 60)]
    pub cleanup_interval_secs: u64,

    /// Per-turn wall-clock limit in seconds.
    #[arg(long = "turn-timeout", env = "CODEX_GATE_TURN_TIMEOUT", default_value_t = 300)]
    pub turn_timeout_secs: u64,

    /// Honor `user_id` from body/header/query when security is `none`.
    #[arg(long, env = "CODEX_GATE_ALLOW_USER_OVERRIDE", default_value_t = false)]
    pub allow_user_override: bool,

    /// Security method: `none` or `keycloak`.
    #[arg(long, env = "CODEX_GATE_SECURITY", value_enum, default_value = "none")]
    pub security: SecurityMethod,

    /// Keycloak base URL (required when --security keycloak).
    #[arg(long, env = "CODEX_GATE_KEYCLOAK_URL")]
    pub keycloak_url: Option<String>,

    /// Keycloak realm.
    #[arg(long, env = "CODEX_GATE_KEYCLOAK_REALM")]
    pub keycloak_realm: Option<String>,

    /// Keycloak client id used for token introspection.
    #[arg(long, env = "CODEX_GATE_KEYCLOAK_CLIENT_ID")]
    pub keycloak_client_id: Option<String>,

    /// Keycloak client secret used for token introspection.
    #[arg(long, env = "CODEX_GATE_KEYCLOAK_CLIENT_SECRET")]
    pub keycloak_client_secret: Option<String>,

    /// Log format (json or text).
    #[arg(long, env = "CODEX_GATE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CODEX_GATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Identity enforcement method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SecurityMethod {
    None,
    Keycloak,
}

impl GateConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    /// Data directory for one user, exported to the child as `CODEX_HOME`.
    pub fn user_data_dir(&self, user_id: &str) -> PathBuf {
        self.data_dir.join("users").join(user_id)
    }

    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_sessions == 0 {
            anyhow::bail!("--max-sessions must be at least 1");
        }
        if self.security == SecurityMethod::Keycloak {
            if self.keycloak_url.is_none()
                || self.keycloak_realm.is_none()
                || self.keycloak_client_id.is_none()
                || self.keycloak_client_secret.is_none()
            {
                anyhow::bail!(
                    "--security keycloak requires --keycloak-url, --keycloak-realm, \
                     --keycloak-client-id and --keycloak-client-secret"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
