// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::process::Command;
use tracing::info;

use crate::config::GateConfig;
use crate::rpc::RpcTransport;

/// Produces a connected transport for one user's agent child.
///
/// The seam lets tests substitute a scripted in-memory agent for the real
/// `codex app-server` subprocess.
pub trait Launcher: Send + Sync {
    fn launch<'a>(
        &'a self,
        user_id: &'a str,
        data_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<RpcTransport>>> + Send + 'a>>;
}

/// Spawns the real `codex app-server` with the user's home directory.
pub struct CodexLauncher {
    binary: Option<PathBuf>,
    api_key: Option<String>,
    working_dir: Option<PathBuf>,
}

impl CodexLauncher {
    pub fn new(binary: Option<PathBuf>, config: &GateConfig) -> Self {
        Self {
            binary,
            api_key: config.api_key.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

impl Launcher for CodexLauncher {
    fn launch<'a>(
        &'a self,
        user_id: &'a str,
        data_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Arc<RpcTransport>>> + Send + 'a>> {
        Box::pin(async move {
            let Some(binary) = &self.binary else {
                anyhow::bail!("codex binary not found (set --codex-bin or add it to PATH)");
            };

            let mut cmd = Command::new(binary);
            cmd.arg("app-server");
            cmd.env("CODEX_HOME", data_dir);
            if let Some(key) = &self.api_key {
                cmd.env("OPENAI_API_KEY", key);
            }
            if let Some(dir) = &self.working_dir {
                cmd.current_dir(dir);
            }

            let transport = RpcTransport::spawn(cmd)?;
            info!(user_id, data_dir = %data_dir.display(), "spawned codex app-server");
            Ok(transport)
        })
    }
}
