// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child binary detection for `/status`.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::GateConfig;

/// Name searched on PATH when no explicit binary is configured.
const BINARY_NAME: &str = "codex";

/// How long the one-shot `--version` probe may take.
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved child binary information, captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct CodexProbe {
    pub binary: Option<PathBuf>,
    pub version: Option<String>,
}

impl CodexProbe {
    pub fn available(&self) -> bool {
        self.binary.is_some()
    }

    /// `/status` rule: ok iff binary resolvable AND key configured;
    /// unavailable iff neither; else degraded.
    pub fn status(&self, api_key_configured: bool) -> &'static str {
        match (self.available(), api_key_configured) {
            (true, true) => "ok",
            (false, false) => "unavailable",
            _ => "degraded",
        }
    }
}

/// Resolve the binary from config or PATH.
pub fn resolve_binary(config: &GateConfig) -> Option<PathBuf> {
    if let Some(bin) = &config.codex_bin {
        return bin.is_file().then(|| bin.clone());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).map(|dir| dir.join(BINARY_NAME)).find(|p| p.is_file())
}

/// Resolve the binary and capture its `--version` output.
pub async fn detect(config: &GateConfig) -> CodexProbe {
    let Some(binary) = resolve_binary(config) else {
        return CodexProbe::default();
    };

    let output = tokio::time::timeout(
        VERSION_TIMEOUT,
        tokio::process::Command::new(&binary).arg("--version").output(),
    )
    .await;

    let version = match output {
        Ok(Ok(out)) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            let line = text.lines().next().unwrap_or_default().trim();
            (!line.is_empty()).then(|| line.to_owned())
        }
        _ => None,
    };

    CodexProbe { binary: Some(binary), version }
}

#[cfg(test)]
#[path = "probe_tests.rs"]
mod tests;
