// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    both = { true, true, "ok" },
    neither = { false, false, "unavailable" },
    binary_only = { true, false, "degraded" },
    key_only = { false, true, "degraded" },
)]
fn status_rule(available: bool, key: bool, expected: &str) {
    let probe = CodexProbe {
        binary: available.then(|| PathBuf::from("/usr/bin/codex")),
        version: None,
    };
    assert_eq!(probe.status(key), expected);
}

#[test]
fn configured_binary_must_exist() {
    let mut config = crate::test_support::test_config();
    config.codex_bin = Some(PathBuf::from("/nonexistent/codex"));
    assert_eq!(resolve_binary(&config), None);
}
