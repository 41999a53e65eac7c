// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::error::ErrorKind;
use crate::test_support::{test_config, FakeBehavior, FakeLauncher};

fn manager_with(
    behavior: FakeBehavior,
    max_sessions: usize,
) -> (Arc<SessionManager>, Arc<FakeLauncher>) {
    let mut config = test_config();
    config.max_sessions = max_sessions;
    config.idle_timeout_secs = 0;
    let launcher = FakeLauncher::new(behavior);
    let manager = SessionManager::new(config, Arc::clone(&launcher) as Arc<dyn Launcher>);
    (manager, launcher)
}

#[tokio::test]
async fn capacity_is_enforced_without_evicting() {
    let (manager, _launcher) = manager_with(FakeBehavior::default(), 2);

    let _a = match manager.acquire("a").await {
        Ok(l) => l,
        Err(e) => panic!("acquire a failed: {e}"),
    };
    let _b = match manager.acquire("b").await {
        Ok(l) => l,
        Err(e) => panic!("acquire b failed: {e}"),
    };

    match manager.acquire("c").await {
        Err(err) => assert_eq!(err.kind, ErrorKind::Capacity),
        Ok(_) => panic!("expected capacity error"),
    }

    // The earlier sessions were untouched by the refusal.
    assert_eq!(manager.len().await, 2);
    assert!(_a.session().state() == SessionState::Ready);
}

#[tokio::test]
async fn same_user_reuses_one_session() {
    let (manager, launcher) = manager_with(FakeBehavior::default(), 4);

    let first = match manager.acquire("alice").await {
        Ok(l) => l,
        Err(e) => panic!("acquire failed: {e}"),
    };
    let second = match manager.acquire("alice").await {
        Ok(l) => l,
        Err(e) => panic!("acquire failed: {e}"),
    };
    assert!(Arc::ptr_eq(first.session(), second.session()));
    assert_eq!(launcher.spawned_count(), 1);
    assert_eq!(first.session().lease_count(), 2);

    drop(first);
    drop(second);
}

#[tokio::test]
async fn concurrent_acquires_share_one_start() {
    let (manager, launcher) = manager_with(FakeBehavior::default(), 4);

    let m1 = Arc::clone(&manager);
    let m2 = Arc::clone(&manager);
    let (a, b) = tokio::join!(
        async move { m1.acquire("alice").await },
        async move { m2.acquire("alice").await },
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(launcher.spawned_count(), 1);
    assert_eq!(manager.len().await, 1);
}

#[tokio::test]
async fn failed_start_removes_placeholder() {
    let behavior = FakeBehavior { fail_initialize: true, ..FakeBehavior::default() };
    let (manager, _launcher) = manager_with(behavior, 4);

    match manager.acquire("alice").await {
        Err(err) => assert_eq!(err.kind, ErrorKind::Upstream),
        Ok(_) => panic!("expected start failure"),
    }
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn dead_session_is_replaced_on_next_acquire() {
    let (manager, launcher) = manager_with(FakeBehavior::default(), 4);

    let lease = match manager.acquire("alice").await {
        Ok(l) => l,
        Err(e) => panic!("acquire failed: {e}"),
    };
    lease.session().teardown(Duration::from_millis(100)).await;
    drop(lease);

    let lease = match manager.acquire("alice").await {
        Ok(l) => l,
        Err(e) => panic!("re-acquire failed: {e}"),
    };
    assert_eq!(lease.session().state(), SessionState::Ready);
    assert_eq!(launcher.spawned_count(), 2);
}

#[tokio::test]
async fn reaper_skips_leased_sessions() {
    let (manager, launcher) = manager_with(FakeBehavior::default(), 4);

    let lease = match manager.acquire("alice").await {
        Ok(l) => l,
        Err(e) => panic!("acquire failed: {e}"),
    };

    // idle_timeout is zero: everything unleased is overdue.
    manager.reap_idle().await;
    assert_eq!(manager.len().await, 1, "leased session must not be reaped");

    drop(lease);
    manager.reap_idle().await;
    assert!(manager.is_empty().await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launcher.terminated_count(), 1);
}

#[tokio::test]
async fn shutdown_refuses_new_acquires() {
    let (manager, _launcher) = manager_with(FakeBehavior::default(), 4);
    let _ = manager.acquire("alice").await;
    manager.shutdown().await;

    match manager.acquire("bob").await {
        Err(err) => assert_eq!(err.kind, ErrorKind::Capacity),
        Ok(_) => panic!("expected refusal after shutdown"),
    }
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn discard_is_scoped_to_the_same_instance() {
    let (manager, launcher) = manager_with(FakeBehavior::default(), 4);

    let lease = match manager.acquire("alice").await {
        Ok(l) => l,
        Err(e) => panic!("acquire failed: {e}"),
    };
    let stale = Arc::clone(lease.session());
    drop(lease);

    // Replace the registered session.
    manager.discard(&stale).await;
    let lease = match manager.acquire("alice").await {
        Ok(l) => l,
        Err(e) => panic!("re-acquire failed: {e}"),
    };
    assert_eq!(launcher.spawned_count(), 2);

    // Discarding the stale instance again must not remove the fresh one.
    manager.discard(&stale).await;
    assert_eq!(manager.len().await, 1);
    drop(lease);
}
