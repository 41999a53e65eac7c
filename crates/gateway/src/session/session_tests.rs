// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::rpc::message::method_slug;
use crate::test_support::{test_config, FakeBehavior, FakeLauncher};

async fn started_session(behavior: FakeBehavior) -> (Arc<Session>, Arc<FakeLauncher>) {
    let config = test_config();
    let launcher = FakeLauncher::new(behavior);
    let session = match Session::start(
        "alice",
        config.user_data_dir("alice"),
        launcher.as_ref(),
        config.api_key.as_deref(),
        None,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => panic!("session start failed: {e}"),
    };
    (session, launcher)
}

#[tokio::test]
async fn start_handshakes_and_becomes_ready() {
    let (session, launcher) = started_session(FakeBehavior::default()).await;
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(launcher.spawned_count(), 1);
    assert!(!session.is_dead());
}

#[tokio::test]
async fn handshake_failure_is_surfaced() {
    let behavior = FakeBehavior { fail_initialize: true, ..FakeBehavior::default() };
    let config = test_config();
    let launcher = FakeLauncher::new(behavior);
    let result = Session::start(
        "bob",
        config.user_data_dir("bob"),
        launcher.as_ref(),
        None,
        None,
    )
    .await;
    match result {
        Err(err) => assert!(err.detail.contains("initialize failed"), "got: {err}"),
        Ok(_) => panic!("expected handshake failure"),
    }
}

#[tokio::test]
async fn send_turn_creates_conversation_and_terminates() {
    let (session, _launcher) = started_session(FakeBehavior::default()).await;

    let mut turn = match session.send_turn(None, "What is 2+2?", None).await {
        Ok(t) => t,
        Err(e) => panic!("send_turn failed: {e}"),
    };
    assert!(!turn.thread_id().is_empty());

    let mut methods = Vec::new();
    while let Some(note) = turn.next_event().await {
        assert_eq!(note.conversation_id(), Some(turn.thread_id()));
        methods.push(method_slug(&note.method));
    }
    assert!(turn.saw_terminal());
    assert_eq!(methods.first().map(String::as_str), Some("turn.started"));
    assert_eq!(methods.last().map(String::as_str), Some("turn.completed"));
    assert_eq!(methods.iter().filter(|m| *m == "turn.completed").count(), 1);

    // The new conversation is now known to the session.
    let thread_id = turn.thread_id().to_owned();
    drop(turn);
    assert!(session.validate_thread(&thread_id).await.is_ok());
}

#[tokio::test]
async fn unknown_thread_is_rejected_before_any_write() {
    let (session, _launcher) = started_session(FakeBehavior::default()).await;
    match session.send_turn(Some("invalid-id".to_owned()), "hi", None).await {
        Err(err) => {
            assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
            assert_eq!(err.detail, "Thread not found: invalid-id");
        }
        Ok(_) => panic!("expected thread_not_found"),
    }

    // The failed validation released the turn lock.
    assert!(session.send_turn(None, "hi", None).await.is_ok());
}

#[tokio::test]
async fn thread_validation_walks_every_listing_page() {
    // Cap the fake's pages at one item so three conversations span three
    // pages; an id past the first page must still validate.
    let behavior = FakeBehavior { list_page_cap: Some(1), ..FakeBehavior::default() };
    let (session, _launcher) = started_session(behavior).await;

    let mut created = Vec::new();
    for i in 0..3 {
        let mut turn = match session.send_turn(None, &format!("turn {i}"), None).await {
            Ok(t) => t,
            Err(e) => panic!("send_turn failed: {e}"),
        };
        created.push(turn.thread_id().to_owned());
        while turn.next_event().await.is_some() {}
    }

    // The child still knows every conversation, the local cache does not.
    session.forget_conversations();
    for thread_id in &created {
        assert!(
            session.validate_thread(thread_id).await.is_ok(),
            "{thread_id} should validate via pagination"
        );
    }

    session.forget_conversations();
    match session.validate_thread("not-a-thread").await {
        Err(err) => assert_eq!(err.detail, "Thread not found: not-a-thread"),
        Ok(()) => panic!("expected thread_not_found after exhausting the listing"),
    }
}

#[tokio::test]
async fn second_turn_fails_fast_while_one_is_in_flight() {
    let (session, _launcher) = started_session(FakeBehavior::default()).await;

    let stalled = match session.send_turn(None, "please [stall]", None).await {
        Ok(t) => t,
        Err(e) => panic!("send_turn failed: {e}"),
    };

    match session.send_turn(None, "another", None).await {
        Err(err) => assert_eq!(err.kind, crate::error::ErrorKind::Capacity),
        Ok(_) => panic!("expected busy error"),
    }

    // Dropping the handle releases the lock for the next turn.
    drop(stalled);
    assert!(session.send_turn(None, "after drop", None).await.is_ok());
}

#[tokio::test]
async fn send_user_message_fallback_on_method_not_found() {
    let behavior = FakeBehavior { reject_send_user_turn: true, ..FakeBehavior::default() };
    let (session, _launcher) = started_session(behavior).await;

    let mut turn = match session.send_turn(None, "fallback please", None).await {
        Ok(t) => t,
        Err(e) => panic!("send_turn failed: {e}"),
    };
    while turn.next_event().await.is_some() {}
    assert!(turn.saw_terminal());
}

#[tokio::test]
async fn failed_turn_reports_reason() {
    let (session, _launcher) = started_session(FakeBehavior::default()).await;

    let mut turn = match session.send_turn(None, "do the thing [fail]", None).await {
        Ok(t) => t,
        Err(e) => panic!("send_turn failed: {e}"),
    };

    let mut failure = None;
    while let Some(note) = turn.next_event().await {
        if let Some(reason) = note.failure_reason() {
            failure = Some(reason);
        }
    }
    assert_eq!(failure.as_deref(), Some("simulated agent failure"));
}

#[tokio::test]
async fn teardown_marks_dead_and_fails_later_calls() {
    let (session, launcher) = started_session(FakeBehavior::default()).await;
    session.teardown(Duration::from_millis(200)).await;
    assert!(session.is_dead());
    assert!(session.call("listConversations", None).await.is_err());

    // The fake observed EOF on its pipe.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launcher.terminated_count(), 1);
}

#[tokio::test]
async fn probe_clears_pending_flag() {
    let (session, _launcher) = started_session(FakeBehavior::default()).await;
    session.flag_probe();
    assert!(session.probe_pending());
    assert!(session.probe().await.is_ok());
    assert!(!session.probe_pending());
}
