// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// Split a duplex endpoint and attach a transport to it.
fn connect(peer: DuplexStream) -> Arc<RpcTransport> {
    let (r, w) = tokio::io::split(peer);
    RpcTransport::connect(r, w)
}

/// Peer task that answers every request with `{"echo": <method>}`.
fn spawn_echo_peer(peer: DuplexStream) {
    let (r, mut w) = tokio::io::split(peer);
    tokio::spawn(async move {
        let mut lines = BufReader::new(r).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let req: serde_json::Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let reply = json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "result": {"echo": req["method"]},
            });
            let mut out = reply.to_string().into_bytes();
            out.push(b'\n');
            if w.write_all(&out).await.is_err() {
                break;
            }
        }
    });
}

#[tokio::test]
async fn call_round_trip() {
    let (client, server) = tokio::io::duplex(4096);
    spawn_echo_peer(server);
    let transport = connect(client);

    let result = match transport.call("initialize", Some(json!({"x": 1}))).await {
        Ok(v) => v,
        Err(e) => panic!("call failed: {e}"),
    };
    assert_eq!(result["echo"], "initialize");
}

#[tokio::test]
async fn concurrent_calls_each_get_exactly_one_completion() {
    let (client, server) = tokio::io::duplex(65536);
    spawn_echo_peer(server);
    let transport = connect(client);

    let mut handles = Vec::new();
    for i in 0..32 {
        let t = Arc::clone(&transport);
        handles.push(tokio::spawn(async move {
            t.call(&format!("method{i}"), None).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = match handle.await {
            Ok(Ok(v)) => v,
            other => panic!("call {i} failed: {other:?}"),
        };
        assert_eq!(result["echo"], format!("method{i}"));
    }
}

#[tokio::test]
async fn rpc_error_object_is_surfaced() {
    let (client, server) = tokio::io::duplex(4096);
    let (r, mut w) = tokio::io::split(server);
    tokio::spawn(async move {
        let mut lines = BufReader::new(r).lines();
        if let Ok(Some(line)) = lines.next_line().await {
            let req: serde_json::Value = serde_json::from_str(&line).unwrap_or_default();
            let reply = json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "error": {"code": -32601, "message": "method not found"},
            });
            let _ = w.write_all(format!("{reply}\n").as_bytes()).await;
        }
    });
    let transport = connect(client);

    match transport.call("sendUserTurn", None).await {
        Err(err) => {
            assert!(err.is_method_not_found(), "unexpected error: {err}");
        }
        Ok(v) => panic!("expected error, got {v}"),
    }
}

#[tokio::test]
async fn reader_death_fails_pending_with_transport_error() {
    let (client, server) = tokio::io::duplex(4096);
    let transport = connect(client);

    let t = Arc::clone(&transport);
    let call = tokio::spawn(async move { t.call("initialize", None).await });

    // Let the request land, then kill the peer without replying.
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(server);

    match call.await {
        Ok(Err(CallError::Transport { .. })) => {}
        other => panic!("expected transport failure, got {other:?}"),
    }
    assert!(transport.is_closed());

    // Subsequent calls fail fast.
    match transport.call("ping", None).await {
        Err(CallError::Transport { .. }) => {}
        other => panic!("expected transport failure, got {other:?}"),
    }
}

#[tokio::test]
async fn notifications_fan_out_in_arrival_order() {
    let (client, server) = tokio::io::duplex(65536);
    let (_r, mut w) = tokio::io::split(server);
    let transport = connect(client);

    let mut sub_a = transport.subscribe_conversation("a");
    let mut sub_all = transport.subscribe(|_| true);

    for i in 0..6 {
        let conv = if i % 2 == 0 { "a" } else { "b" };
        let note = json!({
            "jsonrpc": "2.0",
            "method": "item/agentMessage/delta",
            "params": {"conversationId": conv, "seq": i},
        });
        w.write_all(format!("{note}\n").as_bytes()).await.ok();
    }

    // sub_a sees only conversation "a", in order.
    for expected in [0, 2, 4] {
        let note = match sub_a.recv().await {
            Some(n) => n,
            None => panic!("subscription closed early"),
        };
        assert_eq!(note.params["seq"], expected);
        assert_eq!(note.conversation_id(), Some("a"));
    }

    // sub_all sees everything, in arrival order.
    for expected in 0..6 {
        let note = match sub_all.recv().await {
            Some(n) => n,
            None => panic!("subscription closed early"),
        };
        assert_eq!(note.params["seq"], expected);
    }
}

#[tokio::test]
async fn unknown_response_id_and_garbage_are_not_fatal() {
    let (client, server) = tokio::io::duplex(4096);
    let (r, mut w) = tokio::io::split(server);
    let transport = connect(client);

    // Noise first: unknown id, then an unparsable line.
    w.write_all(b"{\"jsonrpc\":\"2.0\",\"id\":999,\"result\":{}}\n").await.ok();
    w.write_all(b"this is not json\n").await.ok();

    // The transport keeps working afterwards.
    tokio::spawn(async move {
        let mut lines = BufReader::new(r).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let req: serde_json::Value = serde_json::from_str(&line).unwrap_or_default();
            if req.get("id").is_some() {
                let reply = json!({"jsonrpc": "2.0", "id": req["id"], "result": "pong"});
                let _ = w.write_all(format!("{reply}\n").as_bytes()).await;
            }
        }
    });

    let result = match transport.call("ping", None).await {
        Ok(v) => v,
        Err(e) => panic!("call failed: {e}"),
    };
    assert_eq!(result, json!("pong"));
}

#[tokio::test]
async fn dropped_subscriber_is_pruned_and_does_not_block_the_reader() {
    let (client, server) = tokio::io::duplex(65536);
    let (_r, mut w) = tokio::io::split(server);
    let transport = connect(client);

    let sub_dead = transport.subscribe_conversation("a");
    let mut sub_live = transport.subscribe_conversation("a");
    drop(sub_dead);

    let note = json!({
        "jsonrpc": "2.0",
        "method": "turn.started",
        "params": {"conversationId": "a"},
    });
    w.write_all(format!("{note}\n").as_bytes()).await.ok();

    let got = match sub_live.recv().await {
        Some(n) => n,
        None => panic!("live subscription closed"),
    };
    assert_eq!(message::method_slug(&got.method), "turn.started");
}

#[tokio::test]
async fn close_terminates_subscriber_streams() {
    let (client, _server) = tokio::io::duplex(4096);
    let transport = connect(client);
    let mut sub = transport.subscribe(|_| true);

    transport.close(Duration::from_millis(100)).await;
    assert!(sub.recv().await.is_none());
    assert!(transport.is_closed());
}
