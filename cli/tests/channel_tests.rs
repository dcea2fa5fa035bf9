// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use berth_cli::daemon::channel::{ChannelError, ChannelState, ControlChannel};
use berth_core::presentation::protocol::{FrameStatus, Request, Response};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

type Script = Arc<dyn Fn(&Request) -> Vec<Response> + Send + Sync>;

/// Minimal agent: records requests and answers them from `script`.
/// A request with action `hangup` closes the connection instead.
fn fake_agent(socket: &Path, script: Script) -> mpsc::UnboundedReceiver<Request> {
    let listener = UnixListener::bind(socket).unwrap();
    let (seen, requests) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen.clone();
            let script = script.clone();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let request: Request = serde_json::from_str(text.as_str()).unwrap();
                    let _ = seen.send(request.clone());
                    if request.action == "hangup" {
                        return;
                    }
                    for frame in script(&request) {
                        let text = serde_json::to_string(&frame).unwrap();
                        ws.send(Message::Text(text.into())).await.unwrap();
                    }
                }
            });
        }
    });
    requests
}

fn echo() -> Script {
    Arc::new(|request: &Request| {
        vec![Response::new(
            request.id.clone(),
            FrameStatus::Done,
            json!(request.action),
        )]
    })
}

#[tokio::test]
async fn test_buffered_requests_flush_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("api.sock");
    let mut requests = fake_agent(&socket, echo());
    let channel = ControlChannel::new(&socket);
    assert_eq!(channel.state(), ChannelState::Disconnected);

    let sends = ["first", "second", "third"]
        .into_iter()
        .map(|action| channel.send(action, Value::Null, 0));
    let exchanges: Vec<_> = futures::future::join_all(sends)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(channel.state(), ChannelState::Connected);

    let mut order = vec![];
    for _ in 0..3 {
        order.push(requests.recv().await.unwrap());
    }
    assert_eq!(
        order.iter().map(|r| r.action.as_str()).collect::<Vec<_>>(),
        vec!["first", "second", "third"]
    );

    let mut ids: Vec<_> = order.iter().map(|r| r.id.clone()).collect();
    assert!(ids.iter().all(|id| id.len() == 8));
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    for (mut exchange, action) in exchanges.into_iter().zip(["first", "second", "third"]) {
        let frame = exchange.next().await.unwrap();
        assert_eq!(frame.id, exchange.id());
        assert_eq!(frame.data, json!(action));
    }
    assert_eq!(channel.registered(), 0);
}

#[tokio::test]
async fn test_multi_frame_exchange_until_done() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("api.sock");
    let _requests = fake_agent(
        &socket,
        Arc::new(|request: &Request| {
            vec![
                Response::new(request.id.clone(), FrameStatus::Start, Value::Null),
                Response::new(request.id.clone(), FrameStatus::Sync, json!({"files": 1})),
                // Frames for other ids are not ours
                Response::new("ffffffff", FrameStatus::Done, Value::Null),
                Response::new(request.id.clone(), FrameStatus::Sync, json!({"files": 2})),
                Response::new(request.id.clone(), FrameStatus::Done, Value::Null),
            ]
        }),
    );
    let channel = ControlChannel::new(&socket);

    let mut exchange = channel.send("watch", Value::Null, 0).await.unwrap();
    let mut statuses = vec![];
    loop {
        let frame = exchange.next().await.unwrap();
        statuses.push(frame.status);
        if frame.status.is_terminal() {
            break;
        }
    }
    assert_eq!(
        statuses,
        vec![
            FrameStatus::Start,
            FrameStatus::Sync,
            FrameStatus::Sync,
            FrameStatus::Done
        ]
    );
    assert_eq!(channel.registered(), 1);
    exchange.close();
    assert_eq!(channel.registered(), 0);
}

#[tokio::test]
async fn test_fail_frame_carries_agent_error() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("api.sock");
    let _requests = fake_agent(
        &socket,
        Arc::new(|request: &Request| vec![Response::fail(request.id.clone(), "boom")]),
    );
    let channel = ControlChannel::new(&socket);

    let mut exchange = channel.send("watch", Value::Null, 0).await.unwrap();
    let frame = exchange.next().await.unwrap();
    assert_eq!(frame.status, FrameStatus::Fail);
    assert_eq!(frame.err.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_dropped_connection_ends_exchange_and_reconnects() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("api.sock");
    let mut requests = fake_agent(&socket, echo());
    let channel = ControlChannel::new(&socket);

    let mut exchange = channel.send("hangup", Value::Null, 0).await.unwrap();
    assert_eq!(exchange.next().await.unwrap_err(), ChannelError::Disconnected);
    assert_eq!(requests.recv().await.unwrap().action, "hangup");

    for _ in 0..50 {
        if channel.state() == ChannelState::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(channel.registered(), 0);

    let mut exchange = channel.send("watchers", Value::Null, 0).await.unwrap();
    assert_eq!(exchange.next().await.unwrap().data, json!("watchers"));
}

#[tokio::test]
async fn test_send_after_agent_appears() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("api.sock");
    let channel = ControlChannel::new(&socket);

    let err = channel.send("watchers", Value::Null, 1).await.unwrap_err();
    assert!(matches!(err, ChannelError::Connect { .. }));

    let _requests = fake_agent(&socket, echo());
    let mut exchange = channel.send("watchers", Value::Null, 0).await.unwrap();
    assert_eq!(exchange.next().await.unwrap().status, FrameStatus::Done);

    channel.close();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(exchange.next().await.unwrap_err(), ChannelError::Disconnected);
}
