// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use berth_core::domain::config::BerthConfig;
use berth_core::domain::subsystem::ApiListener;
use berth_core::infrastructure::event_bus::{DomainEvent, EventBus};
use berth_core::presentation::protocol::{FrameStatus, Request, Response};
use berth_core::presentation::ApiServer;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector};
use serde_json::{json, Value};
use std::path::Path;
use tokio::net::UnixStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type Control = WebSocketStream<UnixStream>;

fn config(dir: &Path) -> BerthConfig {
    let mut config = BerthConfig::default();
    config.paths.api_socket = dir.join("run/api.sock");
    config.agent.requires_vm = false;
    config
}

async fn connect(socket: &Path) -> Control {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async("ws://localhost/cli", stream)
        .await
        .unwrap();
    ws
}

async fn request(ws: &mut Control, id: &str, action: &str, data: Value) {
    let frame = Request {
        id: id.to_string(),
        action: action.to_string(),
        data,
    };
    let text = serde_json::to_string(&frame).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn next_frame(ws: &mut Control) -> Response {
    loop {
        let message = ws.next().await.unwrap().unwrap();
        if let Ok(text) = message.to_text() {
            if !text.is_empty() {
                return serde_json::from_str(text).unwrap();
            }
        }
    }
}

#[tokio::test]
async fn test_watch_streams_start_sync_done() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("project");
    std::fs::create_dir_all(project.join("src")).unwrap();
    std::fs::write(project.join("package.json"), "{}").unwrap();
    std::fs::write(project.join("src/index.js"), "").unwrap();

    let config = config(dir.path());
    let events = EventBus::new(16);
    let mut receiver = events.subscribe();
    let server = ApiServer::new(events);
    server.listen(&config).await.unwrap();

    let mut ws = connect(&config.paths.api_socket).await;
    let host = project.to_string_lossy().into_owned();
    request(
        &mut ws,
        "a1",
        "watch",
        json!({"host_folder": host, "guest_folder": "/home/docker/share/project"}),
    )
    .await;

    let statuses: Vec<_> = [
        next_frame(&mut ws).await,
        next_frame(&mut ws).await,
        next_frame(&mut ws).await,
    ]
    .into_iter()
    .map(|frame| {
        assert_eq!(frame.id, "a1");
        (frame.status, frame.data)
    })
    .collect();

    assert_eq!(statuses[0].0, FrameStatus::Start);
    assert_eq!(statuses[1], (FrameStatus::Sync, json!({"files": 2})));
    assert_eq!(statuses[2].0, FrameStatus::Done);
    assert_eq!(server.watchers().list().len(), 1);
    assert!(matches!(receiver.recv().await.unwrap(), DomainEvent::Watcher(_)));

    request(&mut ws, "a2", "watchers", Value::Null).await;
    let listed = next_frame(&mut ws).await;
    assert_eq!(listed.status, FrameStatus::Done);
    assert_eq!(listed.data.as_array().map(Vec::len), Some(1));

    server.close().await.unwrap();
    assert!(!config.paths.api_socket.exists());
}

#[tokio::test]
async fn test_watch_missing_folder_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let server = ApiServer::new(EventBus::new(4));
    server.listen(&config).await.unwrap();

    let mut ws = connect(&config.paths.api_socket).await;
    request(
        &mut ws,
        "b1",
        "watch",
        json!({"host_folder": "/definitely/not/here", "guest_folder": "/share"}),
    )
    .await;

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.status, FrameStatus::Fail);
    assert!(frame.err.unwrap().contains("does not exist"));

    request(&mut ws, "b2", "unwatch", json!({"host_folder": "/definitely/not/here"})).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.id, "b2");
    assert_eq!(frame.status, FrameStatus::Fail);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_configs_side_channel() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.namespace = "devbox".to_string();
    let server = ApiServer::new(EventBus::new(4));
    server.listen(&config).await.unwrap();

    let client: Client<UnixConnector, Full<Bytes>> = Client::unix();
    let uri: hyper::Uri = hyperlocal::Uri::new(&config.paths.api_socket, "/configs").into();
    let response = client.get(uri).await.unwrap();
    assert!(response.status().is_success());

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let flat: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(flat["namespace"], "devbox");
    assert_eq!(flat["agent:requires_vm"], false);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_listen_replaces_stale_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    std::fs::create_dir_all(config.paths.api_socket.parent().unwrap()).unwrap();
    std::fs::write(&config.paths.api_socket, "stale").unwrap();

    let server = ApiServer::new(EventBus::new(4));
    server.listen(&config).await.unwrap();
    assert!(server.is_listening());

    let _ws = connect(&config.paths.api_socket).await;
    server.close().await.unwrap();
    assert!(!server.is_listening());
}
