// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent API listener
//!
//! Serves the control protocol on a unix socket:
//!
//! - `GET /health`  liveness check
//! - `GET /configs` flattened agent configuration (side channel)
//! - `GET /cli`     WebSocket carrying [`Request`]/[`Response`] frames

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::SinkExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::domain::config::BerthConfig;
use crate::domain::events::WatcherEvent;
use crate::domain::subsystem::{ApiListener, SubsystemError};
use crate::infrastructure::event_bus::EventBus;
use crate::presentation::protocol::{
    FrameStatus, Request, Response, UnwatchRequest, WatchRequest, CONTROL_PATH,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watcher {
    pub host_folder: String,
    pub guest_folder: String,
    pub files: u64,
    pub since: DateTime<Utc>,
    /// Sync options passed through from the client
    #[serde(default)]
    pub opts: Value,
}

/// Active file-sync watchers keyed by host folder
#[derive(Clone, Default)]
pub struct WatcherRegistry {
    inner: Arc<Mutex<BTreeMap<String, Watcher>>>,
}

impl WatcherRegistry {
    pub fn insert(&self, watcher: Watcher) {
        self.inner
            .lock()
            .insert(watcher.host_folder.clone(), watcher);
    }

    pub fn remove(&self, host_folder: &str, guest_folder: Option<&str>) -> Option<Watcher> {
        let mut watchers = self.inner.lock();
        let matches = watchers.get(host_folder).is_some_and(|watcher| {
            guest_folder.is_none_or(|guest| guest == watcher.guest_folder)
        });
        if matches {
            watchers.remove(host_folder)
        } else {
            None
        }
    }

    pub fn list(&self) -> Vec<Watcher> {
        self.inner.lock().values().cloned().collect()
    }
}

struct ApiState {
    config: BerthConfig,
    watchers: WatcherRegistry,
    events: EventBus,
    closing: watch::Receiver<bool>,
}

struct Running {
    socket: PathBuf,
    closing: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ApiServer {
    events: EventBus,
    watchers: WatcherRegistry,
    running: Mutex<Option<Running>>,
}

impl ApiServer {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            watchers: WatcherRegistry::default(),
            running: Mutex::new(None),
        }
    }

    pub fn watchers(&self) -> &WatcherRegistry {
        &self.watchers
    }

    pub fn is_listening(&self) -> bool {
        self.running.lock().is_some()
    }
}

#[async_trait]
impl ApiListener for ApiServer {
    async fn listen(&self, config: &BerthConfig) -> Result<(), SubsystemError> {
        if self.is_listening() {
            return Ok(());
        }

        let socket = config.paths.api_socket.clone();
        if let Some(parent) = socket.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // A previous agent that died hard leaves its socket behind.
        if socket.exists() {
            tokio::fs::remove_file(&socket).await?;
        }

        let listener = UnixListener::bind(&socket)
            .map_err(|e| SubsystemError::Api(format!("bind {}: {}", socket.display(), e)))?;
        info!("API listening on {}", socket.display());

        let (closing, closing_rx) = watch::channel(false);
        let state = Arc::new(ApiState {
            config: config.clone(),
            watchers: self.watchers.clone(),
            events: self.events.clone(),
            closing: closing_rx.clone(),
        });

        let mut shutdown = closing_rx;
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, router(state)).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(e) = server.await {
                error!("API server failed: {}", e);
            }
        });

        *self.running.lock() = Some(Running {
            socket,
            closing,
            task,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), SubsystemError> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };

        let _ = running.closing.send(true);
        if tokio::time::timeout(SHUTDOWN_GRACE, running.task).await.is_err() {
            warn!("API server did not shut down within {:?}", SHUTDOWN_GRACE);
        }

        match tokio::fs::remove_file(&running.socket).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("API listener closed");
        Ok(())
    }
}

fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/configs", get(configs))
        .route(CONTROL_PATH, get(control))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn configs(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.config.flatten())
}

async fn control(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ApiState>) {
    let mut closing = state.closing.clone();
    loop {
        let message = tokio::select! {
            message = socket.recv() => message,
            _ = closing.changed() => break,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Control connection error: {}", e);
                break;
            }
        };

        let request: Request = match serde_json::from_str(text.as_str()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring malformed control frame: {}", e);
                continue;
            }
        };

        debug!("Control request {} ({})", request.id, request.action);
        if let Err(e) = dispatch(&state, &mut socket, request).await {
            debug!("Control connection closed while replying: {}", e);
            break;
        }
    }
    let _ = socket.close().await;
}

async fn dispatch(
    state: &ApiState,
    socket: &mut WebSocket,
    request: Request,
) -> Result<(), axum::Error> {
    let Request { id, action, data } = request;
    match action.as_str() {
        "watch" => watch(state, socket, &id, data).await,
        "unwatch" => unwatch(state, socket, &id, data).await,
        "watchers" => {
            let watchers = serde_json::to_value(state.watchers.list()).unwrap_or_default();
            send(socket, Response::new(id, FrameStatus::Done, watchers)).await
        }
        other => send(socket, Response::fail(id, format!("Unknown action '{}'", other))).await,
    }
}

async fn watch(
    state: &ApiState,
    socket: &mut WebSocket,
    id: &str,
    data: Value,
) -> Result<(), axum::Error> {
    let request: WatchRequest = match serde_json::from_value(data) {
        Ok(request) => request,
        Err(e) => return send(socket, Response::fail(id, format!("Invalid watch request: {}", e))).await,
    };

    let host = PathBuf::from(&request.host_folder);
    if !host.is_dir() {
        let err = format!("Folder {} does not exist", request.host_folder);
        return send(socket, Response::fail(id, err)).await;
    }

    let folders = json!({
        "host_folder": request.host_folder,
        "guest_folder": request.guest_folder,
    });
    send(socket, Response::new(id, FrameStatus::Start, folders.clone())).await?;

    let files = match count_files(host.clone()).await {
        Ok(files) => files,
        Err(e) => return send(socket, Response::fail(id, e)).await,
    };
    send(socket, Response::new(id, FrameStatus::Sync, json!({ "files": files }))).await?;

    state.watchers.insert(Watcher {
        host_folder: request.host_folder.clone(),
        guest_folder: request.guest_folder.clone(),
        files,
        since: Utc::now(),
        opts: request.opts,
    });
    state.events.publish_watcher_event(WatcherEvent::Watched {
        host_folder: host,
        guest_folder: request.guest_folder,
        files,
        watched_at: Utc::now(),
    });

    send(socket, Response::new(id, FrameStatus::Done, folders)).await
}

async fn unwatch(
    state: &ApiState,
    socket: &mut WebSocket,
    id: &str,
    data: Value,
) -> Result<(), axum::Error> {
    let request: UnwatchRequest = match serde_json::from_value(data) {
        Ok(request) => request,
        Err(e) => return send(socket, Response::fail(id, format!("Invalid unwatch request: {}", e))).await,
    };

    match state
        .watchers
        .remove(&request.host_folder, request.guest_folder.as_deref())
    {
        Some(watcher) => {
            state.events.publish_watcher_event(WatcherEvent::Unwatched {
                host_folder: PathBuf::from(&watcher.host_folder),
                guest_folder: watcher.guest_folder,
                unwatched_at: Utc::now(),
            });
            send(socket, Response::new(id, FrameStatus::Done, Value::Null)).await
        }
        None => {
            let err = format!("Folder {} is not being watched", request.host_folder);
            send(socket, Response::fail(id, err)).await
        }
    }
}

async fn count_files(root: PathBuf) -> Result<u64, String> {
    tokio::task::spawn_blocking(move || walk_files(&root))
        .await
        .map_err(|e| format!("File scan aborted: {}", e))
}

fn walk_files(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .count() as u64
}

async fn send(socket: &mut WebSocket, frame: Response) -> Result<(), axum::Error> {
    let text = serde_json::to_string(&frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}
