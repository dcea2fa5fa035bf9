// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Control channel to the agent
//!
//! One persistent WebSocket over the agent's unix socket carries every
//! control request. Requests submitted before the connection is up are
//! buffered and flushed in submission order once it is; each request gets
//! its correlation id when it actually goes out. Replies are routed by id to
//! the [`Exchange`] that sent the request, which may receive several frames
//! before it is closed.
//!
//! Single-shot fetches that need no push semantics go through
//! [`HttpClient`] on the same socket.

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use uuid::Uuid;

use berth_core::presentation::protocol::{Request, Response, CONTROL_PATH};

type Socket = WebSocketStream<UnixStream>;
type Attempt = Shared<BoxFuture<'static, Result<(), ChannelError>>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Cannot connect to the agent at {socket}: {message}")]
    Connect { socket: String, message: String },

    #[error("Control channel is closed")]
    Closed,

    #[error("Agent connection dropped before the exchange finished")]
    Disconnected,

    #[error("Malformed control frame: {0}")]
    Protocol(String),

    #[error("Agent request {path} failed: {message}")]
    Http { path: String, message: String },
}

impl ChannelError {
    fn connect(socket: &Path, message: impl ToString) -> Self {
        Self::Connect {
            socket: socket.display().to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

enum Link {
    Disconnected,
    Connecting(Attempt),
    Connected(Connection),
    Closed,
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    generation: u64,
}

struct Pending {
    seq: u64,
    action: String,
    data: Value,
    reply: oneshot::Sender<Result<Exchange, ChannelError>>,
}

struct State {
    link: Link,
    buffer: VecDeque<Pending>,
    subscriptions: HashMap<String, mpsc::UnboundedSender<Response>>,
    next_seq: u64,
    generation: u64,
}

struct Inner {
    socket: PathBuf,
    state: Mutex<State>,
}

impl Inner {
    fn disconnected(&self, generation: u64) {
        let mut state = self.state.lock();
        let current = match &state.link {
            Link::Connected(connection) => connection.generation == generation,
            _ => false,
        };
        if current {
            debug!("Control channel disconnected");
            state.link = Link::Disconnected;
            // Dropping the senders ends every open exchange.
            state.subscriptions.clear();
        }
    }

    fn deliver(&self, frame: Response) {
        let mut state = self.state.lock();
        let id = frame.id.clone();
        let delivered = match state.subscriptions.get(&id) {
            Some(frames) => frames.send(frame).is_ok(),
            None => {
                debug!("No exchange waiting for frame {}", id);
                return;
            }
        };
        if !delivered {
            state.subscriptions.remove(&id);
        }
    }
}

/// Persistent, id-correlated connection to the agent
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<Inner>,
    http: HttpClient,
}

impl ControlChannel {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        let socket = socket.into();
        Self {
            http: HttpClient::new(socket.clone()),
            inner: Arc::new(Inner {
                socket,
                state: Mutex::new(State {
                    link: Link::Disconnected,
                    buffer: VecDeque::new(),
                    subscriptions: HashMap::new(),
                    next_seq: 0,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.inner.socket
    }

    pub fn state(&self) -> ChannelState {
        match self.inner.state.lock().link {
            Link::Disconnected => ChannelState::Disconnected,
            Link::Connecting(_) => ChannelState::Connecting,
            Link::Connected(_) => ChannelState::Connected,
            Link::Closed => ChannelState::Closed,
        }
    }

    /// Number of exchanges still waiting for frames
    pub fn registered(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Connect, or join the attempt already in flight.
    pub async fn init(&self) -> Result<(), ChannelError> {
        let attempt = {
            let mut state = self.inner.state.lock();
            match &state.link {
                Link::Closed => return Err(ChannelError::Closed),
                Link::Connected(_) => return Ok(()),
                Link::Connecting(attempt) => attempt.clone(),
                Link::Disconnected => {
                    let socket = self.inner.socket.clone();
                    let attempt = tokio::spawn(connect(self.inner.clone()))
                        .map(move |joined| {
                            joined.unwrap_or_else(|e| Err(ChannelError::connect(&socket, e)))
                        })
                        .boxed()
                        .shared();
                    state.link = Link::Connecting(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Send `action` and open an exchange for its replies.
    ///
    /// While disconnected the request is buffered and a connection attempt
    /// started. If that attempt fails and the request is still buffered it is
    /// dropped, and the whole send is repeated up to `retry` more times.
    pub async fn send(&self, action: &str, data: Value, retry: u32) -> Result<Exchange, ChannelError> {
        let mut remaining = retry;
        loop {
            let (seq, reply) = {
                let mut state = self.inner.state.lock();
                match state.link {
                    Link::Closed => return Err(ChannelError::Closed),
                    Link::Connected(_) => return open_exchange(&self.inner, &mut state, action, data),
                    Link::Disconnected | Link::Connecting(_) => {}
                }

                let (reply, receiver) = oneshot::channel();
                state.next_seq += 1;
                let seq = state.next_seq;
                state.buffer.push_back(Pending {
                    seq,
                    action: action.to_string(),
                    data: data.clone(),
                    reply,
                });
                (seq, receiver)
            };

            match self.init().await {
                Ok(()) => return reply.await.unwrap_or(Err(ChannelError::Disconnected)),
                // A later attempt by another sender already flushed this request.
                Err(_) if !self.withdraw(seq) => {
                    return reply.await.unwrap_or(Err(ChannelError::Disconnected));
                }
                Err(e) => {
                    if remaining == 0 {
                        warn!("Failed to send '{}' to the agent: {}", action, e);
                        return Err(e);
                    }
                    remaining -= 1;
                    debug!("Retrying '{}' ({} attempts left)", action, remaining);
                }
            }
        }
    }

    /// Take a buffered request back; false once a connection flushed it.
    fn withdraw(&self, seq: u64) -> bool {
        let mut state = self.inner.state.lock();
        let buffered = state.buffer.len();
        state.buffer.retain(|pending| pending.seq != seq);
        state.buffer.len() < buffered
    }

    /// Fetch a JSON document over the side channel.
    pub async fn fetch(&self, path: &str) -> Result<Value, ChannelError> {
        self.http.get(path).await
    }

    /// Close the connection. Closing twice is harmless.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        let previous = std::mem::replace(&mut state.link, Link::Closed);
        if let Link::Connected(connection) = previous {
            connection.reader.abort();
            debug!("Control channel closed");
        }
        state.subscriptions.clear();
        for pending in state.buffer.drain(..) {
            let _ = pending.reply.send(Err(ChannelError::Closed));
        }
    }
}

/// Replies to one request, in arrival order
#[derive(Debug)]
pub struct Exchange {
    id: String,
    frames: mpsc::UnboundedReceiver<Response>,
    channel: Weak<Inner>,
}

impl Exchange {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next frame for this exchange; fails once the connection is gone.
    pub async fn next(&mut self) -> Result<Response, ChannelError> {
        self.frames.recv().await.ok_or(ChannelError::Disconnected)
    }

    /// Stop receiving frames for this exchange.
    pub fn close(self) {}
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.state.lock().subscriptions.remove(&self.id);
        }
    }
}

fn open_exchange(
    inner: &Arc<Inner>,
    state: &mut State,
    action: &str,
    data: Value,
) -> Result<Exchange, ChannelError> {
    let Link::Connected(connection) = &state.link else {
        return Err(ChannelError::Disconnected);
    };

    let id = correlation_id(&state.subscriptions);
    let request = Request {
        id: id.clone(),
        action: action.to_string(),
        data,
    };
    let text = serde_json::to_string(&request).map_err(|e| ChannelError::Protocol(e.to_string()))?;
    connection
        .outbound
        .send(Message::Text(text.into()))
        .map_err(|_| ChannelError::Disconnected)?;

    let (frames, receiver) = mpsc::unbounded_channel();
    state.subscriptions.insert(id.clone(), frames);
    debug!("Sent '{}' as {}", action, id);
    Ok(Exchange {
        id,
        frames: receiver,
        channel: Arc::downgrade(inner),
    })
}

fn correlation_id(taken: &HashMap<String, mpsc::UnboundedSender<Response>>) -> String {
    loop {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        if !taken.contains_key(&id) {
            return id;
        }
    }
}

async fn connect(inner: Arc<Inner>) -> Result<(), ChannelError> {
    let result = open_socket(&inner.socket).await;

    let mut state = inner.state.lock();
    if matches!(state.link, Link::Closed) {
        return Err(ChannelError::Closed);
    }
    let socket = match result {
        Ok(socket) => socket,
        Err(e) => {
            state.link = Link::Disconnected;
            return Err(e);
        }
    };

    state.generation += 1;
    let generation = state.generation;
    let (sink, stream) = socket.split();
    let (outbound, queue) = mpsc::unbounded_channel();
    tokio::spawn(write_frames(sink, queue));
    let reader = tokio::spawn(read_frames(Arc::downgrade(&inner), stream, generation));
    state.link = Link::Connected(Connection {
        outbound,
        reader,
        generation,
    });
    debug!("Control channel connected to {}", inner.socket.display());

    // Exchanges whose sender gave up deregister on drop, which needs the lock.
    let mut orphaned = Vec::new();
    while let Some(pending) = state.buffer.pop_front() {
        let exchange = open_exchange(&inner, &mut state, &pending.action, pending.data);
        if let Err(Ok(exchange)) = pending.reply.send(exchange) {
            orphaned.push(exchange);
        }
    }
    drop(state);
    drop(orphaned);
    Ok(())
}

async fn open_socket(path: &Path) -> Result<Socket, ChannelError> {
    let stream = UnixStream::connect(path)
        .await
        .map_err(|e| ChannelError::connect(path, e))?;
    let url = format!("ws://localhost{}", CONTROL_PATH);
    let (socket, _) = tokio_tungstenite::client_async(url, stream)
        .await
        .map_err(|e| ChannelError::connect(path, e))?;
    Ok(socket)
}

async fn write_frames(
    mut sink: SplitSink<Socket, Message>,
    mut queue: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = queue.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!("Control channel write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_frames(inner: Weak<Inner>, mut stream: SplitStream<Socket>, generation: u64) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Response>(text.as_str()) {
                Ok(frame) => match inner.upgrade() {
                    Some(inner) => inner.deliver(frame),
                    None => return,
                },
                Err(e) => warn!("Ignoring malformed agent frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Control channel read failed: {}", e);
                break;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.disconnected(generation);
    }
}

/// Request/response client for the agent's HTTP endpoints
#[derive(Clone)]
pub struct HttpClient {
    socket: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl HttpClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            client: Client::unix(),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value, ChannelError> {
        let http_error = |message: String| ChannelError::Http {
            path: path.to_string(),
            message,
        };

        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket, path).into();
        let response = self
            .client
            .get(uri)
            .await
            .map_err(|e| http_error(e.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| http_error(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(http_error(format!("HTTP {}", status)));
        }
        serde_json::from_slice(&body).map_err(|e| ChannelError::Protocol(e.to_string()))
    }
}
