// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Progress notifications
//!
//! Long-running operations report intermediate steps through a
//! [`ProgressSink`]. A sink is a cheap cloneable handle; the no-op sink
//! discards everything.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    NotRunning,
    Starting,
    Started,
    AlreadyRunning,
    Stopping,
    Stopped,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotRunning => "not_running",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::AlreadyRunning => "already_running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status {
        status: AgentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    /// A daemon sub-step (`api`, `vm`, `balancer`, ...)
    Context { context: String, message: String },
    Sync { status: Value },
    Pull {
        system: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        status: String,
    },
    Provision { system: String },
    Wait {
        system: String,
        host: String,
        port: u16,
    },
    KillService { system: String },
    StopService { system: String },
    Stopped { id: String },
}

impl ProgressEvent {
    pub fn status(status: AgentStatus) -> Self {
        Self::Status {
            status,
            pid: None,
            data: None,
        }
    }

    pub fn context(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            message: message.into(),
        }
    }
}

type Notify = dyn Fn(ProgressEvent) + Send + Sync;

#[derive(Clone, Default)]
pub struct ProgressSink {
    inner: Option<Arc<Notify>>,
}

impl ProgressSink {
    pub fn new(notify: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            inner: Some(Arc::new(notify)),
        }
    }

    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Sink feeding an unbounded channel; events sent after the receiver is
    /// dropped are discarded.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (sink, rx)
    }

    pub fn notify(&self, event: ProgressEvent) {
        if let Some(notify) = &self.inner {
            notify(event);
        }
    }

    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink")
            .field("noop", &self.is_noop())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let event = ProgressEvent::Status {
            status: AgentStatus::AlreadyRunning,
            pid: Some(42),
            data: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "already_running");
        assert_eq!(json["pid"], 42);
        assert!(json.get("data").is_none());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.notify(ProgressEvent::status(AgentStatus::Starting));
        sink.notify(ProgressEvent::status(AgentStatus::Started));
        drop(sink);

        assert_eq!(rx.recv().await, Some(ProgressEvent::status(AgentStatus::Starting)));
        assert_eq!(rx.recv().await, Some(ProgressEvent::status(AgentStatus::Started)));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_noop_sink_discards() {
        let sink = ProgressSink::noop();
        assert!(sink.is_noop());
        sink.notify(ProgressEvent::context("api", "ignored"));
    }
}
