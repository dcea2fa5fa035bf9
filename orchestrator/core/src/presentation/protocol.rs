// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Control protocol frames
//!
//! Requests travel client to agent as `{id, action, data}`; responses come
//! back as `{id, status, data, err}`. One request may be answered by several
//! frames sharing its id: `start`, any number of `sync`, then `done` or
//! `fail`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Endpoint path of the persistent control connection
pub const CONTROL_PATH: &str = "/cli";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    Start,
    Sync,
    Done,
    Fail,
}

impl FrameStatus {
    /// Whether no further frames follow for the same id
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Fail)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub status: FrameStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Response {
    pub fn new(id: impl Into<String>, status: FrameStatus, data: Value) -> Self {
        Self {
            id: id.into(),
            status,
            data,
            err: None,
        }
    }

    pub fn fail(id: impl Into<String>, err: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: FrameStatus::Fail,
            data: Value::Null,
            err: Some(err.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub host_folder: String,
    pub guest_folder: String,
    #[serde(default)]
    pub opts: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnwatchRequest {
    pub host_folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_folder: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_watch_request_opts_default_to_null() {
        let request: WatchRequest =
            serde_json::from_value(json!({"host_folder": "/src/app", "guest_folder": "/share/app"}))
                .unwrap();
        assert_eq!(request.opts, Value::Null);

        let request: WatchRequest = serde_json::from_value(json!({
            "host_folder": "/src/app",
            "guest_folder": "/share/app",
            "opts": {"except": ["node_modules"]}
        }))
        .unwrap();
        assert_eq!(request.opts["except"][0], "node_modules");
    }

    #[test]
    fn test_response_wire_shape() {
        let frame = Response::new("0a1b2c3d", FrameStatus::Sync, json!({"files": 3}));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"id": "0a1b2c3d", "status": "sync", "data": {"files": 3}})
        );

        let fail: Response =
            serde_json::from_str(r#"{"id":"x","status":"fail","err":"no such folder"}"#).unwrap();
        assert_eq!(fail.err.as_deref(), Some("no such folder"));
        assert!(fail.status.is_terminal());
        assert!(!FrameStatus::Start.is_terminal());
    }
}
