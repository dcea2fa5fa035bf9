// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Usage telemetry collaborator
//!
//! Tracking is best-effort: callers log failures and never propagate them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::domain::config::TrackingConfig;
use crate::domain::container::Container;

/// Images built locally carry this marker in their name
pub const BUILD_IMAGE_MARKER: &str = "berthbuild";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrackedImage {
    Docker { name: String },
    Dockerfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingData {
    pub event_type: Option<String>,
    pub action: String,
    pub manifest_id: Option<String>,
    pub image: TrackedImage,
}

impl TrackingData {
    pub fn for_container(container: &Container, action: &str) -> Self {
        let image = if container.image.contains(BUILD_IMAGE_MARKER) {
            TrackedImage::Dockerfile
        } else {
            TrackedImage::Docker {
                name: container.image.clone(),
            }
        };

        Self {
            event_type: container.annotations.kind().map(str::to_string),
            action: action.to_string(),
            manifest_id: container.annotations.manifest_id().map(str::to_string),
            image,
        }
    }
}

#[async_trait]
pub trait Tracker: Send + Sync {
    async fn check_permission(&self) -> bool;

    /// Record one event; a non-zero code means the record was rejected.
    async fn track(&self, kind: &str, data: &TrackingData) -> anyhow::Result<i32>;
}

/// Tracker that never asks for or records anything
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledTracker;

#[async_trait]
impl Tracker for DisabledTracker {
    async fn check_permission(&self) -> bool {
        false
    }

    async fn track(&self, _kind: &str, _data: &TrackingData) -> anyhow::Result<i32> {
        Ok(0)
    }
}

/// Tracker that records events as structured log lines under the
/// `berth::tracking` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracker;

#[async_trait]
impl Tracker for LogTracker {
    async fn check_permission(&self) -> bool {
        true
    }

    async fn track(&self, kind: &str, data: &TrackingData) -> anyhow::Result<i32> {
        let payload = serde_json::to_string(data)?;
        info!(target: "berth::tracking", kind, %payload, "tracked");
        Ok(0)
    }
}

/// The tracker selected by `tracking.enabled`.
pub fn tracker_for(config: &TrackingConfig) -> Arc<dyn Tracker> {
    if config.enabled {
        Arc::new(LogTracker)
    } else {
        Arc::new(DisabledTracker)
    }
}
