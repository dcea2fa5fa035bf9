// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Agent daemon lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AgentEvent {
    Started {
        pid: u32,
        started_at: DateTime<Utc>,
    },
    Stopped {
        pid: u32,
        /// 0 on a clean shutdown
        code: i32,
        stopped_at: DateTime<Utc>,
    },
}

/// File-sync watcher registrations handled by the API listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatcherEvent {
    Watched {
        host_folder: PathBuf,
        guest_folder: String,
        files: u64,
        watched_at: DateTime<Utc>,
    },
    Unwatched {
        host_folder: PathBuf,
        guest_folder: String,
        unwatched_at: DateTime<Utc>,
    },
}
