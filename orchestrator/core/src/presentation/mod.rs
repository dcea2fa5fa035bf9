// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`berth-core`)
//!
//! Agent-side surface the CLI talks to. No container work happens here.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP + WebSocket (Axum) over a unix socket | Health, configuration side channel, control connection |
//! | [`protocol`] | JSON | Request/response frames shared with the CLI |

pub mod api;
pub mod protocol;

pub use api::{ApiServer, Watcher, WatcherRegistry};
