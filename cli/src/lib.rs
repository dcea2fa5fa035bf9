// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! berth CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Agent daemon lifecycle, control channel client and the
//!   commands built on them

pub mod commands;
pub mod daemon;
pub mod manifest;
