// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Berth Core
//!
//! Container runtime wrapper, system runner and the agent's API listener.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Everything the `berth` CLI and agent daemon share

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
