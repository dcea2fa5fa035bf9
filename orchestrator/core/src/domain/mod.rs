// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Systems, containers and the interfaces of the collaborators the agent
//! drives.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types and traits with no engine or transport dependency

pub mod config;
pub mod container;
pub mod events;
pub mod progress;
pub mod runtime;
pub mod subsystem;
pub mod system;
pub mod tracker;
