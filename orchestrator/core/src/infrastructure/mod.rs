// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod docker;
pub mod event_bus;
pub mod memory_engine;
pub mod net;
pub mod runtime;

pub use docker::DockerEngine;
pub use memory_engine::InMemoryEngine;
pub use runtime::ContainerRuntime;
