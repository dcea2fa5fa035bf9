// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod system_runner;

pub use system_runner::{
    DaemonOptions, ProvisionOptions, ShellOptions, ShellResult, StopOptions, SystemRunner,
};
