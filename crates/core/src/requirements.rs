// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-command resource requirements.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What a command needs from whatever host ends up running it.
///
/// Requirements double as the scheduling-fairness bucket: commands with
/// equal requirements share a group, and the driver reserves work per group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirements {
    pub cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    /// Expected runtime; informs TTR when queueing.
    pub time: Duration,
}

impl Requirements {
    pub fn new(cores: u32, ram_mb: u32, disk_gb: u32, time: Duration) -> Self {
        Self { cores, ram_mb, disk_gb, time }
    }

    /// Canonical group string for the scheduling bucket these requirements
    /// define. Stable across runs, safe to use as a map key or in logs.
    pub fn group(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.cores,
            self.ram_mb,
            self.disk_gb,
            self.time.as_secs()
        )
    }
}

impl Default for Requirements {
    fn default() -> Self {
        Self { cores: 1, ram_mb: 0, disk_gb: 0, time: Duration::from_secs(3600) }
    }
}

impl fmt::Display for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} core(s), {} MB RAM, {} GB disk, {}s",
            self.cores,
            self.ram_mb,
            self.disk_gb,
            self.time.as_secs()
        )
    }
}

#[cfg(test)]
#[path = "requirements_tests.rs"]
mod tests;
