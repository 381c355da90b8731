// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host hardware flavors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A (virtual) hardware configuration a provider can spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
    pub cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
}

impl Flavor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, cores: u32, ram_mb: u32, disk_gb: u32) -> Self {
        Self { id: id.into(), name: name.into(), cores, ram_mb, disk_gb }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} cores, {} MB, {} GB)", self.name, self.cores, self.ram_mb, self.disk_gb)
    }
}
