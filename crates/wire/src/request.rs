// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Requests the client sends to the manager.

use muster_core::Essence;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Kill the running commands matching these essences.
    Kill { essences: Vec<Essence> },
    /// Kill every running command.
    KillAll,
    /// Kill the running commands in the repeat group with this identifier.
    KillGroup { identifier: String },
}
