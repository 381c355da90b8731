// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Manager replies.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Outcome of a kill request: how many jobs were eligible, how many
    /// were actually signalled, and the first error if any.
    Killed {
        eligible: usize,
        killed: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_error: Option<String>,
    },
    /// The request failed outright.
    Error { message: String },
}
