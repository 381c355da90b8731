// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue error taxonomy.

use crate::item::ItemState;
use muster_core::ItemKey;
use thiserror::Error;

/// Errors from queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("an item with key {0} already exists")]
    KeyExists(ItemKey),

    #[error("item {0} not found")]
    NotFound(ItemKey),

    #[error("item {key} is in state {state}, cannot {op}")]
    WrongState {
        key: ItemKey,
        state: ItemState,
        op: &'static str,
    },

    #[error("adding {0} would create a dependency cycle")]
    DependencyCycle(ItemKey),

    #[error("queue has been destroyed")]
    Closed,

    #[error("timed out waiting for a ready item")]
    Timeout,
}
