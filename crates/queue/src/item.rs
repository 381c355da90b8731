// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue items and their state tags.

use muster_core::ItemKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Which sub-queue an item currently lives in.
///
/// Exactly one sub-queue holds an item at any time, and this tag always
/// agrees with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    /// Waiting for its ready-at time
    Delay,
    /// Eligible for Reserve
    Ready,
    /// Reserved, running somewhere, subject to TTR
    Run,
    /// Set aside after failure or TTR expiry; only Kick brings it back
    Bury,
    /// Waiting on other items to finish first
    Dependent,
}

impl ItemState {
    /// Single-letter tag used in listings and logs.
    pub fn tag(self) -> char {
        match self {
            ItemState::Delay => 'd',
            ItemState::Ready => 'r',
            ItemState::Run => 'u',
            ItemState::Bury => 'b',
            ItemState::Dependent => 'w',
        }
    }
}

muster_core::simple_display! {
    ItemState {
        Delay => "delay",
        Ready => "ready",
        Run => "run",
        Bury => "bury",
        Dependent => "dependent",
    }
}

/// What to do when an added key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddPolicy {
    /// Fail with `KeyExists`
    #[default]
    Reject,
    /// Drop the existing item and insert the new one
    Replace,
}

/// Everything the caller supplies when adding an item.
#[derive(Debug, Clone)]
pub struct ItemDef {
    pub key: ItemKey,
    pub group: String,
    pub data: serde_json::Value,
    pub priority: u8,
    pub delay: Duration,
    pub ttr: Duration,
    pub depends_on: Vec<ItemKey>,
}

impl ItemDef {
    pub fn new(key: impl Into<ItemKey>, group: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            group: group.into(),
            data: serde_json::Value::Null,
            priority: 0,
            delay: Duration::ZERO,
            ttr: Duration::from_secs(60),
            depends_on: Vec::new(),
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn ttr(mut self, ttr: Duration) -> Self {
        self.ttr = ttr;
        self
    }

    pub fn depends_on(mut self, keys: impl IntoIterator<Item = ItemKey>) -> Self {
        self.depends_on = keys.into_iter().collect();
        self
    }
}

/// A tracked unit of work.
///
/// Owned exclusively by the queue; callers see clones and refer back to the
/// item by key.
#[derive(Debug, Clone)]
pub struct Item {
    pub key: ItemKey,
    pub group: String,
    pub data: serde_json::Value,
    pub priority: u8,
    pub delay: Duration,
    pub ttr: Duration,
    /// Times this item has been reserved.
    pub attempts: u32,
    /// Keys that must leave the queue before this item becomes ready.
    pub unresolved: BTreeSet<ItemKey>,
    pub state: ItemState,
    pub created: Instant,
    /// When a delayed item becomes eligible.
    pub ready_at: Instant,
    /// TTR deadline while reserved.
    pub release_at: Instant,
    /// Monotonic insertion number, the FIFO tie-break.
    pub(crate) seq: u64,
}

impl Item {
    pub(crate) fn from_def(def: ItemDef, now: Instant, seq: u64) -> Self {
        Self {
            key: def.key,
            group: def.group,
            data: def.data,
            priority: def.priority,
            delay: def.delay,
            ttr: def.ttr,
            attempts: 0,
            unresolved: BTreeSet::new(),
            state: ItemState::Ready,
            created: now,
            ready_at: now + def.delay,
            release_at: now,
            seq,
        }
    }
}

/// Fields an `update` call may change. `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub priority: Option<u8>,
    pub delay: Option<Duration>,
    pub ttr: Option<Duration>,
    pub data: Option<serde_json::Value>,
}

#[cfg(test)]
#[path = "item_tests.rs"]
mod tests;
