// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! muster-queue: the in-memory queue that tracks every job through its
//! lifecycle.
//!
//! An item moves delay → ready → run → {removed | bury | delay(retry)},
//! with a parallel dependent → ready path for items whose dependency set
//! drains. Each sub-queue is a heap ordered by a different field of the
//! item; a single mutex guards all of them plus the dependency index, and
//! two housekeeping threads advance the delay and run heads on schedule.

mod error;
mod item;
mod queue;
mod sub_queue;

pub use error::QueueError;
pub use item::{AddPolicy, Item, ItemDef, ItemState, ItemUpdate};
pub use queue::{Queue, Stats};
pub use sub_queue::{SortKey, SubQueue};
