// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! muster-core: shared leaf types for the muster workflow runner.

pub mod macros;

pub mod essence;
pub mod requirements;

pub use essence::{Essence, ItemKey};
pub use requirements::Requirements;
