// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Queue(#[from] muster_queue::QueueError),

    #[error("backend: {0}")]
    Backend(String),

    /// The controller side of the message channel is gone.
    #[error("controller unavailable")]
    ControllerGone,
}
