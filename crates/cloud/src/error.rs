// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for hosts and placement.

use thiserror::Error;

/// The provider could not do what was asked of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("provider: {0}")]
pub struct ProviderError(pub String);

/// Errors from host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// The host was destroyed, either explicitly or by the idle countdown,
    /// while the operation was in flight.
    #[error("host has been destroyed")]
    HostDestroyed,

    /// SSH could not be established within the retry budget.
    #[error("ssh unavailable: {0}")]
    SshUnavailable(String),

    /// The remote command ran and exited non-zero.
    #[error("remote command exited with status {exit_code}: {stderr}")]
    RemoteCommandFailed { exit_code: i32, stderr: String },

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the placement engine.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// Nothing fits right now. When the provider can grow, a new host has
    /// been requested in the background; retry with backoff.
    #[error("no host has capacity right now")]
    NoCapacityNow,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
