// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client failures and the process exit codes they map to.
//!
//! Commands return these instead of calling `std::process::exit()`
//! directly; `main()` owns process termination.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    /// Selector misuse: missing or conflicting flags.
    #[error("{0}")]
    Usage(String),

    /// Input that could not be read or parsed.
    #[error("{0}")]
    BadInput(String),

    /// The request was fine but selected nothing.
    #[error("no matching jobs found")]
    NoMatches,

    /// The manager refused or failed the request.
    #[error("manager: {0}")]
    Manager(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) => 2,
            CliError::BadInput(_) | CliError::NoMatches | CliError::Manager(_) => 1,
        }
    }
}
