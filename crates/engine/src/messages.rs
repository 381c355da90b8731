// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The driver <-> controller protocol.
//!
//! One typed channel in each direction: the driver sends [`ControllerReq`],
//! the controller (or a backend acting as its own controller) answers with
//! [`ControllerMsg`]. Completion, host health and feasibility all arrive as
//! variants on the same channel, so there is no per-message task fan-out.

use crate::error::EngineError;
use async_trait::async_trait;
use muster_core::{ItemKey, Requirements};

/// Requests from the driver to the controller.
#[derive(Debug)]
pub enum ControllerReq {
    /// Could a command with these requirements ever be scheduled?
    /// Answered by [`ControllerMsg::FeasibilityReply`] with the same id.
    Feasibility { id: u64, req: Requirements },
    /// Start the command somewhere and watch it to termination.
    Spawn { key: ItemKey, cmd: String, req: Requirements },
    /// Stop a previously spawned command.
    Cancel { key: ItemKey },
}

/// Why a dispatched command did not succeed.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub reason: String,
    /// The host could not be reached over SSH. Two of these in a row from
    /// the same host get it quarantined (driver policy).
    pub ssh_unavailable: bool,
}

/// Messages from the controller to the driver.
#[derive(Debug)]
pub enum ControllerMsg {
    /// A dispatched command finished.
    JobDone {
        key: ItemKey,
        /// Host the command ran on, when the backend knows one.
        host: Option<String>,
        outcome: Result<(), JobFailure>,
    },
    /// The controller observed a host misbehaving.
    HostBad { host_id: String },
    /// Answer to [`ControllerReq::Feasibility`].
    FeasibilityReply { id: u64, feasible: bool },
    /// A pod reached termination. Abnormal exits leave the pod in place
    /// for inspection.
    PodTerminated { key: ItemKey, normal: bool, error: Option<String> },
}

/// Where commands actually run.
///
/// Backends receive dispatches and report completion as [`ControllerMsg`]s
/// on the driver's channel.
#[async_trait]
pub trait Backend: Send + Sync {
    /// How many copies of a command with these requirements could run
    /// concurrently right now. Zero means "not now"; the driver retries.
    async fn can_fit(&self, req: &Requirements) -> usize;

    /// Start the command. Completion arrives later as `JobDone` or
    /// `PodTerminated`.
    async fn dispatch(
        &self,
        key: ItemKey,
        cmd: String,
        req: Requirements,
    ) -> Result<(), EngineError>;

    /// Stop a dispatched command, if it is still running.
    async fn cancel(&self, key: &ItemKey) -> Result<(), EngineError>;

    /// Offer a controller message to the backend first. Returns true when
    /// the backend consumed it (e.g. a feasibility reply it was waiting
    /// for).
    fn absorb(&self, msg: &ControllerMsg) -> bool {
        let _ = msg;
        false
    }
}
