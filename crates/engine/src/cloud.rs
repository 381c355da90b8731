// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cloud backend: place each command on a provider host and run it over
//! SSH.
//!
//! Placement reserves the resources; the command's completion releases
//! them. A placement miss surfaces as a dispatch error, which the driver
//! turns into retry-with-backoff while the placement engine grows in the
//! background.

use crate::error::EngineError;
use crate::messages::{Backend, ControllerMsg, JobFailure};
use async_trait::async_trait;
use muster_cloud::{HostError, Placement};
use muster_core::{ItemKey, Requirements};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

struct CloudShared {
    /// Cancellation senders for in-flight commands, buffered so cancel
    /// never blocks against an already-finished command.
    cancels: Mutex<HashMap<ItemKey, mpsc::Sender<()>>>,
}

/// Runs commands on placement-managed hosts.
pub struct CloudBackend {
    msg_tx: mpsc::Sender<ControllerMsg>,
    placement: Arc<Placement>,
    shared: Arc<CloudShared>,
}

impl CloudBackend {
    pub fn new(msg_tx: mpsc::Sender<ControllerMsg>, placement: Arc<Placement>) -> Self {
        Self {
            msg_tx,
            placement,
            shared: Arc::new(CloudShared { cancels: Mutex::new(HashMap::new()) }),
        }
    }
}

fn failure_from(error: HostError) -> JobFailure {
    match error {
        HostError::RemoteCommandFailed { exit_code, stderr } => JobFailure {
            reason: format!("exited with {}: {}", exit_code, stderr.trim()),
            ssh_unavailable: false,
        },
        HostError::SshUnavailable(message) => {
            JobFailure { reason: format!("ssh unavailable: {}", message), ssh_unavailable: true }
        }
        other => JobFailure { reason: other.to_string(), ssh_unavailable: false },
    }
}

#[async_trait]
impl Backend for CloudBackend {
    async fn can_fit(&self, req: &Requirements) -> usize {
        self.placement.can_fit(req)
    }

    async fn dispatch(
        &self,
        key: ItemKey,
        cmd: String,
        req: Requirements,
    ) -> Result<(), EngineError> {
        let (host, token) = self
            .placement
            .place(&req)
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        self.shared.cancels.lock().insert(key.clone(), cancel_tx);

        tracing::info!(key = %key, host = %host.id(), cmd, "dispatching to host");

        let msg_tx = self.msg_tx.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = host.run_cmd(&cmd, false) => match result {
                    Ok(_) => Ok(()),
                    Err(error) => Err(failure_from(error)),
                },
                _ = cancel_rx.recv() => {
                    // The remote side notices its own death later; resources
                    // and the queue slot come back now.
                    Err(JobFailure { reason: "killed".to_string(), ssh_unavailable: false })
                }
            };

            shared.cancels.lock().remove(&key);
            let host_id = host.id().to_string();
            token.release();
            let _ = msg_tx
                .send(ControllerMsg::JobDone { key, host: Some(host_id), outcome })
                .await;
        });
        Ok(())
    }

    async fn cancel(&self, key: &ItemKey) -> Result<(), EngineError> {
        match self.shared.cancels.lock().get(key) {
            Some(cancel) => {
                let _ = cancel.try_send(());
                Ok(())
            }
            None => Err(EngineError::Backend(format!("{} is not running here", key))),
        }
    }
}

#[cfg(test)]
#[path = "cloud_tests.rs"]
mod tests;
