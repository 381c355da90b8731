// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The scheduler driver: drains the queue, checks feasibility, dispatches
//! commands and settles them as completions flow back.

use crate::error::EngineError;
use crate::messages::{Backend, ControllerMsg, JobFailure};
use muster_cloud::Placement;
use muster_core::{Essence, ItemKey, Requirements};
use muster_queue::{AddPolicy, ItemDef, ItemState, Queue, QueueError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Slack added to a requirement's expected runtime before the queue
/// presumes a reserved item lost.
const TTR_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// How often ready items are scanned for dispatch, in addition to the
    /// scan after every completion.
    pub tick: Duration,
    /// Reservations per item before it is buried instead of retried.
    pub max_attempts: u32,
    /// Delay applied when re-queueing a failed item.
    pub retry_backoff: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Binds the queue, the placement engine and a backend into a processing
/// loop.
pub struct Driver<B: Backend> {
    queue: Queue,
    backend: B,
    msg_rx: mpsc::Receiver<ControllerMsg>,
    /// Present in cloud mode; used to quarantine misbehaving hosts.
    placement: Option<Arc<Placement>>,
    config: DriverConfig,
    /// Requirements per scheduling group, keyed by the canonical group
    /// string.
    groups: Mutex<HashMap<String, Requirements>>,
    /// Consecutive SSH failures per host. Two in a row quarantines.
    ssh_strikes: HashMap<String, u32>,
}

impl<B: Backend> Driver<B> {
    pub fn new(
        queue: Queue,
        backend: B,
        msg_rx: mpsc::Receiver<ControllerMsg>,
        placement: Option<Arc<Placement>>,
        config: DriverConfig,
    ) -> Self {
        Self {
            queue,
            backend,
            msg_rx,
            placement,
            config,
            groups: Mutex::new(HashMap::new()),
            ssh_strikes: HashMap::new(),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Enqueue a command. The essence fingerprint is the item key, so a
    /// second submission of the same command is rejected while the first
    /// is still tracked.
    pub fn submit(
        &self,
        essence: &Essence,
        req: &Requirements,
        priority: u8,
        delay: Duration,
        depends_on: Vec<ItemKey>,
    ) -> Result<ItemKey, EngineError> {
        let key = essence.key();
        let def = ItemDef::new(key.clone(), req.group())
            .data(serde_json::json!({
                "cmd": essence.cmd,
                "cwd": essence.cwd,
                "mounts": essence.mounts,
            }))
            .priority(priority)
            .delay(delay)
            .ttr(req.time + TTR_GRACE)
            .depends_on(depends_on);
        self.queue.add(def, AddPolicy::Reject)?;
        self.groups.lock().insert(req.group(), req.clone());
        tracing::info!(key = %key, group = %req.group(), "submitted");
        Ok(key)
    }

    /// Stop the given jobs if they are currently running. Non-running jobs
    /// are left alone. Returns how many were signalled and the first error
    /// hit.
    pub async fn kill(&self, keys: &[ItemKey]) -> (usize, Option<EngineError>) {
        let mut killed = 0;
        let mut first_error = None;
        for key in keys {
            match self.queue.get(key) {
                Ok(item) if item.state == ItemState::Run => {
                    match self.backend.cancel(key).await {
                        Ok(()) => killed += 1,
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    }
                }
            }
        }
        (killed, first_error)
    }

    /// Process until shutdown is signalled or the controller hangs up.
    /// Destroys the queue on the way out, releasing any blocked reservers.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.dispatch_ready().await;
                }
                msg = self.msg_rx.recv() => {
                    match msg {
                        Some(msg) => {
                            self.handle(msg).await;
                            self.dispatch_ready().await;
                        }
                        None => {
                            tracing::warn!("controller channel closed, stopping driver");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.queue.destroy();
    }

    /// For each group with ready items, dispatch as many as the backend
    /// says can run.
    async fn dispatch_ready(&self) {
        let groups: Vec<(String, Requirements)> = self
            .groups
            .lock()
            .iter()
            .map(|(g, r)| (g.clone(), r.clone()))
            .collect();

        for (group, req) in groups {
            let can = self.backend.can_fit(&req).await;
            for _ in 0..can {
                let item = match self.queue.reserve(&group, Duration::ZERO) {
                    Ok(item) => item,
                    Err(QueueError::Timeout) => break,
                    Err(QueueError::Closed) => return,
                    Err(e) => {
                        tracing::warn!(group, error = %e, "reserve failed");
                        break;
                    }
                };

                let cmd = match item.data.get("cmd").and_then(|v| v.as_str()) {
                    Some(cmd) => cmd.to_string(),
                    None => {
                        tracing::error!(key = %item.key, "item has no command, burying");
                        let _ = self.queue.bury(&item.key);
                        continue;
                    }
                };

                if let Err(e) = self.backend.dispatch(item.key.clone(), cmd, req.clone()).await
                {
                    tracing::warn!(key = %item.key, error = %e, "dispatch failed, re-queueing");
                    let _ = self.queue.release(&item.key, Some(self.config.retry_backoff));
                    break;
                }
            }
        }
    }

    async fn handle(&mut self, msg: ControllerMsg) {
        if self.backend.absorb(&msg) {
            return;
        }
        match msg {
            ControllerMsg::JobDone { key, host, outcome } => {
                self.settle(key, host, outcome);
            }
            ControllerMsg::PodTerminated { key, normal, error } => {
                let outcome = if normal {
                    Ok(())
                } else {
                    Err(JobFailure {
                        reason: error.unwrap_or_else(|| "pod died abnormally".to_string()),
                        ssh_unavailable: false,
                    })
                };
                self.settle(key, None, outcome);
            }
            ControllerMsg::HostBad { host_id } => {
                self.quarantine(&host_id);
            }
            ControllerMsg::FeasibilityReply { id, .. } => {
                tracing::debug!(id, "feasibility reply with no waiter");
            }
        }
    }

    fn settle(&mut self, key: ItemKey, host: Option<String>, outcome: Result<(), JobFailure>) {
        match outcome {
            Ok(()) => {
                if let Some(host) = &host {
                    self.ssh_strikes.remove(host);
                }
                tracing::info!(key = %key, "command complete");
                if let Err(e) = self.queue.remove(&key) {
                    tracing::debug!(key = %key, error = %e, "completed item already gone");
                }
            }
            Err(failure) => {
                if failure.ssh_unavailable {
                    if let Some(host) = &host {
                        let strikes = self.ssh_strikes.entry(host.clone()).or_insert(0);
                        *strikes += 1;
                        if *strikes >= 2 {
                            tracing::warn!(host, "ssh unavailable twice in a row, quarantining");
                            self.quarantine(host);
                            self.ssh_strikes.remove(host);
                        }
                    }
                } else if let Some(host) = &host {
                    self.ssh_strikes.remove(host);
                }

                let attempts = match self.queue.get(&key) {
                    Ok(item) => item.attempts,
                    Err(e) => {
                        tracing::debug!(key = %key, error = %e, "failed item already gone");
                        return;
                    }
                };
                if attempts >= self.config.max_attempts {
                    tracing::warn!(
                        key = %key,
                        attempts,
                        reason = failure.reason,
                        "out of attempts, burying"
                    );
                    let _ = self.queue.bury(&key);
                } else {
                    tracing::info!(
                        key = %key,
                        attempts,
                        reason = failure.reason,
                        "will retry with backoff"
                    );
                    let _ = self.queue.release(&key, Some(self.config.retry_backoff));
                }
            }
        }
    }

    fn quarantine(&self, host_id: &str) {
        let Some(placement) = &self.placement else {
            return;
        };
        for host in placement.hosts() {
            if host.id() == host_id {
                host.gone_bad(None);
                return;
            }
        }
        tracing::debug!(host = host_id, "cannot quarantine unknown host");
    }
}

#[cfg(test)]
#[path = "driver_tests.rs"]
mod tests;
