// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local backend: fork commands on this machine, admission by machine
//! capacity.

use crate::error::EngineError;
use crate::messages::{Backend, ControllerMsg, JobFailure};
use async_trait::async_trait;
use muster_core::{ItemKey, Requirements};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

struct LocalShared {
    cores: u32,
    ram_mb: u32,
    used: Mutex<(u32, u32)>,
    /// Cancellation senders for running commands, buffered so cancel never
    /// blocks against an already-finished command.
    cancels: Mutex<HashMap<ItemKey, mpsc::Sender<()>>>,
}

impl LocalShared {
    fn try_reserve(&self, req: &Requirements) -> bool {
        let mut used = self.used.lock();
        let free_cores = self.cores.saturating_sub(used.0);
        let free_ram = self.ram_mb.saturating_sub(used.1);
        if (req.cores > 0 && free_cores < req.cores) || (req.ram_mb > 0 && free_ram < req.ram_mb)
        {
            return false;
        }
        used.0 += req.cores;
        used.1 += req.ram_mb;
        true
    }

    fn give_back(&self, req: &Requirements) {
        let mut used = self.used.lock();
        used.0 = used.0.saturating_sub(req.cores);
        used.1 = used.1.saturating_sub(req.ram_mb);
    }
}

/// Runs commands directly via the shell.
pub struct LocalBackend {
    msg_tx: mpsc::Sender<ControllerMsg>,
    shared: Arc<LocalShared>,
}

impl LocalBackend {
    pub fn new(msg_tx: mpsc::Sender<ControllerMsg>) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let ram_mb = detect_ram_mb().unwrap_or(u32::MAX);
        Self::with_capacity(msg_tx, cores, ram_mb)
    }

    /// Explicit capacity, for constrained deployments and tests.
    pub fn with_capacity(msg_tx: mpsc::Sender<ControllerMsg>, cores: u32, ram_mb: u32) -> Self {
        Self {
            msg_tx,
            shared: Arc::new(LocalShared {
                cores,
                ram_mb,
                used: Mutex::new((0, 0)),
                cancels: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn can_fit(&self, req: &Requirements) -> usize {
        let used = self.shared.used.lock();
        let free = [
            (self.shared.cores.saturating_sub(used.0), req.cores),
            (self.shared.ram_mb.saturating_sub(used.1), req.ram_mb),
        ];
        let mut can: Option<u32> = None;
        for (avail, need) in free {
            if need == 0 {
                continue;
            }
            let n = avail / need;
            can = Some(can.map_or(n, |c| c.min(n)));
        }
        can.map(|n| n as usize).unwrap_or(usize::MAX)
    }

    async fn dispatch(
        &self,
        key: ItemKey,
        cmd: String,
        req: Requirements,
    ) -> Result<(), EngineError> {
        if !self.shared.try_reserve(&req) {
            return Err(EngineError::Backend("no local capacity".to_string()));
        }

        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        self.shared.cancels.lock().insert(key.clone(), cancel_tx);

        let mut child = match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.shared.give_back(&req);
                self.shared.cancels.lock().remove(&key);
                return Err(EngineError::Backend(format!("spawn failed: {}", e)));
            }
        };

        tracing::info!(key = %key, cmd, "forked local command");

        let stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let msg_tx = self.msg_tx.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let cancelled;
            let status = tokio::select! {
                status = child.wait() => {
                    cancelled = false;
                    status
                }
                _ = cancel_rx.recv() => {
                    cancelled = true;
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            let stderr = stderr_task.await.unwrap_or_default();

            let outcome = match status {
                Ok(s) if s.success() && !cancelled => Ok(()),
                Ok(s) => Err(JobFailure {
                    reason: if cancelled {
                        "killed".to_string()
                    } else {
                        format!("exited with {}: {}", s.code().unwrap_or(-1), stderr.trim())
                    },
                    ssh_unavailable: false,
                }),
                Err(e) => Err(JobFailure {
                    reason: format!("wait failed: {}", e),
                    ssh_unavailable: false,
                }),
            };

            shared.give_back(&req);
            shared.cancels.lock().remove(&key);
            let _ = msg_tx.send(ControllerMsg::JobDone { key, host: None, outcome }).await;
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

/// MemTotal from /proc/meminfo, in MB.
fn detect_ram_mb() -> Option<u32> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return u32::try_from(kb / 1024).ok();
        }
    }
    None
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
