// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resource-aware placement: which host runs the next command.
//!
//! First-fit over hosts in creation order. Deterministic and cheap; a
//! best-fit variant would pack tighter but make placement depend on load
//! ordering.

use crate::error::PlacementError;
use crate::host::{Host, HostConfig};
use crate::provider::Provider;
use crate::ssh::SshConfig;
use muster_core::Requirements;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Resources reserved on a host by a successful placement. Call
/// [`AllocationToken::release`] when the command finishes.
#[must_use = "allocated resources leak unless released"]
pub struct AllocationToken {
    host: Arc<Host>,
    cores: u32,
    ram_mb: u32,
    disk_gb: u32,
}

impl AllocationToken {
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Return the reserved resources to the host. Going idle may arm the
    /// host's destruction countdown.
    pub fn release(self) {
        self.host.release(self.cores, self.ram_mb, self.disk_gb);
    }
}

/// Owns every known host and answers placement queries.
pub struct Placement {
    hosts: Mutex<Vec<Arc<Host>>>,
    provider: Arc<dyn Provider>,
    /// Login user for hosts the provider spawns for us.
    host_user: String,
    /// TTD applied to newly spawned hosts.
    host_ttd: Duration,
    ssh: SshConfig,
    /// Requirement groups with a grow request already in flight, so a burst
    /// of NoCapacityNow answers asks for one host, not many.
    growing: Mutex<HashSet<String>>,
}

impl Placement {
    pub fn new(
        provider: Arc<dyn Provider>,
        host_user: impl Into<String>,
        host_ttd: Duration,
        ssh: SshConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(Vec::new()),
            provider,
            host_user: host_user.into(),
            host_ttd,
            ssh,
            growing: Mutex::new(HashSet::new()),
        })
    }

    /// Adopt an existing host (startup from persisted records, or a test).
    pub fn add_host(&self, host: Arc<Host>) {
        self.hosts.lock().push(host);
    }

    /// Snapshot of all known hosts in creation order.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.lock().clone()
    }

    /// The most concurrent copies of a command with these requirements that
    /// any single usable host could run right now. Zero means nothing fits;
    /// whether that is permanent is the provider's business.
    pub fn can_fit(&self, req: &Requirements) -> usize {
        self.hosts
            .lock()
            .iter()
            .filter(|h| h.usable())
            .map(|h| h.has_space_for(req.cores, req.ram_mb, req.disk_gb))
            .max()
            .unwrap_or(0)
    }

    /// Reserve room for one command on the first host that fits.
    ///
    /// When nothing fits and the provider can grow, a new host is requested
    /// in the background and the caller gets `NoCapacityNow`; retry with
    /// backoff.
    pub fn place(
        self: &Arc<Self>,
        req: &Requirements,
    ) -> Result<(Arc<Host>, AllocationToken), PlacementError> {
        {
            let hosts = self.hosts.lock();
            for host in hosts.iter() {
                if !host.usable() {
                    continue;
                }
                if host.has_space_for(req.cores, req.ram_mb, req.disk_gb) >= 1 {
                    host.allocate(req.cores, req.ram_mb, req.disk_gb);
                    let token = AllocationToken {
                        host: Arc::clone(host),
                        cores: req.cores,
                        ram_mb: req.ram_mb,
                        disk_gb: req.disk_gb,
                    };
                    tracing::debug!(host = %host.id(), req = %req, "placed");
                    return Ok((Arc::clone(host), token));
                }
            }
        }

        if self.provider.can_spawn() {
            self.request_host(req);
        }
        Err(PlacementError::NoCapacityNow)
    }

    /// Ask the provider for a host able to run `req`, once per group at a
    /// time.
    fn request_host(self: &Arc<Self>, req: &Requirements) {
        let group = req.group();
        {
            let mut growing = self.growing.lock();
            if !growing.insert(group.clone()) {
                return;
            }
        }

        let placement = Arc::clone(self);
        let req = req.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tracing::info!(req = %req, "requesting a new host");
                    match placement.provider.spawn_server(&req).await {
                        Ok(record) => {
                            let host = Host::new(
                                HostConfig {
                                    record,
                                    user: placement.host_user.clone(),
                                    ttd: placement.host_ttd,
                                    ssh: placement.ssh.clone(),
                                },
                                Arc::clone(&placement.provider),
                            );
                            tracing::info!(host = %host.id(), "new host ready");
                            placement.add_host(host);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "host request failed");
                        }
                    }
                    placement.growing.lock().remove(&group);
                });
            }
            Err(_) => {
                // no runtime to grow on
                self.growing.lock().remove(&group);
            }
        }
    }
}

#[cfg(test)]
#[path = "placement_tests.rs"]
mod tests;
