// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-host lifecycle: resource accounting, idle destruction, cancellable
//! remote commands, quarantine and teardown.

use crate::error::HostError;
use crate::flavor::Flavor;
use crate::provider::Provider;
use crate::record::HostRecord;
pub use crate::ssh::{CmdOutput, SshClient, SshConfig};
use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

/// How a host is constructed from a provider record.
pub struct HostConfig {
    pub record: HostRecord,
    /// Login user for SSH.
    pub user: String,
    /// Idle time allowed before automatic destruction. Zero disables the
    /// countdown.
    pub ttd: Duration,
    pub ssh: SshConfig,
}

struct HostState {
    used_cores: u32,
    used_ram: u32,
    used_disk: u32,
    on_deathrow: bool,
    /// Bumped each time the countdown arms; cancellers echo the generation
    /// they observed so a late cancel cannot kill the next cycle.
    deathrow_gen: u64,
    destroyed: bool,
    gone_bad: bool,
    permanent_problem: Option<String>,
    next_cancel_id: u64,
    /// Outstanding remote commands, by cancel id. Buffered senders so
    /// destroy can fire-and-forget without a receiver race.
    cancel_run: HashMap<u64, mpsc::Sender<()>>,
    timezone: Option<FixedOffset>,
}

/// One provider-spawned machine.
///
/// Shared as `Arc<Host>`; the placement engine owns the collection, the
/// host holds only a provider back-reference used to notify destruction.
pub struct Host {
    id: String,
    name: String,
    ip: String,
    flavor: Flavor,
    /// Total usable disk, GB. May exceed the flavor's nominal disk when the
    /// provider attached an extra volume.
    disk: u32,
    ttd: Duration,
    user: String,
    ssh_config: SshConfig,
    created: Instant,
    provider: Arc<dyn Provider>,
    state: Mutex<HostState>,
    /// Lazily created, shared by all remote commands.
    ssh: tokio::sync::Mutex<Option<Arc<SshClient>>>,
    /// Carries the most recent cancelled deathrow generation.
    cancel_deathrow: watch::Sender<u64>,
}

impl Host {
    pub fn new(config: HostConfig, provider: Arc<dyn Provider>) -> Arc<Self> {
        let disk = config.record.flavor.disk_gb;
        let (cancel_deathrow, _) = watch::channel(0);
        Arc::new(Self {
            id: config.record.id,
            name: config.record.name,
            ip: config.record.ip,
            flavor: config.record.flavor,
            disk,
            ttd: config.ttd,
            user: config.user,
            ssh_config: config.ssh,
            created: Instant::now(),
            provider,
            state: Mutex::new(HostState {
                used_cores: 0,
                used_ram: 0,
                used_disk: 0,
                on_deathrow: false,
                deathrow_gen: 0,
                destroyed: false,
                gone_bad: false,
                permanent_problem: None,
                next_cancel_id: 0,
                cancel_run: HashMap::new(),
                timezone: None,
            }),
            ssh: tokio::sync::Mutex::new(None),
            cancel_deathrow,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Current (cores, RAM-MB, disk-GB) usage.
    pub fn used(&self) -> (u32, u32, u32) {
        let st = self.state.lock();
        (st.used_cores, st.used_ram, st.used_disk)
    }

    /// Record that resources are now in use. Cancels a pending idle
    /// destruction.
    pub fn allocate(&self, cores: u32, ram_mb: u32, disk_gb: u32) {
        let mut st = self.state.lock();
        st.used_cores = (st.used_cores + cores).min(self.flavor.cores);
        st.used_ram = (st.used_ram + ram_mb).min(self.flavor.ram_mb);
        st.used_disk = (st.used_disk + disk_gb).min(self.disk);
        tracing::debug!(
            host = %self.id,
            used_cores = st.used_cores,
            used_ram = st.used_ram,
            used_disk = st.used_disk,
            "allocated resources"
        );
        if st.on_deathrow {
            let _ = self.cancel_deathrow.send_replace(st.deathrow_gen);
        }
    }

    /// Record that resources have been freed. When the host goes fully
    /// idle and has a TTD, arms the destruction countdown.
    pub fn release(self: &Arc<Self>, cores: u32, ram_mb: u32, disk_gb: u32) {
        let armed = {
            let mut st = self.state.lock();
            st.used_cores = st.used_cores.saturating_sub(cores);
            st.used_ram = st.used_ram.saturating_sub(ram_mb);
            st.used_disk = st.used_disk.saturating_sub(disk_gb);
            tracing::debug!(
                host = %self.id,
                used_cores = st.used_cores,
                used_ram = st.used_ram,
                used_disk = st.used_disk,
                "released resources"
            );
            if st.used_cores == 0
                && self.ttd > Duration::ZERO
                && !st.on_deathrow
                && !st.destroyed
            {
                st.on_deathrow = true;
                st.deathrow_gen += 1;
                Some(st.deathrow_gen)
            } else {
                None
            }
        };

        if let Some(generation) = armed {
            let host = Arc::clone(self);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { host.deathrow(generation).await });
                }
                Err(_) => {
                    // no runtime to count down on
                    self.state.lock().on_deathrow = false;
                }
            }
        }
    }

    async fn deathrow(self: Arc<Self>, generation: u64) {
        let mut cancelled = self.cancel_deathrow.subscribe();
        // A cancel may have landed between arming and this task starting.
        if *cancelled.borrow() >= generation {
            self.state.lock().on_deathrow = false;
            return;
        }
        tracing::debug!(host = %self.id, ttd = ?self.ttd, "idle, counting down to destruction");

        let ttd = tokio::time::sleep(self.ttd);
        tokio::pin!(ttd);
        loop {
            tokio::select! {
                _ = &mut ttd => {
                    self.state.lock().on_deathrow = false;
                    tracing::info!(host = %self.id, "idle countdown elapsed, destroying");
                    if let Err(e) = self.destroy().await {
                        tracing::warn!(host = %self.id, error = %e, "idle destruction failed");
                    }
                    return;
                }
                changed = cancelled.changed() => {
                    if changed.is_err() || *cancelled.borrow() >= generation {
                        self.state.lock().on_deathrow = false;
                        tracing::debug!(host = %self.id, "idle destruction cancelled");
                        return;
                    }
                    // stale cancel from an earlier cycle; keep counting
                }
            }
        }
    }

    /// How many commands needing (cores, ram, disk) fit in the free space.
    /// Zero-requirement dimensions are ignored.
    pub fn has_space_for(&self, cores: u32, ram_mb: u32, disk_gb: u32) -> usize {
        let st = self.state.lock();
        let free = [
            (self.flavor.cores.saturating_sub(st.used_cores), cores),
            (self.flavor.ram_mb.saturating_sub(st.used_ram), ram_mb),
            (self.disk.saturating_sub(st.used_disk), disk_gb),
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

    /// Usable for new work: not destroyed and not quarantined.
    pub fn usable(&self) -> bool {
        let st = self.state.lock();
        !st.destroyed && !st.gone_bad
    }

    async fn ssh_client(&self) -> Result<Arc<SshClient>, HostError> {
        let mut guard = self.ssh.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(Arc::clone(client));
        }

        let key = self.provider.private_key().to_string();
        if key.is_empty() {
            return Err(HostError::SshUnavailable("provider has no ssh key".to_string()));
        }
        let addr = format!("{}:22", self.ip);
        let user = self.user.clone();
        let config = self.ssh_config.clone();
        let client = tokio::task::spawn_blocking(move || {
            SshClient::connect(&addr, &user, &key, &config)
        })
        .await
        .map_err(|e| HostError::SshUnavailable(e.to_string()))??;

        let client = Arc::new(client);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Run a command on the host.
    ///
    /// `background` detaches it under nohup and returns once the shell
    /// does. If the host is destroyed while the command runs, returns
    /// `HostDestroyed` immediately; the command task de-registers itself on
    /// every exit path, so neither it nor the session leaks.
    pub async fn run_cmd(&self, cmd: &str, background: bool) -> Result<CmdOutput, HostError> {
        if self.state.lock().destroyed {
            return Err(HostError::HostDestroyed);
        }
        let client = self.ssh_client().await?;

        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        let cancel_id = {
            let mut st = self.state.lock();
            if st.destroyed {
                return Err(HostError::HostDestroyed);
            }
            let id = st.next_cancel_id;
            st.next_cancel_id += 1;
            st.cancel_run.insert(id, cancel_tx);
            id
        };

        let command = if background {
            format!("sh -c 'nohup {} > /dev/null 2>&1 &'", cmd)
        } else {
            cmd.to_string()
        };

        let (result_tx, result_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _ = result_tx.send(client.exec(&command));
        });

        let outcome = tokio::select! {
            res = result_rx => match res {
                Ok(Ok(output)) if output.exit_code == 0 => Ok(output),
                Ok(Ok(output)) => Err(HostError::RemoteCommandFailed {
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                }),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(HostError::SshUnavailable("command task died".to_string())),
            },
            _ = cancel_rx.recv() => {
                tracing::debug!(host = %self.id, cmd, "remote command cancelled by destruction");
                Err(HostError::HostDestroyed)
            }
        };

        self.state.lock().cancel_run.remove(&cancel_id);
        outcome
    }

    /// Create the parent directories of a remote path. SFTP mkdir does not
    /// cascade, so this shells out to mkdir -p.
    pub async fn mk_dir(&self, dest: &str) -> Result<(), HostError> {
        if let Some(parent) = Path::new(dest).parent() {
            let dir = parent.to_string_lossy();
            if !dir.is_empty() && dir != "." {
                self.run_cmd(&format!("mkdir -p {}", dir), false).await?;
            }
        }
        Ok(())
    }

    /// Upload a local file to the given remote path.
    pub async fn upload_file(&self, source: &Path, dest: &str) -> Result<(), HostError> {
        let client = self.ssh_client().await?;
        self.mk_dir(dest).await?;
        let source = source.to_path_buf();
        let dest = dest.to_string();
        tokio::task::spawn_blocking(move || client.upload(&source, &dest))
            .await
            .map_err(|e| HostError::SshUnavailable(e.to_string()))?
    }

    /// Download a remote file; the local directory must already exist.
    pub async fn download_file(&self, source: &str, dest: &Path) -> Result<(), HostError> {
        let client = self.ssh_client().await?;
        let source = source.to_string();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || client.download(&source, &dest))
            .await
            .map_err(|e| HostError::SshUnavailable(e.to_string()))?
    }

    /// Create a remote file with the given content.
    pub async fn create_file(&self, content: &str, dest: &str) -> Result<(), HostError> {
        let client = self.ssh_client().await?;
        self.mk_dir(dest).await?;
        let content = content.to_string();
        let dest = dest.to_string();
        tokio::task::spawn_blocking(move || client.create(&content, &dest))
            .await
            .map_err(|e| HostError::SshUnavailable(e.to_string()))?
    }

    /// Upload a comma-separated list of files.
    ///
    /// Each entry is either a path used verbatim on both sides, or
    /// `local:remote`. A leading `~/` on the local side resolves against
    /// `HOME`; on the remote side it is rewritten to `./`. Entries missing
    /// locally are silently skipped. Uploaded files are chmod 600 and get
    /// their local mtime reproduced in the host's timezone.
    pub async fn copy_over(&self, files: &str) -> Result<(), HostError> {
        let timezone = self.time_zone().await?;

        for entry in files.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (local, remote) = match entry.split_once(':') {
                Some((l, r)) => (l.to_string(), r.to_string()),
                None => (entry.to_string(), entry.to_string()),
            };

            let local = tilde_to_home(&local);
            let meta = match std::fs::metadata(&local) {
                Ok(m) => m,
                Err(_) => continue,
            };

            let remote = match remote.strip_prefix("~/") {
                Some(rest) => format!("./{}", rest),
                None => remote,
            };

            self.upload_file(&local, &remote).await?;
            self.run_cmd(&format!("chmod 600 {}", remote), false).await?;

            let mtime: DateTime<Utc> = meta.modified()?.into();
            let stamp = mtime.with_timezone(&timezone).format("%Y%m%d%H%M.%S");
            self.run_cmd(&format!("touch -t {} {}", stamp, remote), false).await?;
        }
        Ok(())
    }

    /// The host's UTC offset, learned from `date +%z` and cached. Only the
    /// offset is meaningful, not the zone name.
    pub async fn time_zone(&self) -> Result<FixedOffset, HostError> {
        if let Some(tz) = self.state.lock().timezone {
            return Ok(tz);
        }
        let output = self.run_cmd("date +%z", false).await?;
        let tz = parse_utc_offset(output.stdout.trim()).ok_or_else(|| {
            HostError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("host returned unparseable utc offset {:?}", output.stdout.trim()),
            ))
        })?;
        self.state.lock().timezone = Some(tz);
        Ok(tz)
    }

    /// Quarantine the host so placement skips it. A permanent problem makes
    /// `not_bad` a no-op; use it when the host should stay up for manual
    /// inspection but never be reused.
    pub fn gone_bad(&self, permanent_problem: Option<&str>) {
        let mut st = self.state.lock();
        st.gone_bad = true;
        if let Some(problem) = permanent_problem {
            st.permanent_problem = Some(problem.to_string());
        }
        tracing::warn!(host = %self.id, problem = permanent_problem, "host quarantined");
    }

    /// Lift the quarantine, unless a permanent problem was recorded.
    pub fn not_bad(&self) {
        let mut st = self.state.lock();
        if st.permanent_problem.is_none() {
            st.gone_bad = false;
        }
    }

    pub fn is_bad(&self) -> bool {
        self.state.lock().gone_bad
    }

    pub fn permanent_problem(&self) -> Option<String> {
        self.state.lock().permanent_problem.clone()
    }

    pub fn destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Whether the host is on its idle-destruction countdown.
    pub fn on_deathrow(&self) -> bool {
        self.state.lock().on_deathrow
    }

    /// Tear the host down. Idempotent. Cancels a pending countdown, fires
    /// every outstanding remote-command cancellation exactly once, then
    /// notifies the provider. A provider error is swallowed when a
    /// follow-up check shows the host really is gone.
    pub async fn destroy(&self) -> Result<(), HostError> {
        {
            let mut st = self.state.lock();
            if st.destroyed {
                tracing::debug!(host = %self.id, "already destroyed");
                return Ok(());
            }
            if st.on_deathrow {
                let _ = self.cancel_deathrow.send_replace(st.deathrow_gen);
            }
            for cancel in st.cancel_run.values() {
                let _ = cancel.try_send(());
            }
            st.cancel_run.clear();
            st.destroyed = true;
            st.gone_bad = true;
        }
        tracing::info!(host = %self.id, "destroying host");

        match self.provider.destroy_server(&self.id).await {
            Ok(()) => Ok(()),
            Err(e) => match self.provider.check_server(&self.id).await {
                Ok(true) => Err(e.into()),
                // provider says it is gone anyway
                _ => Ok(()),
            },
        }
    }

    /// Whether the host is still usable: not destroyed and known to the
    /// provider, optionally confirming a fresh remote command succeeds.
    pub async fn alive(&self, check_ssh: bool) -> bool {
        if self.state.lock().destroyed {
            return false;
        }
        match self.provider.check_server(&self.id).await {
            Ok(true) => {}
            _ => return false,
        }
        if check_ssh {
            return self.run_cmd("true", false).await.is_ok();
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn test_register_cancel(&self) -> (u64, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let mut st = self.state.lock();
        let id = st.next_cancel_id;
        st.next_cancel_id += 1;
        st.cancel_run.insert(id, tx);
        (id, rx)
    }
}

/// Expand a leading `~/` against `HOME`.
fn tilde_to_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse a `date +%z` offset like `+0530` or `-0700`.
fn parse_utc_offset(s: &str) -> Option<FixedOffset> {
    let bytes = s.as_bytes();
    if bytes.len() != 5 {
        return None;
    }
    let sign = match bytes[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let hours: i32 = s.get(1..3)?.parse().ok()?;
    let minutes: i32 = s.get(3..5)?.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;
