// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SSH client wrapper around libssh2.
//!
//! One client per host, created lazily and shared by every remote command.
//! libssh2 sessions are not safe for concurrent channel work, so all
//! operations serialise on the session lock; each command still gets its own
//! channel. Host-key checking is disabled: we dial hosts we just created by
//! IP and have no key to pin (known limitation).

use crate::error::HostError;
use parking_lot::Mutex;
use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

/// Channel-open timeout. Even a connected client can hang creating a new
/// session on a silently-dead host, so this is enforced independently of
/// the dial timeout.
const SESSION_TIMEOUT_MS: u32 = 5_000;

/// Dial retry policy.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// TCP connect timeout per attempt.
    pub per_attempt: Duration,
    /// Overall budget for hosts that are not reachable yet.
    pub outer: Duration,
    /// Pause between attempts.
    pub tick: Duration,
    /// Attempt budget for errors of any other kind. Newly booted images
    /// often expose sshd before the login user exists, so these are retried
    /// too, just not for the full outer budget.
    pub generic_ticks: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            per_attempt: Duration::from_secs(5),
            outer: Duration::from_secs(300),
            tick: Duration::from_secs(1),
            generic_ticks: 45,
        }
    }
}

/// What a finished remote command produced.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

enum DialError {
    Io(std::io::Error),
    Ssh(ssh2::Error),
}

impl DialError {
    /// The network-or-host-not-ready class: retried for the full outer
    /// budget because a freshly spawned host legitimately looks like this
    /// for a while.
    fn unreachable_class(&self) -> bool {
        match self {
            DialError::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::HostUnreachable
                ) || {
                    let msg = e.to_string();
                    msg.ends_with("connection timed out")
                        || msg.ends_with("no route to host")
                        || msg.ends_with("connection refused")
                }
            }
            DialError::Ssh(_) => false,
        }
    }

    fn message(&self) -> String {
        match self {
            DialError::Io(e) => e.to_string(),
            DialError::Ssh(e) => e.to_string(),
        }
    }
}

/// A connected, authenticated SSH client.
pub struct SshClient {
    session: Mutex<Session>,
}

impl SshClient {
    /// Dial and authenticate, retrying per the config's two budgets.
    /// Blocking; callers on the async side wrap this in `spawn_blocking`.
    pub fn connect(
        addr: &str,
        user: &str,
        private_key: &str,
        config: &SshConfig,
    ) -> Result<Self, HostError> {
        match Self::dial(addr, user, private_key, config.per_attempt) {
            Ok(session) => return Ok(Self { session: Mutex::new(session) }),
            Err(e) => {
                tracing::debug!(addr, error = %e.message(), "initial ssh dial failed, retrying");
            }
        }

        let deadline = Instant::now() + config.outer;
        let mut generic_attempts = 0u32;
        loop {
            std::thread::sleep(config.tick);
            if Instant::now() >= deadline {
                return Err(HostError::SshUnavailable(
                    "giving up waiting for ssh to work".to_string(),
                ));
            }
            match Self::dial(addr, user, private_key, config.per_attempt) {
                Ok(session) => return Ok(Self { session: Mutex::new(session) }),
                Err(e) if e.unreachable_class() => continue,
                Err(e) => {
                    generic_attempts += 1;
                    if generic_attempts >= config.generic_ticks {
                        return Err(HostError::SshUnavailable(e.message()));
                    }
                }
            }
        }
    }

    fn dial(
        addr: &str,
        user: &str,
        private_key: &str,
        timeout: Duration,
    ) -> Result<Session, DialError> {
        let sockaddr = addr
            .to_socket_addrs()
            .map_err(DialError::Io)?
            .next()
            .ok_or_else(|| {
                DialError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "address resolved to nothing",
                ))
            })?;
        let stream =
            TcpStream::connect_timeout(&sockaddr, timeout).map_err(DialError::Io)?;

        let mut session = Session::new().map_err(DialError::Ssh)?;
        session.set_tcp_stream(stream);
        session.handshake().map_err(DialError::Ssh)?;
        session
            .userauth_pubkey_memory(user, None, private_key, None)
            .map_err(DialError::Ssh)?;
        Ok(session)
    }

    /// Run a command to completion, capturing stdout, stderr and the exit
    /// status. Non-zero exits are returned as normal output, not errors.
    pub fn exec(&self, cmd: &str) -> Result<CmdOutput, HostError> {
        let session = self.session.lock();
        session.set_timeout(SESSION_TIMEOUT_MS);
        let mut channel = match session.channel_session() {
            Ok(c) => c,
            Err(e) => {
                session.set_timeout(0);
                return Err(HostError::SshUnavailable(e.to_string()));
            }
        };
        session.set_timeout(0);

        channel.exec(cmd).map_err(|e| HostError::SshUnavailable(e.to_string()))?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close().map_err(|e| HostError::SshUnavailable(e.to_string()))?;
        let exit_code =
            channel.exit_status().map_err(|e| HostError::SshUnavailable(e.to_string()))?;

        Ok(CmdOutput { stdout, stderr, exit_code })
    }

    /// Upload a local file over SFTP. Parent directories must exist.
    pub fn upload(&self, local: &Path, remote: &str) -> Result<(), HostError> {
        let session = self.session.lock();
        let sftp = session.sftp().map_err(|e| HostError::SshUnavailable(e.to_string()))?;
        let mut source = std::fs::File::open(local)?;
        let mut dest = sftp
            .create(Path::new(remote))
            .map_err(|e| HostError::SshUnavailable(e.to_string()))?;
        std::io::copy(&mut source, &mut dest)?;
        Ok(())
    }

    /// Download a remote file over SFTP. The local directory must exist.
    pub fn download(&self, remote: &str, local: &Path) -> Result<(), HostError> {
        let session = self.session.lock();
        let sftp = session.sftp().map_err(|e| HostError::SshUnavailable(e.to_string()))?;
        let mut source = sftp
            .open(Path::new(remote))
            .map_err(|e| HostError::SshUnavailable(e.to_string()))?;
        let mut dest = std::fs::File::create(local)?;
        std::io::copy(&mut source, &mut dest)?;
        Ok(())
    }

    /// Create a remote file with the given content over SFTP.
    pub fn create(&self, content: &str, remote: &str) -> Result<(), HostError> {
        let session = self.session.lock();
        let sftp = session.sftp().map_err(|e| HostError::SshUnavailable(e.to_string()))?;
        let mut dest = sftp
            .create(Path::new(remote))
            .map_err(|e| HostError::SshUnavailable(e.to_string()))?;
        use std::io::Write;
        dest.write_all(content.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "ssh_tests.rs"]
mod tests;
