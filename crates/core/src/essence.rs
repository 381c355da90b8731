// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job identity: the (command, working directory, mounts) triple and its
//! content fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Borrow;
use std::fmt;

/// Content fingerprint of a job essence, hex-encoded SHA-256.
///
/// Two submissions with equal essences get equal keys, which is how the
/// queue enforces at-most-one concurrently-tracked copy per job identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey(pub String);

impl ItemKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ItemKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ItemKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PartialEq<str> for ItemKey {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ItemKey {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl Borrow<str> for ItemKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// What identifies a command across submissions: the command line, the
/// working directory it runs in, and its mount specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Essence {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Opaque mount specification, carried as the JSON the submitter gave us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounts: Option<serde_json::Value>,
}

impl Essence {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into(), cwd: None, mounts: None }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_mounts(mut self, mounts: serde_json::Value) -> Self {
        self.mounts = Some(mounts);
        self
    }

    /// Content fingerprint over (cmd, cwd, mounts).
    ///
    /// Fields are length-delimited before hashing so that shifting bytes
    /// between cmd and cwd cannot produce a collision.
    pub fn key(&self) -> ItemKey {
        let mut hasher = Sha256::new();
        hasher.update(self.cmd.len().to_le_bytes());
        hasher.update(self.cmd.as_bytes());
        if let Some(cwd) = &self.cwd {
            hasher.update(cwd.len().to_le_bytes());
            hasher.update(cwd.as_bytes());
        }
        if let Some(mounts) = &self.mounts {
            let canon = mounts.to_string();
            hasher.update(canon.len().to_le_bytes());
            hasher.update(canon.as_bytes());
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(hex, "{:02x}", byte);
        }
        ItemKey(hex)
    }
}

impl fmt::Display for Essence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cwd {
            Some(cwd) => write!(f, "{} [{}]", self.cmd, cwd),
            None => write!(f, "{}", self.cmd),
        }
    }
}

#[cfg(test)]
#[path = "essence_tests.rs"]
mod tests;
