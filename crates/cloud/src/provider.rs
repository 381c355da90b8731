// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The provider seam: what the host controller and placement engine need
//! from whatever actually owns the machines.

use crate::error::ProviderError;
use crate::record::HostRecord;
use async_trait::async_trait;
use muster_core::Requirements;

/// Backing infrastructure for hosts.
///
/// The host controller only calls back here to tear a machine down and to
/// double-check existence; the placement engine additionally asks for new
/// machines when nothing fits.
#[async_trait]
pub trait Provider: Send + Sync {
    /// PEM private key used for SSH to spawned hosts.
    fn private_key(&self) -> &str;

    /// Whether this provider can create new hosts on demand. Local
    /// providers cannot; cloud providers can.
    fn can_spawn(&self) -> bool {
        false
    }

    /// Request a new host able to run a command with the given
    /// requirements. Only called when `can_spawn()` is true.
    async fn spawn_server(&self, req: &Requirements) -> Result<HostRecord, ProviderError>;

    /// Tear the machine down.
    async fn destroy_server(&self, id: &str) -> Result<(), ProviderError>;

    /// Whether the machine still exists according to the provider.
    async fn check_server(&self, id: &str) -> Result<bool, ProviderError>;
}

#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeProvider;

#[cfg(any(test, feature = "test-support"))]
mod fake {
    use super::*;
    use crate::flavor::Flavor;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// In-memory provider for tests: records destructions, hands out
    /// sequentially numbered hosts.
    pub struct FakeProvider {
        destroyed: Mutex<HashSet<String>>,
        spawned: Mutex<u32>,
        spawn_requests: Mutex<Vec<Requirements>>,
        can_spawn: bool,
        /// What `destroy_server` returns.
        pub destroy_result: Mutex<Result<(), ProviderError>>,
        /// Whether `check_server` reports hosts as still existing after a
        /// failed destroy.
        pub check_exists: Mutex<bool>,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self {
                destroyed: Mutex::new(HashSet::new()),
                spawned: Mutex::new(0),
                spawn_requests: Mutex::new(Vec::new()),
                can_spawn: false,
                destroy_result: Mutex::new(Ok(())),
                check_exists: Mutex::new(false),
            }
        }

        pub fn cloud() -> Self {
            Self { can_spawn: true, ..Self::new() }
        }

        pub fn was_destroyed(&self, id: &str) -> bool {
            self.destroyed.lock().contains(id)
        }

        pub fn destroy_count(&self) -> usize {
            self.destroyed.lock().len()
        }

        pub fn spawn_requests(&self) -> Vec<Requirements> {
            self.spawn_requests.lock().clone()
        }
    }

    impl Default for FakeProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn private_key(&self) -> &str {
            "-----BEGIN FAKE KEY-----"
        }

        fn can_spawn(&self) -> bool {
            self.can_spawn
        }

        async fn spawn_server(&self, req: &Requirements) -> Result<HostRecord, ProviderError> {
            self.spawn_requests.lock().push(req.clone());
            let n = {
                let mut spawned = self.spawned.lock();
                *spawned += 1;
                *spawned
            };
            Ok(HostRecord {
                id: format!("fake-{}", n),
                name: format!("fake-{}", n),
                ip: format!("10.0.0.{}", n),
                flavor: Flavor::new("f1", "fake.large", 4, 16_384, 100),
                key_ref: "fake-key".to_string(),
                namespace: String::new(),
            })
        }

        async fn destroy_server(&self, id: &str) -> Result<(), ProviderError> {
            self.destroyed.lock().insert(id.to_string());
            self.destroy_result.lock().clone()
        }

        async fn check_server(&self, _id: &str) -> Result<bool, ProviderError> {
            Ok(*self.check_exists.lock())
        }
    }
}
