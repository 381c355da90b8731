// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted host state.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload, one frame
//! per host. Round-trips within muster; no cross-language guarantee.

use crate::flavor::Flavor;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Everything needed to re-adopt a host after a manager restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub flavor: Flavor,
    /// Provider credentials reference (key name, not key material).
    pub key_ref: String,
    /// Cluster namespace; empty outside cluster mode.
    #[serde(default)]
    pub namespace: String,
}

/// Write host records as length-prefixed JSON frames.
pub fn write_records<W: Write>(mut writer: W, records: &[HostRecord]) -> std::io::Result<()> {
    for record in records {
        let payload = serde_json::to_vec(record)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "record too large"))?;
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(&payload)?;
    }
    writer.flush()
}

/// Read host records until EOF.
pub fn read_records<R: Read>(mut reader: R) -> std::io::Result<Vec<HostRecord>> {
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let record = serde_json::from_slice(&payload)?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
#[path = "record_tests.rs"]
mod tests;
