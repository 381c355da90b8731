// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The job-essence file format.
//!
//! One record per line, TAB-separated: `cmd<TAB>cwd<TAB>mountsJSON`. The
//! last two columns are optional. Blank lines are skipped.

use muster_core::Essence;
use std::io::BufRead;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EssenceFileError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: empty command")]
    EmptyCommand { line: usize },

    #[error("line {line}: bad mounts JSON: {source}")]
    BadMounts {
        line: usize,
        source: serde_json::Error,
    },
}

/// Parse essences from a reader, one per line.
pub fn parse_essence_file<R: BufRead>(reader: R) -> Result<Vec<Essence>, EssenceFileError> {
    let mut essences = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }

        let mut columns = line.splitn(3, '\t');
        let cmd = columns.next().unwrap_or_default();
        if cmd.is_empty() {
            return Err(EssenceFileError::EmptyCommand { line: line_no });
        }

        let mut essence = Essence::new(cmd);
        if let Some(cwd) = columns.next() {
            if !cwd.is_empty() {
                essence = essence.with_cwd(cwd);
            }
        }
        if let Some(mounts) = columns.next() {
            if !mounts.is_empty() {
                let value = serde_json::from_str(mounts)
                    .map_err(|source| EssenceFileError::BadMounts { line: line_no, source })?;
                essence = essence.with_mounts(value);
            }
        }
        essences.push(essence);
    }
    Ok(essences)
}

#[cfg(test)]
#[path = "essence_file_tests.rs"]
mod tests;
