// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Severity-prefixed human-readable output.

pub fn info(message: &str) {
    println!("info: {}", message);
}

pub fn warn(message: &str) {
    eprintln!("warn: {}", message);
}

pub fn error(message: &str) {
    eprintln!("error: {}", message);
}
