// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Manager connection.

use anyhow::Context;
use muster_wire::{decode, encode, Request, Response};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Refuse absurd replies rather than allocating them.
const MAX_REPLY: u32 = 64 * 1024 * 1024;

pub struct ManagerClient {
    stream: TcpStream,
    timeout: Duration,
}

impl ManagerClient {
    /// Connect with the given timeout, which also bounds each reply.
    pub async fn connect(addr: &str, timeout: Duration) -> anyhow::Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out reaching the manager at {}", addr))?
            .with_context(|| format!("could not reach the manager at {}", addr))?;
        Ok(Self { stream, timeout })
    }

    pub async fn send(&mut self, request: &Request) -> anyhow::Result<Response> {
        let frame = encode(request).context("encoding request")?;
        self.stream.write_all(&frame).await.context("sending request")?;

        let reply = tokio::time::timeout(self.timeout, self.read_frame())
            .await
            .context("timed out waiting for the manager's reply")??;
        decode(&reply).context("decoding the manager's reply")
    }

    async fn read_frame(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await.context("reading reply length")?;
        let len = u32::from_be_bytes(len_buf);
        anyhow::ensure!(len <= MAX_REPLY, "oversized reply frame of {} bytes", len);

        let mut frame = vec![0u8; 4 + len as usize];
        frame[..4].copy_from_slice(&len_buf);
        self.stream
            .read_exact(&mut frame[4..])
            .await
            .context("reading reply")?;
        Ok(frame)
    }
}
