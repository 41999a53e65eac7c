// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bounded buffer holding the newest window of child stderr.
///
/// Only the tail is ever read back (it is attached to transport-failure
/// errors), so the buffer stores just the retained window and evicts from
/// the front as new output arrives.
#[derive(Debug)]
pub struct StderrRing {
    buf: VecDeque<u8>,
    capacity: usize,
    total_written: u64,
}

impl StderrRing {
    pub fn new(capacity: usize) -> Self {
        Self { buf: VecDeque::with_capacity(capacity), capacity, total_written: 0 }
    }

    /// Append data, evicting the oldest bytes once over capacity.
    pub fn write(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;

        if data.len() >= self.capacity {
            // The new data alone fills the window; nothing old survives.
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return;
        }

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    /// The retained tail, lossily decoded.
    pub fn tail(&self) -> String {
        let (front, back) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        String::from_utf8_lossy(&out).into_owned()
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

/// Drain a child's stderr into the ring until EOF.
pub fn spawn_stderr_drain<R>(mut stderr: R, ring: Arc<Mutex<StderrRing>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => ring.lock().write(&chunk[..n]),
            }
        }
    });
}

#[cfg(test)]
#[path = "stderr_tests.rs"]
mod tests;
