//! Bidirectional byte pumping between two established channels, plus the
//! ordered write queue used while a handshake is still in flight.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Writes submitted before a channel is established, kept in FIFO order
/// with a single flush mark.
///
/// The mark records the boundary between writes whose flush was already
/// requested and writes still pending one. On establishment the marked
/// prefix is written and flushed before any later write goes out.
#[derive(Debug, Default)]
pub struct WriteQueue {
    queued: VecDeque<Vec<u8>>,
    flush_mark: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write. Empty writes are dropped; they count as succeeded.
    pub fn push(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.queued.push_back(data);
    }

    /// Record a flush request covering everything queued so far.
    pub fn mark_flush(&mut self) {
        self.flush_mark = self.queued.len();
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Deliver all queued writes: the marked prefix is written and flushed,
    /// the remainder written without a flush.
    pub async fn drain<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mark = self.flush_mark.min(self.queued.len());
        for _ in 0..mark {
            // mark bounds the loop, so the queue cannot be empty here
            if let Some(data) = self.queued.pop_front() {
                writer.write_all(&data).await?;
            }
        }
        if mark > 0 {
            writer.flush().await?;
        }
        while let Some(data) = self.queued.pop_front() {
            writer.write_all(&data).await?;
        }
        self.flush_mark = 0;
        Ok(())
    }

    /// Fail every queued write, as when the handshake they were waiting on
    /// is cancelled. Returns the error the writes resolve with.
    pub fn cancel(&mut self) -> ProxyError {
        self.queued.clear();
        self.flush_mark = 0;
        ProxyError::InvalidState("write queued on an unestablished channel")
    }
}

/// Pump bytes both ways between two established channels until both
/// directions reach EOF.
///
/// Each direction preserves order; EOF on one side shuts down the peer's
/// write half, and the connection ends once both directions are done.
/// Errors on either side tear down both.
pub async fn pump<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (a_to_b, b_to_a) = tokio::io::copy_bidirectional(a, b).await?;
    debug!(tx = a_to_b, rx = b_to_a, "tunnel closed");
    Ok((a_to_b, b_to_a))
}

/// Like [`pump`], but first delivers bytes that were read from `a` during
/// negotiation and belong at the head of the `a`→`b` stream.
pub async fn pump_with_leftover<A, B>(a: &mut A, b: &mut B, leftover: &[u8]) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    if !leftover.is_empty() {
        b.write_all(leftover).await?;
        b.flush().await?;
    }
    let (tx, rx) = pump(a, b).await?;
    Ok((tx + leftover.len() as u64, rx))
}
