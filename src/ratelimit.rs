//! Token-bucket shaping for peer traffic.
//!
//! One limiter is shared across every peer connection: the limits apply to
//! the node's aggregate bandwidth, not per peer. Limits are read on each
//! acquire, so reconfiguration takes effect immediately without tearing down
//! existing connections.

use crate::error::{Error, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, Instant};

/// Burst window: four memory pages.
const BURST_BYTES: f64 = (4 * 4096) as f64;

#[derive(Clone)]
pub(crate) struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    /// (download bps, upload bps); (0, 0) means unlimited.
    limits: Mutex<(i64, i64)>,
    down: tokio::sync::Mutex<Bucket>,
    up: tokio::sync::Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl Bucket {
    fn full() -> Self {
        Bucket { tokens: BURST_BYTES, updated: Instant::now() }
    }

    /// Debt model: take `n` tokens now, report how long to sleep to pay the
    /// deficit back at `bps`.
    fn take(&mut self, n: u64, bps: i64) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.updated).as_secs_f64();
        self.updated = now;
        self.tokens = (self.tokens + elapsed * bps as f64).min(BURST_BYTES);
        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / bps as f64)
        }
    }
}

impl RateLimiter {
    pub(crate) fn new() -> Self {
        RateLimiter {
            inner: Arc::new(Inner {
                limits: Mutex::new((0, 0)),
                down: tokio::sync::Mutex::new(Bucket::full()),
                up: tokio::sync::Mutex::new(Bucket::full()),
            }),
        }
    }

    pub(crate) fn limits(&self) -> (i64, i64) {
        *self.inner.limits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set bandwidth limits in bytes per second. Zero for both means
    /// unlimited; negative values are rejected.
    pub(crate) fn set_limits(&self, download_bps: i64, upload_bps: i64) -> Result<()> {
        if download_bps < 0 || upload_bps < 0 {
            return Err(Error::InvalidArgument("rate limits cannot be negative".into()));
        }
        *self.inner.limits.lock().unwrap_or_else(PoisonError::into_inner) = (download_bps, upload_bps);
        Ok(())
    }

    pub(crate) async fn wait_recv(&self, n: u64) {
        let bps = self.limits().0;
        if bps <= 0 {
            return;
        }
        let wait = self.inner.down.lock().await.take(n, bps);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    pub(crate) async fn wait_send(&self, n: u64) {
        let bps = self.limits().1;
        if bps <= 0 {
            return;
        }
        let wait = self.inner.up.lock().await.take(n, bps);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Read half of a peer connection with download shaping attached.
pub(crate) struct LimitedReader<R> {
    inner: R,
    rate: RateLimiter,
}

impl<R: AsyncRead + Unpin> LimitedReader<R> {
    pub(crate) fn new(inner: R, rate: RateLimiter) -> Self {
        LimitedReader { inner, rate }
    }

    /// Fill `buf` completely, paying for it in burst-sized chunks.
    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        for chunk in buf.chunks_mut(BURST_BYTES as usize) {
            self.rate.wait_recv(chunk.len() as u64).await;
            self.inner.read_exact(chunk).await?;
        }
        Ok(())
    }
}

/// Write half of a peer connection with upload shaping attached.
pub(crate) struct LimitedWriter<W> {
    inner: W,
    rate: RateLimiter,
}

impl<W: AsyncWrite + Unpin> LimitedWriter<W> {
    pub(crate) fn new(inner: W, rate: RateLimiter) -> Self {
        LimitedWriter { inner, rate }
    }

    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(BURST_BYTES as usize) {
            self.rate.wait_send(chunk.len() as u64).await;
            self.inner.write_all(chunk).await?;
        }
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_limits() {
        let rl = RateLimiter::new();
        assert!(rl.set_limits(-1, 0).is_err());
        assert!(rl.set_limits(0, -1).is_err());
        assert!(rl.set_limits(0, 0).is_ok());
        assert_eq!(rl.limits(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_sleeps() {
        let rl = RateLimiter::new();
        let start = Instant::now();
        rl.wait_recv(10_000_000).await;
        rl.wait_send(10_000_000).await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn throttles_past_the_burst_window() {
        let rl = RateLimiter::new();
        rl.set_limits(4096, 0).unwrap();
        let start = Instant::now();
        // First burst is free, the second must be paid back at 4096 B/s.
        rl.wait_recv(4 * 4096).await;
        rl.wait_recv(4 * 4096).await;
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_secs(4), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn reconfiguration_applies_immediately() {
        let rl = RateLimiter::new();
        rl.set_limits(1, 1).unwrap();
        // Drain the burst allowance at the slow rate.
        rl.wait_send(4 * 4096).await;
        // Lifting the limit makes the next acquire free.
        rl.set_limits(0, 0).unwrap();
        let start = Instant::now();
        rl.wait_send(1_000_000).await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test]
    async fn limited_pair_moves_bytes() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (server_r, _server_w) = tokio::io::split(server);
        let (_client_r, client_w) = tokio::io::split(client);
        let rate = RateLimiter::new();

        let mut w = LimitedWriter::new(client_w, rate.clone());
        let mut r = LimitedReader::new(server_r, rate);
        w.write_all(b"hello stream").await.unwrap();
        let mut buf = [0u8; 12];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello stream");
    }
}
