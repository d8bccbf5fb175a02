//! Chunk-level progress estimation.
//!
//! `estimate` is deliberately a pure function: every strategy feeds it the
//! same three observations and the reconciler/broadcaster only ever relay
//! its output, so this is the one place percent/ETA math lives.

use serde::Serialize;
use std::time::Duration;

/// Default copy-loop chunk size (32 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// One observation of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSample {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percent: u8,
    pub eta_seconds: u64,
}

impl ProgressSample {
    pub fn new(bytes_transferred: u64, total_bytes: u64, elapsed: Duration) -> Self {
        let (percent, eta_seconds) = estimate(bytes_transferred, total_bytes, elapsed);
        ProgressSample {
            bytes_transferred,
            total_bytes,
            percent,
            eta_seconds,
        }
    }

    pub fn is_final(&self) -> bool {
        self.total_bytes > 0 && self.bytes_transferred >= self.total_bytes
    }
}

/// Turn (bytes transferred, total bytes, elapsed) into (percent, ETA seconds).
///
/// Percent is floor(100 * transferred / total) clamped to [0, 100]. A zero
/// total is a caller bug (sizing has not run); report 0% instead of dividing.
/// ETA is 0 before any bytes have moved, otherwise remaining / observed rate,
/// floored.
pub fn estimate(bytes_transferred: u64, total_bytes: u64, elapsed: Duration) -> (u8, u64) {
    if total_bytes == 0 {
        return (0, 0);
    }
    let capped = bytes_transferred.min(total_bytes);
    // widen before multiplying; near u64::MAX the product must not saturate
    let percent = ((capped as u128 * 100) / total_bytes as u128) as u8;

    if bytes_transferred == 0 {
        return (percent, 0);
    }
    let elapsed_secs = elapsed.as_secs_f64();
    let rate = bytes_transferred as f64 / elapsed_secs;
    if !rate.is_finite() || rate <= 0.0 {
        return (percent, 0);
    }
    let remaining = total_bytes.saturating_sub(bytes_transferred);
    let eta = (remaining as f64 / rate).floor();
    (percent, eta as u64)
}

/// Receives a sample after every copied chunk. Strategies call this on the
/// hot path, so implementations should be cheap and must never block on the
/// network.
pub trait ProgressSink: Send + Sync {
    fn sample(&self, _sample: &ProgressSample, _current_file: &str) {}
}

/// Sink that drops everything. Zero overhead in the copy loop.
pub struct NoopSink;
impl ProgressSink for NoopSink {}
