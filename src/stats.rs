//! Delivery statistics for a streaming session.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the pacing loop.
///
/// - **Throughput**: total bits handed to consumers, counted once per
///   consumer per broadcast (`8 × bytes × consumers`).
/// - **Lag**: milliseconds the scheduler spent stalled on backpressure.
///   This is the externally visible face of the drift accumulator.
///
/// All counters are atomics; a `StreamStats` is shared via `Arc` between
/// the scheduler and whoever reports metrics.
#[derive(Debug, Default)]
pub struct StreamStats {
    throughput_bits: AtomicU64,
    lag_ms: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_throughput_bits(&self, bits: u64) {
        self.throughput_bits.fetch_add(bits, Ordering::Relaxed);
    }

    pub fn add_lag_ms(&self, ms: u64) {
        self.lag_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Total bits broadcast so far.
    pub fn throughput_bits(&self) -> u64 {
        self.throughput_bits.load(Ordering::Relaxed)
    }

    /// Accumulated backpressure stall time in milliseconds.
    pub fn lag_ms(&self) -> u64 {
        self.lag_ms.load(Ordering::Relaxed)
    }
}
