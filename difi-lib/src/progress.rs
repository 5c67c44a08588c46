//! Throughput and signal level statistics for received data packets.
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::vita::DataPacket;

/// Full scale of a ci16 component.
pub const FULL_SCALE: f64 = 32768.0;
/// Fraction of full scale above which a sample counts as clipped.
pub const CLIP_LEVEL: f64 = 0.99;
/// Occupancy reported for an interval whose samples are all zero.
pub const MIN_OCCUPANCY: f64 = -16.0;

/// Statistics for one reporting interval.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressReport {
    /// Samples per second over the interval.
    pub rate: f64,
    /// Mean absolute in-phase amplitude.
    pub mean: f64,
    /// `log2(mean / full scale)`; 0 at full scale, more negative for weaker signals.
    pub occupancy: f64,
    /// Bits needed to represent the mean amplitude, of the 16 available.
    pub bits: f64,
    /// Fraction of in-phase samples within 1% of full scale.
    pub clipped: f64,
}

/// Tracks throughput and signal level of received data packets.
///
/// Purely an observer; it reads packets and their sample payloads but never influences what
/// gets recorded.
///
/// # Example
/// ```
/// use std::time::{Duration, Instant};
/// use difi::progress::ProgressMonitor;
///
/// let start = Instant::now();
/// let mut monitor = ProgressMonitor::new(start);
/// assert!(monitor.tick(start + Duration::from_millis(10)).is_none());
/// ```
#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    interval: Duration,
    last_update: Instant,
    samples: u64,
    sum: f64,
    clipped: u64,
}

impl ProgressMonitor {
    #[must_use]
    pub fn new(now: Instant) -> Self {
        ProgressMonitor {
            interval: Duration::from_secs(1),
            last_update: now,
            samples: 0,
            sum: 0.0,
            clipped: 0,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Accumulate the samples of `packet`, found in `raw`.
    pub fn add(&mut self, packet: &DataPacket, raw: &[u8]) {
        self.samples += packet.num_samples as u64;
        for s in packet.samples(raw) {
            let v = f64::from(s.re).abs();
            self.sum += v;
            if v > FULL_SCALE * CLIP_LEVEL {
                self.clipped += 1;
            }
        }
    }

    /// Produce a report and start a new interval if more than the interval has elapsed.
    pub fn tick(&mut self, now: Instant) -> Option<ProgressReport> {
        let elapsed = now.saturating_duration_since(self.last_update);
        if elapsed <= self.interval {
            return None;
        }
        let report = self.report(elapsed);
        self.reset(now);
        Some(report)
    }

    /// Drop accumulated statistics and start a new interval at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.last_update = now;
        self.samples = 0;
        self.sum = 0.0;
        self.clipped = 0;
    }

    fn report(&self, elapsed: Duration) -> ProgressReport {
        if self.samples == 0 {
            return ProgressReport::default();
        }
        let n = self.samples as f64;
        let mean = self.sum / n;
        // an all-zero interval has no meaningful level
        let (occupancy, bits) = if mean > 0.0 {
            ((mean / FULL_SCALE).log2(), (mean.log2() + 1.0).ceil().max(0.0))
        } else {
            (MIN_OCCUPANCY, 0.0)
        };
        ProgressReport {
            rate: n / elapsed.as_secs_f64(),
            mean,
            occupancy,
            bits,
            clipped: self.clipped as f64 / n,
        }
    }
}
