// crates/linecast-server/src/metrics.rs
//
// Session metrics: lock-free counters and fixed-bucket histograms. Updated on
// the hot path with relaxed atomics; snapshotted for /status.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use linecast_core::violation::Violation;

pub struct Histogram {
    bounds: &'static [u64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &'static [u64]) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self { bounds, buckets, count: AtomicU64::new(0), sum: AtomicU64::new(0) }
    }

    pub fn observe(&self, value: u64) {
        let idx = self.bounds.iter().position(|&b| value <= b).unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
            buckets: self
                .bounds
                .iter()
                .copied()
                .zip(self.buckets.iter().map(|b| b.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: u64,
    pub buckets: Vec<(u64, u64)>,
}

const MS_BOUNDS: &[u64] = &[1, 2, 5, 10, 17, 34, 67, 100, 250, 500, 1_000, 5_000, 30_000];

pub struct Metrics {
    pub boundary_violations_total: AtomicU64,
    pub stale_frame_bleeds_total: AtomicU64,
    pub pad_while_depth_high_total: AtomicU64,
    pub boundary_delta_ms: Histogram,
    pub prefeed_lead_time_ms: Histogram,
    pub content_deficit_duration_ms: Histogram,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            boundary_violations_total: AtomicU64::new(0),
            stale_frame_bleeds_total: AtomicU64::new(0),
            pad_while_depth_high_total: AtomicU64::new(0),
            boundary_delta_ms: Histogram::new(MS_BOUNDS),
            prefeed_lead_time_ms: Histogram::new(MS_BOUNDS),
            content_deficit_duration_ms: Histogram::new(MS_BOUNDS),
        })
    }

    pub fn record_violation(&self, v: Violation) {
        match v {
            Violation::StaleFrameBleed => {
                self.stale_frame_bleeds_total.fetch_add(1, Ordering::Relaxed);
            }
            Violation::PadWhileDepthHigh => {
                self.pad_while_depth_high_total.fetch_add(1, Ordering::Relaxed);
            }
            // Content-side deficits are visible via the deficit histogram,
            // not the violation counters.
            Violation::EarlyEof => {}
            _ => {
                self.boundary_violations_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            boundary_violations_total: self.boundary_violations_total.load(Ordering::Relaxed),
            stale_frame_bleeds_total: self.stale_frame_bleeds_total.load(Ordering::Relaxed),
            pad_while_depth_high_total: self.pad_while_depth_high_total.load(Ordering::Relaxed),
            boundary_delta_ms: self.boundary_delta_ms.snapshot(),
            prefeed_lead_time_ms: self.prefeed_lead_time_ms.snapshot(),
            content_deficit_duration_ms: self.content_deficit_duration_ms.snapshot(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub boundary_violations_total: u64,
    pub stale_frame_bleeds_total: u64,
    pub pad_while_depth_high_total: u64,
    pub boundary_delta_ms: HistogramSnapshot,
    pub prefeed_lead_time_ms: HistogramSnapshot,
    pub content_deficit_duration_ms: HistogramSnapshot,
}
