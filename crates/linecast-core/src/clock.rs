// crates/linecast-core/src/clock.rs
//
// Master clock facility; the only process-wide state in the core. The trait
// is threaded through the runtime so the control core and mux are driven
// identically by the system clock in production and a manual clock in tests.

use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

pub trait MasterClock: Send + Sync {
    /// Current wall-clock time, ms since the Unix epoch.
    fn now_utc_ms(&self) -> i64;

    /// Map an absolute wall-clock deadline onto a monotonic `Instant` for use
    /// with deadline-timer receivers. Past deadlines map to "now".
    fn instant_of(&self, utc_ms: i64) -> Instant;

    /// Block until the given absolute wall-clock instant (µs precision; PCR
    /// pacing sleeps on sub-ms deadlines).
    fn sleep_until_utc_us(&self, utc_us: i64);
}

// ── System clock ──────────────────────────────────────────────────────────────

pub struct SystemClock {
    base_instant: Instant,
    base_utc_us: i64,
}

impl SystemClock {
    pub fn new() -> Self {
        let base_utc_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self { base_instant: Instant::now(), base_utc_us }
    }

    fn now_utc_us(&self) -> i64 {
        self.base_utc_us + self.base_instant.elapsed().as_micros() as i64
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterClock for SystemClock {
    fn now_utc_ms(&self) -> i64 {
        self.now_utc_us() / 1_000
    }

    fn instant_of(&self, utc_ms: i64) -> Instant {
        let delta_us = utc_ms * 1_000 - self.base_utc_us;
        self.base_instant + Duration::from_micros(delta_us.max(0) as u64)
    }

    fn sleep_until_utc_us(&self, utc_us: i64) {
        let now = self.now_utc_us();
        if utc_us > now {
            thread::sleep(Duration::from_micros((utc_us - now) as u64));
        }
    }
}

// ── Manual clock (tests) ──────────────────────────────────────────────────────

/// Virtual clock for deterministic tests. `sleep_until_utc_us` advances the
/// clock instead of blocking, so a paced loop runs at full speed while
/// observing exactly the timeline it would in real time.
pub struct ManualClock {
    now_utc_us: Mutex<i64>,
    base_instant: Instant,
}

impl ManualClock {
    pub fn new(start_utc_ms: i64) -> Self {
        Self { now_utc_us: Mutex::new(start_utc_ms * 1_000), base_instant: Instant::now() }
    }

    pub fn set_ms(&self, utc_ms: i64) {
        *self.now_utc_us.lock() = utc_ms * 1_000;
    }

    pub fn advance_ms(&self, ms: i64) {
        *self.now_utc_us.lock() += ms * 1_000;
    }
}

impl MasterClock for ManualClock {
    fn now_utc_ms(&self) -> i64 {
        *self.now_utc_us.lock() / 1_000
    }

    fn instant_of(&self, _utc_ms: i64) -> Instant {
        self.base_instant
    }

    fn sleep_until_utc_us(&self, utc_us: i64) {
        let mut now = self.now_utc_us.lock();
        if utc_us > *now {
            *now = utc_us;
        }
    }
}
