// crates/linecast-server/src/filler.rs
//
// Content-deficit filler: when the live decoder exhausts before the scheduled
// boundary, deterministic pad keeps CT and the transport stream moving at
// nominal cadence until the boundary fires. The filler never advances the
// boundary and never re-plans.

use log::info;

use linecast_core::frame::{AudioPayload, VideoPayload};
use linecast_core::plan::Fps;

use linecast_media::pad::PadSource;

struct Engaged {
    start_ct_us: u64,
    engaged_utc_ms: i64,
}

pub struct DeficitFiller {
    pad: PadSource,
    engaged: Option<Engaged>,
}

impl DeficitFiller {
    pub fn new(width: u32, height: u32, fps: Fps, audio_rate: u32) -> Self {
        Self { pad: PadSource::new(width, height, fps, audio_rate), engaged: None }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.is_some()
    }

    /// `gap_ms` is the scheduled boundary minus now; how long the fill is
    /// expected to run. 0 when no boundary is declared yet (plan horizon
    /// empty); the fill then runs until one arrives.
    pub fn engage(&mut self, now_utc_ms: i64, start_ct_us: u64, gap_ms: i64) {
        if self.engaged.is_some() {
            return;
        }
        info!("CONTENT_DEFICIT_FILL_START boundary_ct={start_ct_us} gap_ms={gap_ms}");
        self.engaged = Some(Engaged { start_ct_us, engaged_utc_ms: now_utc_ms });
    }

    pub fn fill_pair(&mut self) -> (VideoPayload, AudioPayload) {
        self.pad.synth_pair()
    }

    /// Disengage at the boundary switch. Returns the fill duration for the
    /// deficit histogram; None if the filler was not engaged.
    pub fn disengage(&mut self, now_utc_ms: i64) -> Option<i64> {
        let engaged = self.engaged.take()?;
        let duration_ms = now_utc_ms - engaged.engaged_utc_ms;
        info!("CONTENT_DEFICIT_FILL_END duration_ms={duration_ms}");
        Some(duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engage_is_idempotent_until_disengaged() {
        let mut f = DeficitFiller::new(2, 2, Fps::new(30, 1), 48_000);
        f.engage(1_000, 0, 500);
        f.engage(1_100, 0, 400); // second engage is a no-op
        assert_eq!(f.disengage(1_500), Some(500));
        assert_eq!(f.disengage(1_500), None);
    }

    #[test]
    fn fill_is_black_and_silent() {
        let mut f = DeficitFiller::new(2, 2, Fps::new(30, 1), 48_000);
        f.engage(0, 0, 100);
        let (v, a) = f.fill_pair();
        assert!(v.data.iter().all(|&b| b == 0));
        assert!(a.samples.iter().all(|&s| s == 0));
    }
}
