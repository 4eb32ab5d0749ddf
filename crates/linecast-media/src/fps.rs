// crates/linecast-media/src/fps.rs
//
// Producer-side frame-rate resample policy. The output tick is authoritative:
// CT advances per emitted frame regardless of what the container claims, so
// the only question here is whether to pass input frames 1:1 (OFF), thin them
// (DROP) or repeat them (DUP) on the way into the buffer.

use linecast_core::plan::Fps;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resample {
    /// Pass-through: one input frame per output tick. Selected whenever the
    /// container's rate report cannot be trusted.
    Off,
    Drop,
    Dup,
}

/// Fraction by which a measured average may deviate from the reported rate
/// before the report is considered unreliable.
const REPORT_TRUST_BAND: f64 = 0.10;

/// Relative rate difference below which input and output count as same-rate.
const SAME_RATE_BAND: f64 = 0.001;

/// Pick the resample mode for a segment.
///
/// A report that disagrees with the measured average by more than the trust
/// band selects OFF, not DROP: thinning frames on the strength of a bogus
/// header turns a 28.6 fps file into premature EOF halfway through the
/// segment. OFF delivers every decoded frame and lets CT stamping carry the
/// timing.
pub fn choose_resample(reported: Option<Fps>, measured_fps: Option<f64>, output: Fps) -> Resample {
    let Some(reported) = reported else { return Resample::Off };
    let reported_f = reported.as_f64();

    if let Some(measured) = measured_fps {
        if measured > 0.0 && ((measured - reported_f) / reported_f).abs() > REPORT_TRUST_BAND {
            return Resample::Off;
        }
    }

    let ratio = reported_f / output.as_f64();
    if (ratio - 1.0).abs() < SAME_RATE_BAND {
        Resample::Off
    } else if ratio > 1.0 {
        Resample::Drop
    } else {
        Resample::Dup
    }
}

/// Index-based emission lattice for DROP/DUP. For input frame `k` the number
/// of copies to emit is the count of output ticks falling in the half-open
/// interval covered by that frame; computed from the index, so the ratio is
/// exact over any run length.
pub struct Cadence {
    mode: Resample,
    step: f64,
    index: u64,
}

impl Cadence {
    pub fn new(mode: Resample, input: Fps, output: Fps) -> Self {
        let step = match mode {
            Resample::Off => 1.0,
            _ => output.as_f64() / input.as_f64(),
        };
        Self { mode, step, index: 0 }
    }

    pub fn mode(&self) -> Resample {
        self.mode
    }

    /// Copies to emit for the next input frame: 0 drops it, 1 passes it,
    /// n > 1 repeats it.
    pub fn copies_for_next(&mut self) -> u32 {
        let k = self.index as f64;
        self.index += 1;
        if self.mode == Resample::Off {
            return 1;
        }
        let before = (k * self.step + 0.5).floor();
        let after = ((k + 1.0) * self.step + 0.5).floor();
        (after - before) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreliable_report_selects_off_not_drop() {
        // Container says 60 fps, actual average is 28.6; the report lies.
        let mode = choose_resample(Some(Fps::new(60, 1)), Some(28.6), Fps::new(30, 1));
        assert_eq!(mode, Resample::Off);

        // OFF delivers every decoded frame: 100 in, 100 out.
        let mut c = Cadence::new(mode, Fps::new(60, 1), Fps::new(30, 1));
        let emitted: u32 = (0..100).map(|_| c.copies_for_next()).sum();
        assert_eq!(emitted, 100);
    }

    #[test]
    fn trustworthy_double_rate_drops_half() {
        let mode = choose_resample(Some(Fps::new(60, 1)), Some(59.9), Fps::new(30, 1));
        assert_eq!(mode, Resample::Drop);
        let mut c = Cadence::new(mode, Fps::new(60, 1), Fps::new(30, 1));
        let emitted: u32 = (0..1_000).map(|_| c.copies_for_next()).sum();
        assert_eq!(emitted, 500);
        // First frame is never dropped; shadow needs it.
        let mut c = Cadence::new(mode, Fps::new(60, 1), Fps::new(30, 1));
        assert_eq!(c.copies_for_next(), 1);
    }

    #[test]
    fn half_rate_duplicates() {
        let mode = choose_resample(Some(Fps::new(15, 1)), None, Fps::new(30, 1));
        assert_eq!(mode, Resample::Dup);
        let mut c = Cadence::new(mode, Fps::new(15, 1), Fps::new(30, 1));
        let emitted: u32 = (0..300).map(|_| c.copies_for_next()).sum();
        assert_eq!(emitted, 600);
    }

    #[test]
    fn matching_rate_is_off() {
        assert_eq!(
            choose_resample(Some(Fps::new(30_000, 1_001)), None, Fps::new(30_000, 1_001)),
            Resample::Off
        );
    }

    #[test]
    fn ntsc_to_integer_ratio_is_exact_over_long_runs() {
        let mode = choose_resample(Some(Fps::new(60_000, 1_001)), None, Fps::new(30_000, 1_001));
        assert_eq!(mode, Resample::Drop);
        let mut c = Cadence::new(mode, Fps::new(60_000, 1_001), Fps::new(30_000, 1_001));
        let emitted: u64 = (0..100_000).map(|_| u64::from(c.copies_for_next())).sum();
        assert_eq!(emitted, 50_000);
    }
}
