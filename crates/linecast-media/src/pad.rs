// crates/linecast-media/src/pad.rs
//
// Deterministic pad synthesis: black video and silent audio at the nominal
// output rate. Pad is video-on-demand; no decoder, no thread, no buffer.
// Frames are synthesized at the instant the control core selects them.

use linecast_core::frame::{AudioPayload, VideoPayload};
use linecast_core::plan::Fps;

pub struct PadSource {
    width: u32,
    height: u32,
    fps: Fps,
    audio_rate: u32,
    frame_index: u64,
}

impl PadSource {
    pub fn new(width: u32, height: u32, fps: Fps, audio_rate: u32) -> Self {
        Self { width, height, fps, audio_rate, frame_index: 0 }
    }

    /// Interleaved stereo sample count up to (not including) frame `idx`.
    /// Index-derived so the long-run sample rate is exact.
    fn sample_frames_at(&self, idx: u64) -> u64 {
        idx * u64::from(self.audio_rate) * u64::from(self.fps.den) / u64::from(self.fps.num)
    }

    /// Synthesize the next black frame and its silence block.
    pub fn synth_pair(&mut self) -> (VideoPayload, AudioPayload) {
        let idx = self.frame_index;
        self.frame_index += 1;

        let media_ts_us = self.fps.ct_at_frame(idx) as i64;
        let video = VideoPayload {
            media_ts_us,
            width: self.width,
            height: self.height,
            data: vec![0u8; (self.width * self.height * 4) as usize],
        };
        let sample_frames = self.sample_frames_at(idx + 1) - self.sample_frames_at(idx);
        let audio = AudioPayload {
            media_ts_us,
            rate: self.audio_rate,
            samples: vec![0i16; (sample_frames * 2) as usize],
        };
        (video, audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_is_black_and_silent() {
        let mut pad = PadSource::new(8, 8, Fps::new(30, 1), 48_000);
        let (v, a) = pad.synth_pair();
        assert!(v.data.iter().all(|&b| b == 0));
        assert!(a.samples.iter().all(|&s| s == 0));
        assert_eq!(v.data.len(), 8 * 8 * 4);
    }

    #[test]
    fn one_second_of_pad_carries_exactly_one_second_of_audio() {
        let mut pad = PadSource::new(2, 2, Fps::new(30, 1), 48_000);
        let total: usize = (0..30).map(|_| pad.synth_pair().1.samples.len()).sum();
        assert_eq!(total, 48_000 * 2); // interleaved stereo
    }

    #[test]
    fn ntsc_rate_accumulates_no_sample_drift() {
        let mut pad = PadSource::new(2, 2, Fps::new(30_000, 1_001), 48_000);
        let total: u64 = (0..30_000).map(|_| pad.synth_pair().1.samples.len() as u64).sum();
        // 30 000 frames at 30000/1001 fps = 1001 s exactly.
        assert_eq!(total, 48_000 * 1_001 * 2);
    }

    #[test]
    fn two_sources_synthesize_identical_sequences() {
        let mut a = PadSource::new(4, 4, Fps::new(25, 1), 48_000);
        let mut b = PadSource::new(4, 4, Fps::new(25, 1), 48_000);
        for _ in 0..50 {
            let (va, aa) = a.synth_pair();
            let (vb, ab) = b.synth_pair();
            assert_eq!(va.media_ts_us, vb.media_ts_us);
            assert_eq!(va.data, vb.data);
            assert_eq!(aa.samples.len(), ab.samples.len());
        }
    }
}
