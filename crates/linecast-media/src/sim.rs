// crates/linecast-media/src/sim.rs
//
// Scripted frame source for deterministic engine tests. Payload bytes are
// derived from (segment_id, frame index) so two runs of the same plan produce
// byte-identical sequences; the replay properties depend on this.

use std::collections::VecDeque;

use linecast_core::frame::{AudioPayload, MediaItem, VideoPayload};
use linecast_core::plan::{Fps, SegmentId};

use crate::producer::{EofReport, FrameSource};

pub struct SimSource {
    segment_id: SegmentId,
    script: VecDeque<MediaItem>,
    /// Items currently pollable. Tests advance this to model decoder pace;
    /// withholding releases models a stalled decoder.
    released: usize,
    started: bool,
    stopped: bool,
    planned_frame_count: u64,
    frames_delivered: u64,
    total_video: u64,
}

impl SimSource {
    /// A content segment scripted as `video_frames` interleaved video+audio
    /// pairs at the given rate.
    pub fn content(
        segment_id: SegmentId,
        video_frames: u64,
        fps: Fps,
        audio_rate: u32,
    ) -> Self {
        let mut script = VecDeque::with_capacity((video_frames * 2) as usize);
        for idx in 0..video_frames {
            let media_ts_us = fps.ct_at_frame(idx) as i64;
            let seed = (segment_id.0 as u8).wrapping_mul(31).wrapping_add(idx as u8);
            script.push_back(MediaItem::Video(VideoPayload {
                media_ts_us,
                width: 4,
                height: 4,
                data: vec![seed; 4 * 4 * 4],
            }));
            let samples = (u64::from(audio_rate) * u64::from(fps.den) / u64::from(fps.num)) * 2;
            script.push_back(MediaItem::Audio(AudioPayload {
                media_ts_us,
                rate: audio_rate,
                samples: vec![seed as i16; samples as usize],
            }));
        }
        Self {
            segment_id,
            script,
            released: 0,
            started: false,
            stopped: false,
            planned_frame_count: video_frames,
            frames_delivered: 0,
            total_video: video_frames,
        }
    }

    /// Shorten the media below its planned count; the early-EOF case.
    pub fn truncate_media(mut self, actual_video_frames: u64) -> Self {
        self.script.truncate((actual_video_frames * 2) as usize);
        self.total_video = actual_video_frames;
        self
    }

    /// Make `n` more script items pollable.
    pub fn release(&mut self, n: usize) {
        self.released += n;
    }

    pub fn release_all(&mut self) {
        self.released = usize::MAX;
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }
}

impl FrameSource for SimSource {
    fn start(&mut self) {
        self.started = true;
    }

    fn poll_frame(&mut self) -> Option<MediaItem> {
        if self.stopped || self.released == 0 {
            return None;
        }
        let item = self.script.pop_front()?;
        if self.released != usize::MAX {
            self.released -= 1;
        }
        if matches!(item, MediaItem::Video(_)) {
            self.frames_delivered += 1;
        }
        Some(item)
    }

    fn signal_stop(&mut self) {
        self.stopped = true;
    }

    fn eof_observed(&self) -> Option<EofReport> {
        if self.script.is_empty() || self.stopped {
            Some(EofReport {
                segment_id: self.segment_id,
                frames_delivered: self.frames_delivered,
                planned_frame_count: self.planned_frame_count,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_source_is_reproducible() {
        let mut a = SimSource::content(SegmentId(3), 10, Fps::new(30, 1), 48_000);
        let mut b = SimSource::content(SegmentId(3), 10, Fps::new(30, 1), 48_000);
        a.release_all();
        b.release_all();
        loop {
            match (a.poll_frame(), b.poll_frame()) {
                (None, None) => break,
                (Some(MediaItem::Video(x)), Some(MediaItem::Video(y))) => assert_eq!(x.data, y.data),
                (Some(MediaItem::Audio(x)), Some(MediaItem::Audio(y))) => assert_eq!(x.samples, y.samples),
                _ => panic!("scripts diverged"),
            }
        }
    }

    #[test]
    fn truncated_media_reports_early_eof_deficit() {
        let mut s = SimSource::content(SegmentId(5), 300, Fps::new(30, 1), 48_000).truncate_media(210);
        s.release_all();
        while s.poll_frame().is_some() {}
        let report = s.eof_observed().unwrap();
        assert_eq!(report.frames_delivered, 210);
        assert_eq!(report.planned_frame_count, 300);
        assert_eq!(report.deficit_frames(), 90);
    }

    #[test]
    fn withheld_release_models_a_stalled_decoder() {
        let mut s = SimSource::content(SegmentId(1), 5, Fps::new(30, 1), 48_000);
        assert!(s.poll_frame().is_none()); // nothing released yet
        assert!(s.eof_observed().is_none()); // stalled, not exhausted
        s.release(2);
        assert!(matches!(s.poll_frame(), Some(MediaItem::Video(_))));
        assert!(matches!(s.poll_frame(), Some(MediaItem::Audio(_))));
        assert!(s.poll_frame().is_none());
    }
}
