// crates/linecast-server/src/engine/buffers.rs
//
// Per-segment frame buffer: a video deque and an audio deque behind one
// write barrier. The buffer is tagged with its owning segment at creation;
// before the first frame is admitted; so every admitted frame already
// carries the origin the commit will rebind to.

use std::collections::VecDeque;

use linecast_core::frame::{AudioPayload, MediaItem, VideoPayload};
use linecast_core::plan::SegmentId;
use linecast_core::violation::Violation;

pub struct SegmentBuffer {
    origin: SegmentId,
    video: VecDeque<VideoPayload>,
    audio: VecDeque<AudioPayload>,
    /// Audio admitted before the first video frame is held here; the
    /// incoming segment's audio never runs ahead of its video at a switch.
    gated_audio: VecDeque<AudioPayload>,
    barrier: bool,
    admitted_video: u64,
    admitted_audio_sample_frames: u64,
    post_barrier_writes: u64,
}

impl SegmentBuffer {
    pub fn new(origin: SegmentId) -> Self {
        Self {
            origin,
            video: VecDeque::new(),
            audio: VecDeque::new(),
            gated_audio: VecDeque::new(),
            barrier: false,
            admitted_video: 0,
            admitted_audio_sample_frames: 0,
            post_barrier_writes: 0,
        }
    }

    pub fn origin(&self) -> SegmentId {
        self.origin
    }

    pub fn admit(&mut self, item: MediaItem) -> Result<(), Violation> {
        if self.barrier {
            self.post_barrier_writes += 1;
            return Err(Violation::PostBarrierWrite);
        }
        match item {
            MediaItem::Video(v) => {
                self.video.push_back(v);
                self.admitted_video += 1;
                while let Some(a) = self.gated_audio.pop_front() {
                    self.admitted_audio_sample_frames += (a.samples.len() / 2) as u64;
                    self.audio.push_back(a);
                }
            }
            MediaItem::Audio(a) => {
                if self.admitted_video == 0 {
                    self.gated_audio.push_back(a);
                } else {
                    self.admitted_audio_sample_frames += (a.samples.len() / 2) as u64;
                    self.audio.push_back(a);
                }
            }
        }
        Ok(())
    }

    pub fn pop_video(&mut self) -> Option<VideoPayload> {
        self.video.pop_front()
    }

    /// Pop roughly one frame period of audio, merging decoder blocks as
    /// needed (codec frames rarely align with video frames).
    pub fn pop_audio(&mut self, sample_frames_wanted: u64) -> Option<AudioPayload> {
        let first = self.audio.pop_front()?;
        let mut merged = first;
        while (merged.samples.len() / 2) < sample_frames_wanted as usize {
            match self.audio.pop_front() {
                Some(next) => merged.samples.extend_from_slice(&next.samples),
                None => break,
            }
        }
        Some(merged)
    }

    pub fn video_depth(&self) -> usize {
        self.video.len()
    }

    pub fn audio_depth(&self) -> usize {
        self.audio.len()
    }

    pub fn engage_barrier(&mut self) {
        self.barrier = true;
    }

    pub fn barrier_engaged(&self) -> bool {
        self.barrier
    }

    pub fn post_barrier_writes(&self) -> u64 {
        self.post_barrier_writes
    }

    /// Video/audio admission skew in frame periods: positive means video is
    /// ahead of audio. `samples_per_frame` is interleaved sample frames per
    /// video frame at the channel rate.
    pub fn skew_frames(&self, sample_frames_per_video_frame: u64) -> i64 {
        if sample_frames_per_video_frame == 0 {
            return 0;
        }
        let audio_frames = self.admitted_audio_sample_frames / sample_frames_per_video_frame;
        self.admitted_video as i64 - audio_frames as i64
    }
}
