// crates/linecast-core/src/frame.rs
//
// Types that flow across the channels between producers, the control core,
// and the mux. No ffmpeg, no runtime handles; just plain data.

use crate::plan::SegmentId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Decoded media owned by the active segment.
    Content,
    /// Deliberate fallback (black video + silence): deficit fill or a planned
    /// pad segment. The only kind exempt from the frame-authority rule.
    Pad,
    /// Last-good frame re-emitted to extend the active segment while its
    /// decoder is momentarily behind.
    Hold,
}

/// Decoded video in presentation order. Producers attach media time only;
/// CT and origin are assigned at emission by the control core.
#[derive(Clone, Debug)]
pub struct VideoPayload {
    pub media_ts_us: i64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Interleaved PCM covering one video frame period.
#[derive(Clone, Debug)]
pub struct AudioPayload {
    pub media_ts_us: i64,
    pub rate: u32,
    pub samples: Vec<i16>,
}

/// One item from a producer, in media order. Video and audio share a single
/// gated channel so neither stream can run ahead of the other.
#[derive(Clone, Debug)]
pub enum MediaItem {
    Video(VideoPayload),
    Audio(AudioPayload),
}

/// A fully stamped frame on its way to the mux: one CT, one origin, one kind.
#[derive(Clone, Debug)]
pub struct OutputFrame {
    pub ct_us: u64,
    pub origin: SegmentId,
    pub kind: FrameKind,
    pub video: VideoPayload,
    /// Audio PTS is derived from `ct_us`, never locally incremented after
    /// attach. None means the audio stream stalls for this period; the mux
    /// must not fabricate silence in its place.
    pub audio: Option<AudioPayload>,
}

impl OutputFrame {
    /// The frame-authority rule checked at emission: origin matches the
    /// active segment, or the frame is explicitly pad.
    pub fn respects_frame_authority(&self, active: SegmentId) -> bool {
        self.origin == active || self.kind == FrameKind::Pad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(origin: u64, kind: FrameKind) -> OutputFrame {
        OutputFrame {
            ct_us: 0,
            origin: SegmentId(origin),
            kind,
            video: VideoPayload { media_ts_us: 0, width: 2, height: 2, data: vec![0; 16] },
            audio: None,
        }
    }

    #[test]
    fn content_frame_must_match_active() {
        assert!(frame(1, FrameKind::Content).respects_frame_authority(SegmentId(1)));
        assert!(!frame(1, FrameKind::Content).respects_frame_authority(SegmentId(2)));
        assert!(!frame(1, FrameKind::Hold).respects_frame_authority(SegmentId(2)));
    }

    #[test]
    fn pad_is_the_sole_exemption() {
        assert!(frame(1, FrameKind::Pad).respects_frame_authority(SegmentId(2)));
    }
}
