// crates/linecast-core/src/plan.rs
//
// Execution-plan records pushed by the external planner, plus window
// validation. Planning fields (`planned_frame_count`,
// `scheduled_boundary_utc_ms`) are authority; consumed, never recomputed.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable, monotonically assigned segment identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame rate as an exact rational. 29.97 is `30000/1001`, never a float.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fps {
    #[serde(rename = "fps_num")]
    pub num: u32,
    #[serde(rename = "fps_den")]
    pub den: u32,
}

impl Fps {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Content time (µs) of frame `idx`, computed from the index each call.
    ///
    /// For rates where `1e6 · den / num` is not integral (30 fps, 29.97 fps)
    /// the per-frame delta alternates between floor and ceil, but the sequence
    /// accumulates zero drift: frame 100 000 lands on the exact rational
    /// product, not on 100 000 copies of a rounded period.
    pub fn ct_at_frame(self, idx: u64) -> u64 {
        idx * 1_000_000 * u64::from(self.den) / u64::from(self.num)
    }

    /// Nominal frame period in µs (floor). Display/log use only; never
    /// accumulate this to build a timeline.
    pub fn nominal_frame_duration_us(self) -> u64 {
        1_000_000 * u64::from(self.den) / u64::from(self.num)
    }

    /// Wall-clock span of `frames` frames, in ms.
    pub fn frames_to_ms(self, frames: u64) -> i64 {
        (frames * 1_000 * u64::from(self.den) / u64::from(self.num)) as i64
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }
}

/// Where a segment's frames come from. Pad is a peer of File, not a
/// degenerate file: it has video-on-demand semantics downstream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentSourceSpec {
    File { asset_uri: String, start_frame: u64 },
    Pad,
}

/// One resolved playout unit from the planner.
///
/// `scheduled_boundary_utc_ms` is the absolute wall-clock instant at which
/// this segment ENDS and the next one goes on air. Only that instant governs
/// the switch; actual media length never does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlannedSegment {
    pub segment_id: SegmentId,
    pub source: SegmentSourceSpec,
    pub planned_frame_count: u64,
    pub scheduled_boundary_utc_ms: i64,
    #[serde(flatten)]
    pub fps: Fps,
    #[serde(default)]
    pub audio_rate: Option<u32>,
}

impl PlannedSegment {
    pub fn is_pad(&self) -> bool {
        matches!(self.source, SegmentSourceSpec::Pad)
    }

    /// Planned wall-clock duration derived from the planned frame count.
    pub fn planned_duration_ms(&self) -> i64 {
        self.fps.frames_to_ms(self.planned_frame_count)
    }

    /// Wall-clock instant this segment goes on air: its boundary minus its
    /// planned duration. For every segment after the first this coincides
    /// with the predecessor's boundary (the window is gap-free).
    pub fn start_utc_ms(&self) -> i64 {
        self.scheduled_boundary_utc_ms - self.planned_duration_ms()
    }
}

// ── Window validation ─────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("empty plan window")]
    Empty,
    #[error("duplicate segment id {0} in window")]
    DuplicateSegment(SegmentId),
    #[error("segment {0}: boundary does not advance past predecessor")]
    NonMonotonicBoundary(SegmentId),
    #[error("segment {segment_id}: {gap_ms} ms gap before segment start")]
    Gap { segment_id: SegmentId, gap_ms: i64 },
    #[error("segment {0}: window overlaps already-scheduled horizon")]
    Overlap(SegmentId),
}

/// Validate a submitted window: non-empty, strictly increasing boundaries,
/// gap-free internally and against the existing horizon tail.
///
/// `horizon_tail_boundary_utc_ms` is the boundary of the last segment already
/// scheduled (None on first submit). A window starting at or before that
/// boundary is an overlap; resubmitting the same window is rejected, not
/// silently accepted.
///
/// One frame period of slack is allowed on gap checks; planners quantize
/// boundaries to frames and ms truncation may leave a sub-frame residue.
pub fn validate_window(
    horizon_tail_boundary_utc_ms: Option<i64>,
    segments: &[PlannedSegment],
) -> Result<(), PlanError> {
    if segments.is_empty() {
        return Err(PlanError::Empty);
    }

    for (i, seg) in segments.iter().enumerate() {
        if segments[..i].iter().any(|s| s.segment_id == seg.segment_id) {
            return Err(PlanError::DuplicateSegment(seg.segment_id));
        }

        let slack_ms = (seg.fps.nominal_frame_duration_us() / 1_000) as i64 + 1;
        let expected_start = match i {
            0 => match horizon_tail_boundary_utc_ms {
                Some(tail) => {
                    if seg.scheduled_boundary_utc_ms <= tail {
                        return Err(PlanError::Overlap(seg.segment_id));
                    }
                    Some(tail)
                }
                None => None, // first window anchors the session
            },
            _ => Some(segments[i - 1].scheduled_boundary_utc_ms),
        };

        if let Some(start) = expected_start {
            if seg.scheduled_boundary_utc_ms <= start {
                return Err(PlanError::NonMonotonicBoundary(seg.segment_id));
            }
            // A zero-frame segment is a placeholder whose whole window is
            // fill: its planned duration intentionally says nothing about
            // the window span.
            if seg.planned_frame_count > 0 {
                let gap_ms = (seg.start_utc_ms() - start).abs();
                if gap_ms > slack_ms {
                    return Err(PlanError::Gap { segment_id: seg.segment_id, gap_ms });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(id: u64, boundary_ms: i64, frames: u64) -> PlannedSegment {
        PlannedSegment {
            segment_id: SegmentId(id),
            source: SegmentSourceSpec::Pad,
            planned_frame_count: frames,
            scheduled_boundary_utc_ms: boundary_ms,
            fps: Fps::new(30, 1),
            audio_rate: None,
        }
    }

    #[test]
    fn ct_at_frame_is_drift_free_at_ntsc_rate() {
        let fps = Fps::new(30_000, 1_001);
        // Exact rational product, not an accumulated rounded period.
        assert_eq!(
            fps.ct_at_frame(100_000),
            100_000u64 * 1_000_000 * 1_001 / 30_000
        );
        // Per-frame deltas stay within 1 µs of each other.
        let d0 = fps.ct_at_frame(1) - fps.ct_at_frame(0);
        let d1 = fps.ct_at_frame(2) - fps.ct_at_frame(1);
        assert!(d0.abs_diff(d1) <= 1);
    }

    #[test]
    fn segment_start_is_boundary_minus_duration() {
        let s = seg(1, 10_000, 45); // 45 frames @ 30fps = 1500 ms
        assert_eq!(s.planned_duration_ms(), 1_500);
        assert_eq!(s.start_utc_ms(), 8_500);
    }

    #[test]
    fn contiguous_window_validates() {
        let w = vec![seg(1, 1_500, 45), seg(2, 2_000, 15), seg(3, 3_500, 45)];
        assert_eq!(validate_window(None, &w), Ok(()));
    }

    #[test]
    fn gap_in_window_is_rejected() {
        // Segment 2 spans 500 ms but starts 1000 ms after segment 1's boundary.
        let w = vec![seg(1, 1_500, 45), seg(2, 3_000, 15)];
        assert!(matches!(
            validate_window(None, &w),
            Err(PlanError::Gap { segment_id: SegmentId(2), .. })
        ));
    }

    #[test]
    fn zero_frame_placeholder_spans_a_window_without_a_gap_error() {
        // Segment 2 has no media at all; its 500 ms window is all fill.
        let w = vec![seg(1, 1_500, 45), seg(2, 2_000, 0), seg(3, 3_500, 45)];
        assert_eq!(validate_window(None, &w), Ok(()));
    }

    #[test]
    fn resubmitting_same_window_is_overlap() {
        let w = vec![seg(4, 5_000, 45)];
        // Horizon already ends at 5000; the same window again must be refused.
        assert_eq!(
            validate_window(Some(5_000), &w),
            Err(PlanError::Overlap(SegmentId(4)))
        );
    }

    #[test]
    fn duplicate_ids_in_window_are_rejected() {
        let w = vec![seg(7, 1_500, 45), seg(7, 2_000, 15)];
        assert_eq!(
            validate_window(None, &w),
            Err(PlanError::DuplicateSegment(SegmentId(7)))
        );
    }

    #[test]
    fn plan_record_round_trips_wire_field_names() {
        let s = seg(9, 1_500, 45);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"fps_num\":30"));
        assert!(json.contains("\"fps_den\":1"));
        let back: PlannedSegment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
