// crates/linecast-media/src/producer.rs
//
// One producer per segment. A producer is time-blind after lock: it never
// reads CT or the wall clock, never compares media time to a deadline, and
// never drops frames on its own account. It decodes in media order into a
// bounded channel whose capacity IS the slot gate; a blocking send is the
// suspend, a freed slot is the resume, one threshold for both directions,
// and video and audio share the channel so neither stream can run ahead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info};
use parking_lot::Mutex;

use linecast_core::frame::MediaItem;
use linecast_core::plan::{Fps, SegmentId};

use crate::decode::{probe_measured_fps, SegmentDecoder};
use crate::fps::{choose_resample, Cadence};
use crate::pad::PadSource;

/// Packet timestamps sampled when second-guessing a container's fps report.
const FPS_PROBE_SAMPLES: usize = 48;

/// Decoder-exhaustion report. An event within the segment; never a boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EofReport {
    pub segment_id: SegmentId,
    pub frames_delivered: u64,
    pub planned_frame_count: u64,
}

impl EofReport {
    /// Media ran out before the planned count; the deficit the filler will
    /// have to cover.
    pub fn deficit_frames(&self) -> u64 {
        self.planned_frame_count.saturating_sub(self.frames_delivered)
    }
}

/// Events from producer threads to the control core. Also the control
/// thread's wakeup source: `FrameQueued` is sent with `try_send` and dropped
/// when the channel is full (coalesced wakeups).
#[derive(Clone, Debug)]
pub enum ProducerEvent {
    /// First frame decoded and parked in the gate; the preview is shadow-ready.
    ShadowReady { segment_id: SegmentId },
    FrameQueued { segment_id: SegmentId },
    DecoderEof { segment_id: SegmentId, frames_delivered: u64, planned_frame_count: u64 },
    Fault { segment_id: SegmentId, message: String },
}

/// Capability surface shared by every producer kind. Pad is a peer of File
/// with video-on-demand semantics, not a degenerate file producer.
pub trait FrameSource {
    /// Release the source into full production. For a file producer this
    /// lifts the shadow hold placed after the first frame.
    fn start(&mut self);
    /// Non-blocking poll for the next item in media order.
    fn poll_frame(&mut self) -> Option<MediaItem>;
    fn signal_stop(&mut self);
    fn eof_observed(&self) -> Option<EofReport>;
}

// ── File producer ─────────────────────────────────────────────────────────────

pub struct FileProducer {
    segment_id: SegmentId,
    /// None only during teardown; dropping the receiver is what unblocks a
    /// thread parked on the gate.
    items: Option<Receiver<MediaItem>>,
    eof: Arc<Mutex<Option<EofReport>>>,
    stop: Arc<AtomicBool>,
    release: Option<Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

impl FileProducer {
    /// Spawn the decode thread for one file segment. The thread decodes the
    /// first video frame into the gate, reports shadow-ready, then parks
    /// until `start()`; no run-ahead decode while in shadow.
    pub fn spawn(
        segment_id: SegmentId,
        asset_uri: String,
        start_frame: u64,
        planned_frame_count: u64,
        source_fps: Fps,
        output_fps: Fps,
        gate_depth: usize,
        events: Sender<ProducerEvent>,
    ) -> Self {
        let (item_tx, item_rx) = bounded::<MediaItem>(gate_depth.max(2));
        let (release_tx, release_rx) = bounded::<()>(1);
        let eof: Arc<Mutex<Option<EofReport>>> = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let eof_cell = Arc::clone(&eof);
        let stop_flag = Arc::clone(&stop);
        let join = thread::spawn(move || {
            decode_loop(
                segment_id, &asset_uri, start_frame, planned_frame_count,
                source_fps, output_fps,
                &item_tx, &release_rx, &events, &eof_cell, &stop_flag,
            );
        });

        Self { segment_id, items: Some(item_rx), eof, stop, release: Some(release_tx), join: Some(join) }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }
}

impl FrameSource for FileProducer {
    fn start(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
    }

    fn poll_frame(&mut self) -> Option<MediaItem> {
        self.items.as_ref()?.try_recv().ok()
    }

    fn signal_stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the release sender unparks a thread still in shadow.
        self.release = None;
    }

    fn eof_observed(&self) -> Option<EofReport> {
        *self.eof.lock()
    }
}

impl Drop for FileProducer {
    fn drop(&mut self) {
        self.signal_stop();
        // Drop the receiver first: a thread blocked on the gate sees the
        // disconnect and exits, so the join below cannot hang.
        self.items = None;
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_loop(
    segment_id: SegmentId,
    asset_uri: &str,
    start_frame: u64,
    planned_frame_count: u64,
    source_fps: Fps,
    output_fps: Fps,
    items: &Sender<MediaItem>,
    release: &Receiver<()>,
    events: &Sender<ProducerEvent>,
    eof: &Mutex<Option<EofReport>>,
    stop: &AtomicBool,
) {
    let measured = probe_measured_fps(asset_uri, FPS_PROBE_SAMPLES);
    let mut dec = match SegmentDecoder::open(asset_uri, start_frame, source_fps) {
        Ok(d) => d,
        Err(e) => {
            error!("[producer] segment {segment_id}: open failed: {e}");
            *eof.lock() = Some(EofReport { segment_id, frames_delivered: 0, planned_frame_count });
            let _ = events.send(ProducerEvent::Fault { segment_id, message: e.to_string() });
            return;
        }
    };

    let reported = dec.reported_fps();
    let mode = choose_resample(reported, measured, output_fps);
    let mut cadence = Cadence::new(mode, reported.unwrap_or(output_fps), output_fps);
    debug!(
        "[producer] segment {segment_id}: reported_fps={reported:?} measured={measured:?} resample={mode:?}"
    );

    let mut frames_delivered: u64 = 0;
    let mut shadow_ready = false;

    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        match dec.next_item() {
            Some(MediaItem::Video(v)) => {
                for _ in 0..cadence.copies_for_next() {
                    if items.send(MediaItem::Video(v.clone())).is_err() {
                        return; // consumer gone; cancelled
                    }
                    frames_delivered += 1;
                    if !shadow_ready {
                        // First frame is parked in the gate; hold here until
                        // commit releases us. No run-ahead decode in shadow.
                        shadow_ready = true;
                        let _ = events.send(ProducerEvent::ShadowReady { segment_id });
                        if release.recv().is_err() {
                            return; // torn down before commit
                        }
                    }
                    let _ = events.try_send(ProducerEvent::FrameQueued { segment_id });
                }
            }
            Some(item @ MediaItem::Audio(_)) => {
                if items.send(item).is_err() {
                    return;
                }
                let _ = events.try_send(ProducerEvent::FrameQueued { segment_id });
            }
            None => {
                let report = EofReport { segment_id, frames_delivered, planned_frame_count };
                *eof.lock() = Some(report);
                info!(
                    "DECODER_EOF segment={segment_id} frames_delivered={frames_delivered} planned={planned_frame_count}"
                );
                let _ = events.send(ProducerEvent::DecoderEof {
                    segment_id,
                    frames_delivered,
                    planned_frame_count,
                });
                return;
            }
        }
    }
}

// ── Tagged producer kinds ─────────────────────────────────────────────────────

/// The per-slot source the control core drives: file decode, on-demand pad,
/// or a scripted source in tests.
pub enum SegmentFeed {
    File(FileProducer),
    Pad(PadSource),
    #[cfg(feature = "sim")]
    Sim(crate::sim::SimSource),
}

impl SegmentFeed {
    /// On-demand sources synthesize at selection time and are never drained
    /// into a buffer ahead of emission.
    pub fn on_demand(&self) -> bool {
        matches!(self, SegmentFeed::Pad(_))
    }

    /// Synthesize one pad pair. Only meaningful for on-demand feeds.
    pub fn synth_pad_pair(&mut self) -> Option<(linecast_core::frame::VideoPayload, linecast_core::frame::AudioPayload)> {
        match self {
            SegmentFeed::Pad(p) => Some(p.synth_pair()),
            _ => None,
        }
    }
}

impl FrameSource for SegmentFeed {
    fn start(&mut self) {
        match self {
            SegmentFeed::File(p) => p.start(),
            SegmentFeed::Pad(_) => {}
            #[cfg(feature = "sim")]
            SegmentFeed::Sim(s) => s.start(),
        }
    }

    fn poll_frame(&mut self) -> Option<MediaItem> {
        match self {
            SegmentFeed::File(p) => p.poll_frame(),
            // Pad is pulled at emission, never drained ahead.
            SegmentFeed::Pad(_) => None,
            #[cfg(feature = "sim")]
            SegmentFeed::Sim(s) => s.poll_frame(),
        }
    }

    fn signal_stop(&mut self) {
        match self {
            SegmentFeed::File(p) => p.signal_stop(),
            SegmentFeed::Pad(_) => {}
            #[cfg(feature = "sim")]
            SegmentFeed::Sim(s) => s.signal_stop(),
        }
    }

    fn eof_observed(&self) -> Option<EofReport> {
        match self {
            SegmentFeed::File(p) => p.eof_observed(),
            SegmentFeed::Pad(_) => None,
            #[cfg(feature = "sim")]
            SegmentFeed::Sim(s) => s.eof_observed(),
        }
    }
}
