// crates/linecast-server/src/engine/mod.rs
//
// The switch engine: preload → shadow → armed → commit on the runtime side,
// plus frame staging. Everything here runs on the control thread; CT
// assignment, active-segment rebinds and frame-source selection are one
// single-writer sequence, which is what makes the authority transfer at a
// seam atomic: the commit and the origin stamp of the first post-commit
// frame happen in the same tick with nothing interleaved.

pub mod buffers;

use std::sync::Arc;

use log::{debug, error, info, warn};

use linecast_core::config::Tunables;
use linecast_core::frame::{AudioPayload, FrameKind, OutputFrame, VideoPayload};
use linecast_core::plan::SegmentId;
use linecast_core::timeline::ContentClock;
use linecast_core::violation::Violation;

use linecast_media::producer::{FrameSource, ProducerEvent, SegmentFeed};

use crate::coordinator::{PreloadAck, PreloadCmd, SwitchAck, SwitchCmd};
use crate::filler::DeficitFiller;
use crate::metrics::Metrics;

use buffers::SegmentBuffer;

struct Slot {
    segment_id: SegmentId,
    feed: SegmentFeed,
    buffer: SegmentBuffer,
    shadow_ready: bool,
    eof_noted: bool,
}

enum ShadowPoll {
    NotYet,
    Ready,
    Dead(String),
}

pub struct Engine {
    cfg: Tunables,
    timeline: ContentClock,
    live: Option<Slot>,
    preview: Option<Slot>,
    /// Set once a Switch command arms the pair; cleared at commit.
    armed_target_utc_ms: Option<i64>,
    /// Known from the Preload command; staging never runs content past the
    /// declared boundary ahead of its commit.
    preview_target_utc_ms: Option<i64>,
    last_video: Option<VideoPayload>,
    filler: DeficitFiller,
    metrics: Arc<Metrics>,
    violations: Vec<Violation>,
    fatal: Option<Violation>,
    skew_flagged: bool,
    samples_per_frame: u64,
}

impl Engine {
    pub fn new(cfg: Tunables, epoch_utc_ms: i64, metrics: Arc<Metrics>) -> Self {
        let filler =
            DeficitFiller::new(cfg.pad_width, cfg.pad_height, cfg.output_fps, cfg.audio_rate);
        let samples_per_frame = u64::from(cfg.audio_rate) * u64::from(cfg.output_fps.den)
            / u64::from(cfg.output_fps.num);
        // SegmentId(0) is the off-air placeholder; the first commit rebinds
        // before any frame is stamped.
        let timeline = ContentClock::new(epoch_utc_ms, cfg.output_fps, SegmentId(0));
        Self {
            cfg,
            timeline,
            live: None,
            preview: None,
            armed_target_utc_ms: None,
            preview_target_utc_ms: None,
            last_video: None,
            filler,
            metrics,
            violations: Vec::new(),
            fatal: None,
            skew_flagged: false,
            samples_per_frame,
        }
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn fatal(&self) -> Option<Violation> {
        self.fatal
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn active_segment(&self) -> SegmentId {
        self.timeline.active_segment()
    }

    pub fn peek_ct_us(&self) -> u64 {
        self.timeline.peek_ct_us()
    }

    pub fn live_depth(&self) -> usize {
        self.live.as_ref().map_or(0, |l| l.buffer.video_depth())
    }

    pub fn deficit_engaged(&self) -> bool {
        self.filler.is_engaged()
    }

    /// Absolute instant the control thread must wake at to execute a commit.
    pub fn next_deadline_utc_ms(&self) -> Option<i64> {
        self.armed_target_utc_ms
    }

    fn record(&mut self, v: Violation, detail: &str) {
        if v.is_fatal() {
            error!("{} {detail}", v.tag());
            self.fatal = Some(v);
        } else {
            warn!("{} {detail}", v.tag());
        }
        self.violations.push(v);
        self.metrics.record_violation(v);
    }

    // ── Preload / shadow ─────────────────────────────────────────────────────

    /// Install the incoming segment on the preview side of the pair. The
    /// origin mapping is installed here, before the buffer admits anything:
    /// the preview buffer is tagged with the incoming segment at creation, so
    /// the first admitted frame already carries the origin the commit will
    /// rebind to.
    pub fn on_preload(&mut self, cmd: &PreloadCmd, feed: SegmentFeed) -> Option<PreloadAck> {
        if self.armed_target_utc_ms.is_some() {
            // No-Preload-while-Armed: resetting an armed pair is fatal.
            self.record(
                Violation::ResetWhileArmed,
                &format!("preload for segment {} while pair is armed", cmd.segment_id),
            );
            return None;
        }
        if self.preview.is_some() {
            self.record(
                Violation::DuplicateIssuance,
                &format!("preload for segment {} while preview occupied", cmd.segment_id),
            );
            return None;
        }

        let on_demand = feed.on_demand();
        let mut slot = Slot {
            segment_id: cmd.segment_id,
            buffer: SegmentBuffer::new(cmd.segment_id),
            feed,
            shadow_ready: false,
            eof_noted: false,
        };
        self.preview_target_utc_ms = Some(cmd.target_boundary_utc_ms);

        // Pad previews are video-on-demand and a zero-frame preview has
        // nothing to cache: both are shadow-ready at once, bypassing the
        // content-before-pad gate.
        if on_demand || cmd.planned_frame_count == 0 {
            slot.shadow_ready = true;
            self.preview = Some(slot);
            self.on_shadow_ready();
            return Some(PreloadAck {
                segment_id: cmd.segment_id,
                shadow_ready: true,
                reason_if_not: None,
            });
        }

        self.preview = Some(slot);
        self.poll_shadow()
    }

    /// Try to cache the preview's first frame; and only the first frame; a
    /// producer in shadow is parked, not decoding ahead. Returns the preload
    /// ack at the moment the preview becomes (or fails to become) ready.
    pub fn poll_shadow(&mut self) -> Option<PreloadAck> {
        let outcome = {
            let slot = self.preview.as_mut()?;
            if slot.shadow_ready {
                return None;
            }
            while slot.buffer.video_depth() == 0 {
                match slot.feed.poll_frame() {
                    Some(item) => {
                        let _ = slot.buffer.admit(item);
                    }
                    None => break,
                }
            }
            if slot.buffer.video_depth() > 0 {
                slot.shadow_ready = true;
                ShadowPoll::Ready
            } else if slot.feed.eof_observed().is_some() {
                ShadowPoll::Dead("decoder delivered no frames".into())
            } else {
                ShadowPoll::NotYet
            }
        };

        match outcome {
            ShadowPoll::NotYet => None,
            ShadowPoll::Ready => {
                let segment_id = self.preview.as_ref().map(|s| s.segment_id)?;
                self.on_shadow_ready();
                Some(PreloadAck { segment_id, shadow_ready: true, reason_if_not: None })
            }
            ShadowPoll::Dead(reason) => {
                let slot = self.preview.take()?;
                self.preview_target_utc_ms = None;
                Some(PreloadAck {
                    segment_id: slot.segment_id,
                    shadow_ready: false,
                    reason_if_not: Some(reason),
                })
            }
        }
    }

    /// Deferred write barrier: the outgoing live buffer is sealed only once
    /// the preview shadow is ready. Post-barrier writes are refused and
    /// counted by the buffer itself.
    fn on_shadow_ready(&mut self) {
        if let Some(live) = self.live.as_mut() {
            if !live.buffer.barrier_engaged() {
                live.buffer.engage_barrier();
                debug!("[engine] write barrier engaged on segment {}", live.segment_id);
            }
        }
    }

    pub fn on_producer_event(&mut self, ev: &ProducerEvent) -> Option<PreloadAck> {
        match ev {
            ProducerEvent::ShadowReady { .. } | ProducerEvent::FrameQueued { .. } => {
                self.poll_shadow()
            }
            ProducerEvent::DecoderEof { .. } => {
                self.note_live_eof();
                self.poll_shadow()
            }
            ProducerEvent::Fault { segment_id, message } => {
                if self.preview.as_ref().is_some_and(|s| s.segment_id == *segment_id) {
                    let slot = self.preview.take();
                    self.preview_target_utc_ms = None;
                    return slot.map(|s| PreloadAck {
                        segment_id: s.segment_id,
                        shadow_ready: false,
                        reason_if_not: Some(message.clone()),
                    });
                }
                error!("[engine] producer fault on segment {segment_id}: {message}");
                None
            }
        }
    }

    // ── Feeding ──────────────────────────────────────────────────────────────

    /// Pull decoded items from the live producer into the live buffer, up to
    /// the gate depth. Never past the write barrier; never for on-demand pad
    /// (synthesized at selection); never for the preview (shadow caches
    /// exactly one frame via `poll_shadow`).
    pub fn drain_feeds(&mut self) {
        let gate = self.cfg.producer_gate_depth;
        if let Some(live) = self.live.as_mut() {
            if !live.buffer.barrier_engaged() && !live.feed.on_demand() {
                while live.buffer.video_depth() < gate {
                    match live.feed.poll_frame() {
                        Some(item) => {
                            let _ = live.buffer.admit(item);
                        }
                        None => break,
                    }
                }
            }
        }
        self.note_live_eof();
    }

    /// Surface live-decoder EOF once: DECODER_EOF is an event within the
    /// segment, and EARLY_EOF is raised alongside it when media fell short of
    /// the planned count.
    fn note_live_eof(&mut self) {
        let report = {
            let Some(live) = self.live.as_mut() else { return };
            if live.eof_noted {
                return;
            }
            match live.feed.eof_observed() {
                Some(r) => {
                    live.eof_noted = true;
                    r
                }
                None => return,
            }
        };
        info!(
            "DECODER_EOF segment={} frames_delivered={} planned={}",
            report.segment_id, report.frames_delivered, report.planned_frame_count
        );
        if report.deficit_frames() > 0 {
            self.record(
                Violation::EarlyEof,
                &format!(
                    "segment={} deficit_frames={}",
                    report.segment_id,
                    report.deficit_frames()
                ),
            );
        }
    }

    // ── Arm / commit ─────────────────────────────────────────────────────────

    pub fn on_switch(&mut self, cmd: &SwitchCmd) {
        match self.preview.as_ref() {
            Some(s) if s.segment_id == cmd.segment_id && s.shadow_ready => {
                self.armed_target_utc_ms = Some(cmd.target_boundary_utc_ms);
            }
            Some(s) => {
                self.record(
                    Violation::DuplicateIssuance,
                    &format!(
                        "switch for segment {} but preview {} is not armed-ready",
                        cmd.segment_id, s.segment_id
                    ),
                );
            }
            None => {
                self.record(
                    Violation::PlanBoundaryMismatch,
                    &format!("switch for segment {} with no preview installed", cmd.segment_id),
                );
            }
        }
    }

    /// Execute the commit once the declared instant has arrived. The deadline
    /// is authoritative: eligibility never delays a due commit, it only
    /// shapes what the first post-commit tick emits. Live EOF therefore
    /// completes a switch with no buffer-depth wait, and a preview that
    /// reached EOF with some frames commits with whatever it has.
    pub fn maybe_commit(&mut self, now_utc_ms: i64) -> Option<SwitchAck> {
        let target = self.armed_target_utc_ms?;
        if now_utc_ms < target {
            return None;
        }
        self.execute_commit(now_utc_ms, target)
    }

    fn execute_commit(&mut self, now_utc_ms: i64, target_utc_ms: i64) -> Option<SwitchAck> {
        let Some(incoming) = self.preview.take() else {
            self.record(Violation::FrameAuthorityVacuum, "armed commit with no preview installed");
            self.armed_target_utc_ms = None;
            return None;
        };

        // PAD→CONTENT seam: a frame already cached in the incoming buffer is
        // popped this same tick, so the swap must fire ahead of selection;
        // this is that forced firing.
        if !incoming.feed.on_demand() && incoming.buffer.video_depth() > 0 {
            debug!(
                "CONTENT_SEAM_OVERRIDE segment={} cached_frames={}",
                incoming.segment_id,
                incoming.buffer.video_depth()
            );
        }

        let first_commit = self.live.is_none();
        if let Some(mut old) = self.live.take() {
            // Truncation happens here, at the boundary and not earlier:
            // residual frames of the outgoing segment are discarded with it.
            let residual = old.buffer.video_depth();
            if residual > 0 {
                debug!(
                    "[engine] segment {}: {residual} residual frames discarded at boundary",
                    old.segment_id
                );
            }
            old.feed.signal_stop();
            // Producer and live buffer for the outgoing segment are destroyed
            // only now; after the incoming commit; so the handoff is atomic.
        }

        let mut incoming = incoming;
        if first_commit {
            // CT 0 maps to the first on-air instant, not process start; the
            // steady-state relation `wall ≈ epoch + CT` holds from here on.
            self.timeline.anchor_epoch(target_utc_ms);
        }
        let commit_ct_us = self.timeline.commit_switch(incoming.segment_id);
        incoming.feed.start(); // lift the shadow hold
        let segment_id = incoming.segment_id;
        self.live = Some(incoming);
        self.armed_target_utc_ms = None;
        self.preview_target_utc_ms = None;

        // Flush the cached shadow frame into the active buffer immediately.
        self.drain_feeds();

        if let Some(duration_ms) = self.filler.disengage(now_utc_ms) {
            self.metrics.content_deficit_duration_ms.observe(duration_ms.max(0) as u64);
        }

        let delta_ms_vs_target = now_utc_ms - target_utc_ms;
        info!("SWITCH_COMMITTED segment={segment_id} commit_ct={commit_ct_us} delta_ms={delta_ms_vs_target}");
        Some(SwitchAck {
            segment_id,
            commit_ct_us,
            switch_completion_utc_ms: now_utc_ms,
            delta_ms_vs_target,
        })
    }

    // ── Staging ──────────────────────────────────────────────────────────────

    /// Compute the `(decision, origin)` for the next frame and stamp it.
    /// Called once per output slot; commit (if due) has already run this
    /// tick, so selection always sees the post-swap active side.
    pub fn stage(&mut self, now_utc_ms: i64) -> Option<OutputFrame> {
        if self.fatal.is_some() || self.live.is_none() {
            return None;
        }

        // Content never outruns a declared boundary: frames whose CT maps at
        // or past the next boundary wait for that boundary's commit.
        let horizon = self.armed_target_utc_ms.or(self.preview_target_utc_ms);
        if let Some(t) = horizon {
            if self.timeline.ct_to_utc_ms(self.timeline.peek_ct_us()) >= t {
                return None;
            }
        }

        enum Pick {
            Content(VideoPayload, Option<AudioPayload>),
            PadSegment,
            Deficit,
            Hold(VideoPayload),
            Vacuum,
        }

        let spf = self.samples_per_frame;
        let pick = {
            let Some(live) = self.live.as_mut() else { return None };
            if let Some(v) = live.buffer.pop_video() {
                let a = live.buffer.pop_audio(spf);
                Pick::Content(v, a)
            } else if live.feed.on_demand() {
                // CONTENT→PAD seam: pad eligibility never waits on video
                // depth; there is no video buffer to wait for.
                Pick::PadSegment
            } else if live.feed.eof_observed().is_some() {
                Pick::Deficit
            } else if let Some(v) = self.last_video.clone() {
                Pick::Hold(v)
            } else {
                Pick::Vacuum
            }
        };

        let (kind, video, audio) = match pick {
            Pick::Content(v, a) => (FrameKind::Content, v, a),
            Pick::PadSegment => {
                let Some((v, a)) = self.live.as_mut().and_then(|l| l.feed.synth_pad_pair()) else {
                    self.record(Violation::FrameAuthorityVacuum, "pad segment failed to synthesize");
                    return None;
                };
                (FrameKind::Pad, v, Some(a))
            }
            Pick::Deficit => {
                if !self.filler.is_engaged() {
                    let gap_ms = horizon.map_or(0, |t| (t - now_utc_ms).max(0));
                    self.filler.engage(now_utc_ms, self.timeline.peek_ct_us(), gap_ms);
                }
                let (v, a) = self.filler.fill_pair();
                (FrameKind::Pad, v, Some(a))
            }
            Pick::Hold(v) => (FrameKind::Hold, v, None),
            Pick::Vacuum => {
                self.record(
                    Violation::FrameAuthorityVacuum,
                    "active buffer empty, no pad path, nothing to hold",
                );
                return None;
            }
        };

        let live_depth = self.live.as_ref().map_or(0, |l| l.buffer.video_depth());
        if kind == FrameKind::Pad && live_depth >= self.cfg.steady_state_entry_depth {
            self.record(Violation::PadWhileDepthHigh, &format!("depth={live_depth}"));
        }

        let skew = self.live.as_ref().map_or(0, |l| l.buffer.skew_frames(spf));
        if skew.unsigned_abs() > self.cfg.backpressure_bound {
            if !self.skew_flagged {
                self.skew_flagged = true;
                self.record(Violation::BackpressureAsymmetry, &format!("skew_frames={skew}"));
            }
        } else {
            self.skew_flagged = false;
        }

        let stamp = self.timeline.stamp();
        let frame = OutputFrame { ct_us: stamp.ct_us, origin: stamp.origin, kind, video, audio };

        // Defence in depth: selection and commit share this thread and this
        // tick, so the stamp must already match the active segment. A
        // mismatch surfacing here is a genuine bleed.
        if !frame.respects_frame_authority(self.timeline.active_segment()) {
            self.record(
                Violation::StaleFrameBleed,
                &format!(
                    "origin={} active={} kind={:?}",
                    frame.origin,
                    self.timeline.active_segment(),
                    frame.kind
                ),
            );
            return None;
        }

        if kind != FrameKind::Hold {
            self.last_video = Some(frame.video.clone());
        }
        Some(frame)
    }

    #[cfg(test)]
    pub(crate) fn live_feed_mut(&mut self) -> Option<&mut SegmentFeed> {
        self.live.as_mut().map(|l| &mut l.feed)
    }

    /// Stop every producer. Called on session teardown after the boundary
    /// machinery is in a stable state.
    pub fn shutdown(&mut self) {
        if let Some(live) = self.live.as_mut() {
            live.feed.signal_stop();
        }
        if let Some(preview) = self.preview.as_mut() {
            preview.feed.signal_stop();
        }
    }
}
