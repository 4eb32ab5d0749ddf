// crates/linecast-server/src/coordinator.rs
//
// Boundary coordinator: owns the plan horizon and every boundary's lifecycle.
// Preload and Switch are issued as one-shot declarative commands against
// absolute wall-clock deadlines on the master clock; there is no poll loop
// and no cadence-detected issuance path. No retries: a missed lead time, a
// stale ack or a mismatched commit is a planning/protocol failure, surfaced
// and never papered over.

use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;

use linecast_core::boundary::{BoundaryPhase, BoundaryRecord};
use linecast_core::config::Tunables;
use linecast_core::plan::{self, Fps, PlanError, PlannedSegment, SegmentId, SegmentSourceSpec};
use linecast_core::violation::Violation;

use crate::metrics::Metrics;

// ── Declarative commands and acks ─────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct PreloadCmd {
    pub segment_id: SegmentId,
    pub source: SegmentSourceSpec,
    pub planned_frame_count: u64,
    pub source_fps: Fps,
    pub target_boundary_utc_ms: i64,
}

#[derive(Clone, Debug)]
pub struct SwitchCmd {
    pub segment_id: SegmentId,
    pub target_boundary_utc_ms: i64,
}

#[derive(Clone, Debug)]
pub struct PreloadAck {
    pub segment_id: SegmentId,
    pub shadow_ready: bool,
    pub reason_if_not: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SwitchAck {
    pub segment_id: SegmentId,
    pub commit_ct_us: u64,
    pub switch_completion_utc_ms: i64,
    pub delta_ms_vs_target: i64,
}

#[derive(Clone, Debug)]
pub enum Command {
    Preload(PreloadCmd),
    Switch(SwitchCmd),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SubmitReport {
    pub accepted: usize,
    pub torn_down: Vec<u64>,
}

// ── Coordinator ───────────────────────────────────────────────────────────────

struct BoundaryEntry {
    seg: PlannedSegment,
    record: BoundaryRecord,
    /// When this segment goes on air (its predecessor's boundary).
    start_utc_ms: i64,
    preload_due_utc_ms: i64,
    switch_due_utc_ms: i64,
}

pub struct Coordinator {
    cfg: Tunables,
    entries: Vec<BoundaryEntry>,
    metrics: Arc<Metrics>,
    fatal: Option<Violation>,
}

impl Coordinator {
    pub fn new(cfg: Tunables, metrics: Arc<Metrics>) -> Self {
        Self { cfg, entries: Vec::new(), metrics, fatal: None }
    }

    pub fn fatal(&self) -> Option<Violation> {
        self.fatal
    }

    fn record_violation(&mut self, v: Violation, detail: &str) {
        if v.is_fatal() {
            error!("{} {detail}", v.tag());
            self.fatal = Some(v);
        } else {
            warn!("{} {detail}", v.tag());
        }
        self.metrics.record_violation(v);
    }

    fn horizon_tail_boundary(&self) -> Option<i64> {
        self.entries.last().map(|e| e.seg.scheduled_boundary_utc_ms)
    }

    /// Append a window to the horizon. The window is validated as a whole
    /// (contiguous, non-overlapping, monotonic); an infeasible boundary inside
    /// an otherwise valid window is torn down individually with
    /// LEAD_TIME_VIOLATION; fatal for that boundary, never repaired.
    pub fn submit_plan(
        &mut self,
        now_utc_ms: i64,
        segments: Vec<PlannedSegment>,
    ) -> Result<SubmitReport, PlanError> {
        plan::validate_window(self.horizon_tail_boundary(), &segments)?;

        let mut report = SubmitReport::default();
        let mut prev_boundary = self.horizon_tail_boundary();
        for seg in segments {
            // On-air instant: the predecessor's boundary, or for the first
            // segment of the session its own boundary minus its duration.
            let start_utc_ms = prev_boundary.unwrap_or_else(|| seg.start_utc_ms());
            prev_boundary = Some(seg.scheduled_boundary_utc_ms);

            let mut record = BoundaryRecord::new(seg.segment_id, start_utc_ms);
            if now_utc_ms + self.cfg.min_prefeed_lead_time_ms > start_utc_ms {
                record.teardown();
                self.record_violation(
                    Violation::LeadTime,
                    &format!(
                        "segment={} boundary={} lead_available_ms={}",
                        seg.segment_id,
                        start_utc_ms,
                        start_utc_ms - now_utc_ms
                    ),
                );
                report.torn_down.push(seg.segment_id.0);
            } else {
                report.accepted += 1;
            }

            self.entries.push(BoundaryEntry {
                start_utc_ms,
                preload_due_utc_ms: start_utc_ms - self.cfg.min_prefeed_lead_time_ms,
                switch_due_utc_ms: start_utc_ms - self.cfg.switch_epsilon_ms,
                seg,
                record,
            });
        }
        info!(
            "[coordinator] plan window: {} scheduled, {} torn down, horizon tail {:?}",
            report.accepted,
            report.torn_down.len(),
            self.horizon_tail_boundary()
        );
        Ok(report)
    }

    /// True when everything before `idx` is out of the way; the live/preview
    /// pair only holds one incoming segment at a time.
    fn predecessor_done(&self, idx: usize) -> bool {
        idx == 0 || self.entries[idx - 1].record.is_terminal()
    }

    /// Earliest pending absolute deadline, for the control thread's timer.
    pub fn next_deadline_utc_ms(&self) -> Option<i64> {
        let mut next: Option<i64> = None;
        for (idx, e) in self.entries.iter().enumerate() {
            if e.record.is_terminal() {
                continue;
            }
            let due = match e.record.phase() {
                BoundaryPhase::Pending if self.predecessor_done(idx) && !e.record.preload_issued() => {
                    e.preload_due_utc_ms
                }
                BoundaryPhase::Armed if e.record.switch_issued() => continue,
                _ => e.switch_due_utc_ms,
            };
            next = Some(next.map_or(due, |n: i64| n.min(due)));
        }
        next
    }

    /// Fire every deadline at or before `now`. Returns the commands to hand
    /// to the switch engine, in order.
    pub fn poll(&mut self, now_utc_ms: i64) -> Vec<Command> {
        let mut out = Vec::new();
        let mut deferred: Vec<(Violation, String)> = Vec::new();

        for idx in 0..self.entries.len() {
            let predecessor_done = self.predecessor_done(idx);
            let e = &mut self.entries[idx];
            if e.record.is_terminal() {
                continue;
            }

            if e.record.phase() == BoundaryPhase::Pending
                && predecessor_done
                && now_utc_ms >= e.preload_due_utc_ms
                && !e.record.preload_issued()
            {
                match e.record.mark_preload_issued() {
                    Ok(()) => {
                        let lead_ms = (e.start_utc_ms - now_utc_ms).max(0) as u64;
                        self.metrics.prefeed_lead_time_ms.observe(lead_ms);
                        out.push(Command::Preload(PreloadCmd {
                            segment_id: e.seg.segment_id,
                            source: e.seg.source.clone(),
                            planned_frame_count: e.seg.planned_frame_count,
                            source_fps: e.seg.fps,
                            target_boundary_utc_ms: e.start_utc_ms,
                        }));
                    }
                    Err(err) => deferred.push((Violation::DuplicateIssuance, err.to_string())),
                }
                continue;
            }

            if now_utc_ms >= e.switch_due_utc_ms {
                match e.record.phase() {
                    BoundaryPhase::Armed if !e.record.switch_issued() => {
                        match e.record.mark_switch_issued() {
                            Ok(()) => out.push(Command::Switch(SwitchCmd {
                                segment_id: e.seg.segment_id,
                                target_boundary_utc_ms: e.start_utc_ms,
                            })),
                            Err(err) => deferred.push((Violation::DuplicateIssuance, err.to_string())),
                        }
                    }
                    BoundaryPhase::Pending | BoundaryPhase::PreloadIssued => {
                        // Preload never issued or never acked in time; the
                        // boundary is lost. Tear it down; the live side keeps
                        // running (deficit fill preserves output liveness).
                        e.record.teardown();
                        deferred.push((
                            Violation::LeadTime,
                            format!("segment={} preload not ready by switch deadline", e.seg.segment_id),
                        ));
                    }
                    _ => {}
                }
            }
        }

        for (v, detail) in deferred {
            self.record_violation(v, &detail);
        }
        out
    }

    pub fn on_preload_ack(&mut self, ack: &PreloadAck) {
        let Some(e) = self.entries.iter_mut().find(|e| e.seg.segment_id == ack.segment_id) else {
            self.record_violation(
                Violation::DuplicateIssuance,
                &format!("preload ack for unknown segment {}", ack.segment_id),
            );
            return;
        };
        if e.record.is_terminal() {
            // A stale ack is a protocol violation, not noise.
            self.record_violation(
                Violation::DuplicateIssuance,
                &format!("stale preload ack for segment {}", ack.segment_id),
            );
            return;
        }
        if !ack.shadow_ready {
            e.record.teardown();
            let detail = format!(
                "segment={} preload failed: {}",
                ack.segment_id,
                ack.reason_if_not.as_deref().unwrap_or("unspecified")
            );
            self.record_violation(Violation::LeadTime, &detail);
            return;
        }
        if let Err(err) = e.record.mark_armed() {
            let detail = err.to_string();
            self.record_violation(Violation::DuplicateIssuance, &detail);
        }
    }

    /// Validate the live commit against the plan: the committed segment must
    /// be the planned one at the fired boundary, and the commit must land
    /// within tolerance of the declared instant.
    pub fn on_switch_ack(&mut self, ack: &SwitchAck) {
        let expected = self
            .entries
            .iter()
            .position(|e| e.record.phase() == BoundaryPhase::Armed && e.record.switch_issued());
        let Some(idx) = expected else {
            self.record_violation(
                Violation::DuplicateIssuance,
                &format!("stale switch ack for segment {}", ack.segment_id),
            );
            return;
        };
        if self.entries[idx].seg.segment_id != ack.segment_id {
            let detail = format!(
                "committed segment {} but plan expected {} at boundary {}",
                ack.segment_id, self.entries[idx].seg.segment_id, self.entries[idx].start_utc_ms
            );
            self.record_violation(Violation::PlanBoundaryMismatch, &detail);
            return;
        }

        if let Err(err) = self.entries[idx].record.mark_committed() {
            let detail = err.to_string();
            self.record_violation(Violation::DuplicateIssuance, &detail);
            return;
        }

        let delta = ack.delta_ms_vs_target;
        self.metrics.boundary_delta_ms.observe(delta.unsigned_abs());
        if delta.abs() > self.cfg.boundary_tolerance_ms {
            let detail = format!("segment={} delta_ms={delta}", ack.segment_id);
            self.record_violation(Violation::BoundaryTolerance, &detail);
        }
        info!(
            "BOUNDARY_ADVANCED segment={} commit_ct={} delta_ms={}",
            ack.segment_id, ack.commit_ct_us, delta
        );
    }

    /// Teardown is deferred until no boundary is mid-switch: armed-and-issued
    /// but uncommitted means a switch is in flight.
    pub fn safe_to_teardown(&self) -> bool {
        self.entries.iter().all(|e| {
            e.record.is_terminal()
                || e.record.phase() != BoundaryPhase::Armed
                || !e.record.switch_issued()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Tunables {
        Tunables { min_prefeed_lead_time_ms: 200, switch_epsilon_ms: 5, ..Tunables::default() }
    }

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

    fn ready_ack(id: u64) -> PreloadAck {
        PreloadAck { segment_id: SegmentId(id), shadow_ready: true, reason_if_not: None }
    }

    #[test]
    fn preload_fires_at_lead_and_switch_at_epsilon() {
        let mut c = Coordinator::new(cfg(), Metrics::new());
        // Segment 1 on air at 1000 (boundary 2500 − 45 frames × 33⅓ ms).
        c.submit_plan(0, vec![seg(1, 2_500, 45)]).unwrap();

        assert!(c.poll(799).is_empty());
        let cmds = c.poll(800); // 1000 − 200
        assert!(matches!(cmds.as_slice(), [Command::Preload(p)] if p.segment_id == SegmentId(1)));

        c.on_preload_ack(&ready_ack(1));
        assert!(c.poll(900).is_empty());
        let cmds = c.poll(995); // 1000 − 5
        assert!(matches!(cmds.as_slice(), [Command::Switch(s)] if s.target_boundary_utc_ms == 1_000));
        // One-shot: polling again issues nothing.
        assert!(c.poll(1_000).is_empty());
        assert!(c.fatal().is_none());
    }

    #[test]
    fn infeasible_boundary_is_torn_down_before_issuing() {
        let metrics = Metrics::new();
        let mut c = Coordinator::new(cfg(), Arc::clone(&metrics));
        // Boundary at now + 100 with a 200 ms minimum lead.
        let report = c.submit_plan(0, vec![seg(1, 200, 3)]).unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.torn_down, vec![1]);
        // Torn down; no preload, no switch, ever.
        assert!(c.poll(10_000).is_empty());
        assert!(c.fatal().is_none()); // boundary-fatal, not session-fatal
        assert_eq!(metrics.snapshot().boundary_violations_total, 1);
    }

    #[test]
    fn missed_preload_ack_cancels_the_boundary() {
        let mut c = Coordinator::new(cfg(), Metrics::new());
        c.submit_plan(0, vec![seg(1, 2_500, 45)]).unwrap();
        let _ = c.poll(800); // preload issued, never acked
        assert!(c.poll(995).is_empty()); // switch deadline passes → teardown
        assert!(c.poll(2_000).is_empty());
    }

    #[test]
    fn preload_for_next_segment_waits_for_predecessor_commit() {
        let mut c = Coordinator::new(cfg(), Metrics::new());
        // Segment 1 on air at 1000, segment 2 at 2500.
        c.submit_plan(0, vec![seg(1, 2_500, 45), seg(2, 4_000, 45)]).unwrap();
        let _ = c.poll(800);
        c.on_preload_ack(&ready_ack(1));
        let _ = c.poll(995);
        // Segment 1 issued but not committed: segment 2's preload stays put
        // even past its nominal instant (2300).
        assert!(c.poll(2_300).iter().all(|cmd| !matches!(cmd, Command::Preload(_))));
        c.on_switch_ack(&SwitchAck {
            segment_id: SegmentId(1),
            commit_ct_us: 0,
            switch_completion_utc_ms: 1_000,
            delta_ms_vs_target: 0,
        });
        let cmds = c.poll(2_301);
        assert!(matches!(cmds.as_slice(), [Command::Preload(p)] if p.segment_id == SegmentId(2)));
    }

    #[test]
    fn commit_of_unplanned_segment_is_fatal() {
        let mut c = Coordinator::new(cfg(), Metrics::new());
        c.submit_plan(0, vec![seg(1, 2_500, 45)]).unwrap();
        let _ = c.poll(800);
        c.on_preload_ack(&ready_ack(1));
        let _ = c.poll(995);
        c.on_switch_ack(&SwitchAck {
            segment_id: SegmentId(9),
            commit_ct_us: 0,
            switch_completion_utc_ms: 1_000,
            delta_ms_vs_target: 0,
        });
        assert_eq!(c.fatal(), Some(Violation::PlanBoundaryMismatch));
    }

    #[test]
    fn late_commit_is_metered_but_stands() {
        let metrics = Metrics::new();
        let mut c = Coordinator::new(cfg(), Arc::clone(&metrics));
        c.submit_plan(0, vec![seg(1, 2_500, 45)]).unwrap();
        let _ = c.poll(800);
        c.on_preload_ack(&ready_ack(1));
        let _ = c.poll(995);
        c.on_switch_ack(&SwitchAck {
            segment_id: SegmentId(1),
            commit_ct_us: 0,
            switch_completion_utc_ms: 1_100,
            delta_ms_vs_target: 100, // well past the 34 ms tolerance
        });
        assert!(c.fatal().is_none()); // deadline-authoritative: committed anyway
        assert_eq!(metrics.snapshot().boundary_violations_total, 1);
        assert_eq!(metrics.boundary_delta_ms.count(), 1);
    }

    #[test]
    fn not_ready_preload_ack_tears_the_boundary_down() {
        let mut c = Coordinator::new(cfg(), Metrics::new());
        c.submit_plan(0, vec![seg(1, 2_500, 45)]).unwrap();
        let _ = c.poll(800);
        c.on_preload_ack(&PreloadAck {
            segment_id: SegmentId(1),
            shadow_ready: false,
            reason_if_not: Some("asset unreadable".into()),
        });
        assert!(c.poll(995).is_empty()); // no switch for a dead boundary
        assert!(c.fatal().is_none());
    }

    #[test]
    fn overlapping_resubmission_is_refused() {
        let mut c = Coordinator::new(cfg(), Metrics::new());
        c.submit_plan(0, vec![seg(1, 2_500, 45)]).unwrap();
        let err = c.submit_plan(0, vec![seg(1, 2_500, 45)]).unwrap_err();
        assert!(matches!(err, PlanError::Overlap(_) | PlanError::DuplicateSegment(_)));
    }
}
