// crates/linecast-server/src/session.rs
//
// Session wiring: one control thread (coordinator + switch engine + content
// clock), one mux thread, and the channels between them. The control thread
// suspends on a single merged wait; producer events, the staged-frame send
// into the output queue, intake commands, and an absolute-deadline timer on
// the master clock. No poll loops anywhere in the control path.

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use linecast_core::clock::MasterClock;
use linecast_core::config::Tunables;
use linecast_core::frame::OutputFrame;
use linecast_core::plan::{PlanError, PlannedSegment, SegmentSourceSpec};

use linecast_media::pad::PadSource;
use linecast_media::producer::{FileProducer, ProducerEvent, SegmentFeed};

use crate::coordinator::{Command, Coordinator, PreloadCmd, SubmitReport};
use crate::engine::Engine;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::mux::run_mux;

/// Requests into the control thread. Replies travel a bounded(1) channel the
/// caller blocks on (HTTP handlers do so via `spawn_blocking`).
pub enum ControlMsg {
    SubmitPlan {
        segments: Vec<PlannedSegment>,
        reply: Sender<Result<SubmitReport, PlanError>>,
    },
    Shutdown,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub session_id: String,
    pub epoch_utc_ms: i64,
    pub ct_us: u64,
    /// 0 means off-air (nothing committed yet).
    pub active_segment: u64,
    pub live_depth: usize,
    pub deficit_engaged: bool,
    pub fatal: Option<String>,
    pub metrics: MetricsSnapshot,
}

pub struct Session {
    pub ctrl_tx: Sender<ControlMsg>,
    pub ts_tx: broadcast::Sender<Bytes>,
    pub status: Arc<Mutex<StatusSnapshot>>,
    control: Option<thread::JoinHandle<()>>,
    mux: Option<thread::JoinHandle<()>>,
}

impl Session {
    pub fn spawn(cfg: Tunables, clock: Arc<dyn MasterClock>) -> Self {
        let metrics = Metrics::new();
        let epoch_utc_ms = clock.now_utc_ms();
        let session_id = Uuid::new_v4().to_string();
        info!("[session] {session_id} starting, epoch={epoch_utc_ms}");

        let (ctrl_tx, ctrl_rx) = bounded::<ControlMsg>(16);
        let (ts_tx, _) = broadcast::channel::<Bytes>(256);
        // The fixed-depth output queue: its capacity is the steady-state
        // target, and a blocked send here is the control thread's pacing
        // suspension.
        let (out_tx, out_rx) = bounded::<OutputFrame>(cfg.steady_state_entry_depth.max(1));

        let status = Arc::new(Mutex::new(StatusSnapshot {
            session_id,
            epoch_utc_ms,
            ct_us: 0,
            active_segment: 0,
            live_depth: 0,
            deficit_engaged: false,
            fatal: None,
            metrics: metrics.snapshot(),
        }));

        let mux = {
            let clock = Arc::clone(&clock);
            let cfg = cfg.clone();
            let ts_tx = ts_tx.clone();
            thread::Builder::new()
                .name("linecast-mux".into())
                .spawn(move || run_mux(clock, cfg, out_rx, ts_tx))
                .ok()
        };

        let control = {
            let clock = Arc::clone(&clock);
            let cfg = cfg.clone();
            let metrics = Arc::clone(&metrics);
            let status = Arc::clone(&status);
            thread::Builder::new()
                .name("linecast-control".into())
                .spawn(move || control_loop(cfg, clock, epoch_utc_ms, metrics, ctrl_rx, out_tx, status))
                .ok()
        };

        Self { ctrl_tx, ts_tx, status, control, mux }
    }

    /// Submit a plan window and wait for the coordinator's verdict.
    pub fn submit_plan(&self, segments: Vec<PlannedSegment>) -> Result<SubmitReport, PlanError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.ctrl_tx
            .send(ControlMsg::SubmitPlan { segments, reply: reply_tx })
            .map_err(|_| PlanError::Empty)?;
        reply_rx.recv().unwrap_or(Err(PlanError::Empty))
    }

    pub fn shutdown(mut self) {
        let _ = self.ctrl_tx.send(ControlMsg::Shutdown);
        if let Some(h) = self.control.take() {
            let _ = h.join();
        }
        if let Some(h) = self.mux.take() {
            let _ = h.join();
        }
    }
}

fn build_feed(cmd: &PreloadCmd, cfg: &Tunables, events: &Sender<ProducerEvent>) -> SegmentFeed {
    match &cmd.source {
        SegmentSourceSpec::File { asset_uri, start_frame } => SegmentFeed::File(FileProducer::spawn(
            cmd.segment_id,
            asset_uri.clone(),
            *start_frame,
            cmd.planned_frame_count,
            cmd.source_fps,
            cfg.output_fps,
            cfg.producer_gate_depth,
            events.clone(),
        )),
        SegmentSourceSpec::Pad => {
            SegmentFeed::Pad(PadSource::new(cfg.pad_width, cfg.pad_height, cfg.output_fps, cfg.audio_rate))
        }
    }
}

fn update_status(
    status: &Mutex<StatusSnapshot>,
    engine: &Engine,
    metrics: &Metrics,
) {
    let mut s = status.lock();
    s.ct_us = engine.peek_ct_us();
    s.active_segment = engine.active_segment().0;
    s.live_depth = engine.live_depth();
    s.deficit_engaged = engine.deficit_engaged();
    s.fatal = engine.fatal().map(|v| v.tag().to_string());
    s.metrics = metrics.snapshot();
}

fn control_loop(
    cfg: Tunables,
    clock: Arc<dyn MasterClock>,
    epoch_utc_ms: i64,
    metrics: Arc<Metrics>,
    ctrl_rx: Receiver<ControlMsg>,
    out_tx: Sender<OutputFrame>,
    status: Arc<Mutex<StatusSnapshot>>,
) {
    let mut coordinator = Coordinator::new(cfg.clone(), Arc::clone(&metrics));
    let mut engine = Engine::new(cfg.clone(), epoch_utc_ms, Arc::clone(&metrics));
    let (event_tx, event_rx) = bounded::<ProducerEvent>(256);
    let mut staged: Option<OutputFrame> = None;

    loop {
        let now = clock.now_utc_ms();

        for cmd in coordinator.poll(now) {
            match cmd {
                Command::Preload(p) => {
                    let feed = build_feed(&p, &cfg, &event_tx);
                    if let Some(ack) = engine.on_preload(&p, feed) {
                        coordinator.on_preload_ack(&ack);
                    }
                }
                Command::Switch(s) => engine.on_switch(&s),
            }
        }
        if let Some(ack) = engine.maybe_commit(now) {
            coordinator.on_switch_ack(&ack);
        }
        engine.drain_feeds();
        if let Some(ack) = engine.poll_shadow() {
            coordinator.on_preload_ack(&ack);
        }

        if let Some(v) = engine.fatal().or_else(|| coordinator.fatal()) {
            // Teardown only from a stable state: commits are instantaneous on
            // this thread, so nothing is mid-switch when we arrive here.
            debug_assert!(coordinator.safe_to_teardown());
            error!("[session] fatal {}; terminating after safe state", v.tag());
            break;
        }

        if staged.is_none() {
            staged = engine.stage(now);
        }
        update_status(&status, &engine, &metrics);

        let deadline = [coordinator.next_deadline_utc_ms(), engine.next_deadline_utc_ms()]
            .into_iter()
            .flatten()
            .min();
        if deadline.is_some_and(|d| d <= now) {
            continue; // a deadline just became due; handle it before waiting
        }
        let timer = match deadline {
            Some(at_ms) => crossbeam_channel::at(clock.instant_of(at_ms)),
            None => crossbeam_channel::never::<std::time::Instant>(),
        };

        if staged.is_some() {
            crossbeam_channel::select! {
                send(out_tx, staged.take().unwrap()) -> res => {
                    if res.is_err() {
                        info!("[session] output queue closed; ending control loop");
                        break;
                    }
                }
                recv(event_rx) -> ev => {
                    if let Ok(ev) = ev {
                        if let Some(ack) = engine.on_producer_event(&ev) {
                            coordinator.on_preload_ack(&ack);
                        }
                    }
                }
                recv(ctrl_rx) -> msg => {
                    if !handle_ctrl(msg, &mut coordinator, &clock) {
                        break;
                    }
                }
                recv(timer) -> _ => {}
            }
        } else {
            crossbeam_channel::select! {
                recv(event_rx) -> ev => {
                    if let Ok(ev) = ev {
                        if let Some(ack) = engine.on_producer_event(&ev) {
                            coordinator.on_preload_ack(&ack);
                        }
                    }
                }
                recv(ctrl_rx) -> msg => {
                    if !handle_ctrl(msg, &mut coordinator, &clock) {
                        break;
                    }
                }
                recv(timer) -> _ => {}
            }
        }
    }

    engine.shutdown();
    update_status(&status, &engine, &metrics);
    // Dropping out_tx disconnects the mux, which ends the byte stream.
}

/// Returns false when the control loop should exit.
fn handle_ctrl(
    msg: Result<ControlMsg, crossbeam_channel::RecvError>,
    coordinator: &mut Coordinator,
    clock: &Arc<dyn MasterClock>,
) -> bool {
    match msg {
        Ok(ControlMsg::SubmitPlan { segments, reply }) => {
            let res = coordinator.submit_plan(clock.now_utc_ms(), segments);
            let _ = reply.send(res);
            true
        }
        Ok(ControlMsg::Shutdown) | Err(_) => false,
    }
}
