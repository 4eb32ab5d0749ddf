// crates/linecast-server/src/main.rs
//
// linecast: one playout instance per channel. The outer supervisor spawns one
// of these per channel URL; everything channel-global lives in the session.

mod coordinator;
mod engine;
mod filler;
mod http;
mod metrics;
mod mux;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use linecast_core::clock::SystemClock;
use linecast_core::config::Tunables;
use linecast_core::plan::PlannedSegment;

use http::AppState;
use session::Session;

#[derive(Parser, Debug)]
#[command(name = "linecast", about = "24/7 linear-video playout engine", version)]
struct Args {
    /// JSON tunables file. Env overrides (MIN_PREFEED_LEAD_TIME_MS, …) apply
    /// on top.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address for the TS endpoint, overriding config.
    #[arg(long)]
    listen: Option<String>,

    /// JSON execution plan to submit at startup.
    #[arg(long)]
    plan: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => Tunables::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Tunables::default(),
    }
    .apply_env();
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }

    let clock = Arc::new(SystemClock::new());
    let session = Session::spawn(cfg.clone(), clock);

    if let Some(path) = &args.plan {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading plan {}", path.display()))?;
        let segments: Vec<PlannedSegment> =
            serde_json::from_str(&raw).context("parsing execution plan")?;
        let report = session
            .submit_plan(segments)
            .map_err(|e| anyhow::anyhow!("plan rejected: {e}"))?;
        info!("[main] startup plan: {} scheduled, {} torn down", report.accepted, report.torn_down.len());
    }

    let state = AppState {
        ts: session.ts_tx.clone(),
        ctrl: session.ctrl_tx.clone(),
        status: Arc::clone(&session.status),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(http::serve(&cfg.listen_addr, state))?;

    // Teardown is deferred inside the control thread until the boundary
    // machinery is stable; this just delivers the request and waits.
    session.shutdown();
    Ok(())
}
