// crates/linecast-server/src/http.rs
//
// Delivery surface: the transport stream over HTTP GET, plan intake over
// POST, and a status snapshot. Delivery owns no playout state; a slow
// viewer lags the broadcast channel and is dropped; the mux never blocks on
// a socket.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use crossbeam_channel::{bounded, Sender};
use log::info;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use linecast_core::plan::PlannedSegment;

use crate::session::{ControlMsg, StatusSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub ts: broadcast::Sender<Bytes>,
    pub ctrl: Sender<ControlMsg>,
    pub status: Arc<Mutex<StatusSnapshot>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/channel.ts", get(stream_ts))
        .route("/plan", post(submit_plan))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("[http] listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("[http] shutdown signal received");
        })
        .await?;
    Ok(())
}

/// Continuous transport stream. Bytes arrive PCR-paced from the mux; a
/// viewer that cannot keep up lags the broadcast and its stream ends with an
/// error rather than backpressuring playout.
async fn stream_ts(State(state): State<AppState>) -> Response {
    let rx = state.ts.subscribe();
    let stream = BroadcastStream::new(rx).map(|chunk| match chunk {
        Ok(bytes) => Ok::<Bytes, std::io::Error>(bytes),
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            Err(std::io::Error::other(format!("viewer lagged by {n} chunks")))
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Execution-plan intake: the planner pushes windows here ahead of their
/// lead time. Overlap and lead-time verdicts come back synchronously.
async fn submit_plan(
    State(state): State<AppState>,
    Json(segments): Json<Vec<PlannedSegment>>,
) -> Response {
    let (reply_tx, reply_rx) = bounded(1);
    if state.ctrl.send(ControlMsg::SubmitPlan { segments, reply: reply_tx }).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "session ended" })))
            .into_response();
    }
    match tokio::task::spawn_blocking(move || reply_rx.recv()).await {
        Ok(Ok(Ok(report))) => (StatusCode::OK, Json(json!(report))).into_response(),
        Ok(Ok(Err(err))) => {
            (StatusCode::CONFLICT, Json(json!({ "error": err.to_string() }))).into_response()
        }
        _ => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "session ended" })))
            .into_response(),
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.lock().clone())
}
