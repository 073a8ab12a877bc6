//! Demo routes.
//!
//! `/slow/:secs` and `/jobs/:secs` make it easy to watch a shutdown wait for
//! in-flight requests and background work.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use gracious::ServerHandle;
use serde::Serialize;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

/// Longest delay the demo routes accept.
const MAX_DELAY_SECS: u64 = 300;

pub fn router(handle: ServerHandle) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/slow/:secs", get(slow_handler))
        .route("/jobs/:secs", post(job_handler))
        .with_state(handle)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

async fn index_handler() -> &'static str {
    "gracious-server\n"
}

/// Liveness check for load balancers. Reports 503 once shutdown started so
/// traffic moves elsewhere while we drain.
async fn health_handler(State(handle): State<ServerHandle>) -> impl IntoResponse {
    if handle.is_closing() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining\n")
    } else {
        (StatusCode::OK, "ok\n")
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: &'static str,
    pid: u32,
    phase: String,
    in_flight: usize,
}

async fn status_handler(State(handle): State<ServerHandle>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
        phase: format!("{:?}", handle.phase()),
        in_flight: handle.in_flight(),
    })
}

async fn slow_handler(Path(secs): Path<u64>) -> Result<String, StatusCode> {
    let secs = check_delay(secs)?;
    tokio::time::sleep(Duration::from_secs(secs)).await;
    Ok(format!("slept {secs}s\n"))
}

/// Start a background job that shutdown waits for.
async fn job_handler(
    State(handle): State<ServerHandle>,
    Path(secs): Path<u64>,
) -> Result<(StatusCode, String), StatusCode> {
    let secs = check_delay(secs)?;
    let guard = handle.routine();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        info!(secs, "Background job finished");
        drop(guard);
    });
    Ok((StatusCode::ACCEPTED, format!("job running for {secs}s\n")))
}

fn check_delay(secs: u64) -> Result<u64, StatusCode> {
    if secs > MAX_DELAY_SECS {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(secs)
}
