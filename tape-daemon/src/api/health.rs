//! Liveness and build-info endpoints.

use std::sync::OnceLock;
use std::time::Instant;

use axum::Json;
use serde_json::{json, Value};

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Record the daemon's start time for uptime reporting.
pub fn init_start_time() {
    let _ = START_TIME.set(Instant::now());
}

pub async fn health() -> Json<Value> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);
    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
    }))
}

pub async fn version() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
