//! Embedded HTTP control surface.

pub mod health;
pub mod jobs;
pub mod libraries;
pub mod webui;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::config::Config;
use crate::device::registry::DeviceRegistry;
use self::jobs::JobTracker;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<DeviceRegistry>,
    pub jobs: JobTracker,
}

impl AppState {
    pub fn new(config: Arc<Config>, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            config,
            registry,
            jobs: JobTracker::new(),
        }
    }
}

/// Create the API router with all endpoints. Anything that is not an API
/// route falls through to the static web UI.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .route("/api/libraries", get(libraries::get_all_libraries))
        .route("/backup/start", post(jobs::start_backup))
        .route("/backup/cancel", post(jobs::cancel_backup))
        .fallback(get(webui::serve_asset))
        .with_state(state)
}
