//! Backup job endpoints and the running-job tracker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::pipeline::{run_backup_job, BackupJob};
use super::AppState;

struct TrackedJob {
    abort_handle: AbortHandle,
    cancel_token: CancellationToken,
}

/// Tracks running backup jobs and provides the cancellation path.
#[derive(Clone)]
pub struct JobTracker {
    jobs: Arc<RwLock<HashMap<Uuid, TrackedJob>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, job_id: Uuid, handle: AbortHandle, token: CancellationToken) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(
            job_id,
            TrackedJob {
                abort_handle: handle,
                cancel_token: token,
            },
        );
    }

    /// Signal a job to stop. Idempotent: cancelling an unknown or already
    /// finished job reports `false` and does nothing.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let jobs = self.jobs.read().await;
        if let Some(tracked) = jobs.get(&job_id) {
            tracked.cancel_token.cancel();
            true
        } else {
            false
        }
    }

    pub async fn complete(&self, job_id: Uuid) {
        let mut jobs = self.jobs.write().await;
        jobs.remove(&job_id);
    }

    pub async fn running_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Abort every tracked job outright; used at daemon shutdown.
    pub async fn abort_all(&self) {
        let mut jobs = self.jobs.write().await;
        for (_, tracked) in jobs.drain() {
            tracked.cancel_token.cancel();
            tracked.abort_handle.abort();
        }
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
pub struct StartBackupRequest {
    /// Root of the tree to back up.
    pub root: PathBuf,
    /// Library to write to; defaults to the first configured one.
    pub library: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartBackupResponse {
    pub job_id: Uuid,
    pub library: String,
}

pub async fn start_backup(
    State(state): State<AppState>,
    Json(request): Json<StartBackupRequest>,
) -> Result<Json<StartBackupResponse>, (StatusCode, String)> {
    if !request.root.exists() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("backup root does not exist: {}", request.root.display()),
        ));
    }

    let library = state
        .registry
        .find(request.library.as_deref())
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                "no such tape library configured".to_string(),
            )
        })?;

    let Some((device, changer)) = library.checkout() else {
        return Err((
            StatusCode::CONFLICT,
            format!("library '{}' is busy with another job", library.name),
        ));
    };

    let job = BackupJob::new(request.root);
    let job_id = job.id;
    let library_name = library.name.clone();
    let cancel = CancellationToken::new();

    let job_state = state.clone();
    let job_cancel = cancel.clone();
    let config = state.config.clone();
    let lib_name = library_name.clone();
    let handle = tokio::spawn(async move {
        let result = run_backup_job(
            job,
            &config,
            Box::new(device),
            Box::new(changer),
            job_cancel,
        )
        .await;

        match result {
            Ok(report) if report.cancelled => {
                warn!(job_id = %report.job_id, "backup job cancelled")
            }
            Ok(report) => info!(
                job_id = %report.job_id,
                chunks = report.chunks_written,
                bytes = report.bytes_written,
                "backup job completed"
            ),
            Err(err) => error!(%job_id, %err, "backup job failed"),
        }

        if let Some(library) = job_state.registry.find(Some(&lib_name)) {
            library.release();
        }
        job_state.jobs.complete(job_id).await;
    });

    state
        .jobs
        .register(job_id, handle.abort_handle(), cancel)
        .await;

    info!(%job_id, library = %library_name, "backup job accepted");
    Ok(Json(StartBackupResponse {
        job_id,
        library: library_name,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CancelBackupRequest {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CancelBackupResponse {
    pub cancelled: bool,
}

pub async fn cancel_backup(
    State(state): State<AppState>,
    Json(request): Json<CancelBackupRequest>,
) -> Json<CancelBackupResponse> {
    let cancelled = state.jobs.cancel(request.job_id).await;
    if cancelled {
        info!(job_id = %request.job_id, "cancellation requested");
    }
    Json(CancelBackupResponse { cancelled })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracker_cancel_is_idempotent() {
        let tracker = JobTracker::new();
        let job_id = Uuid::new_v4();
        let token = CancellationToken::new();

        let task = tokio::spawn(async {});
        tracker
            .register(job_id, task.abort_handle(), token.clone())
            .await;
        assert_eq!(tracker.running_count().await, 1);

        assert!(tracker.cancel(job_id).await);
        assert!(token.is_cancelled());
        // A second cancel of the same job is harmless.
        assert!(tracker.cancel(job_id).await);

        tracker.complete(job_id).await;
        assert!(!tracker.cancel(job_id).await);
        assert_eq!(tracker.running_count().await, 0);
    }
}
