use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use super::{error_response, sync_error_response, to_json, trigger_job, ApiResult, AppState};
use crate::jobs::JobKind;

#[derive(Debug, Default, Deserialize)]
pub struct SyncAccountParams {
    /// Discard the stored cursor and fetch the full lookback window.
    #[serde(default)]
    pub force_full: bool,
}

/// Sync every active account, sharing overlap protection with the cron job
pub async fn sync_all(State(state): State<AppState>) -> ApiResult {
    trigger_job(&state, JobKind::Sync).await
}

/// Sync one account. Returns 404 for an unknown account; a busy account is
/// reported as skipped inside the report.
pub async fn sync_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(params): Query<SyncAccountParams>,
) -> ApiResult {
    let report = state
        .container
        .orchestrator
        .sync_account(account_id, params.force_full)
        .await
        .map_err(sync_error_response)?;
    to_json(&report)
}

pub async fn reconcile_all(State(state): State<AppState>) -> ApiResult {
    trigger_job(&state, JobKind::Reconciliation).await
}

pub async fn reconcile_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult {
    if state
        .container
        .store
        .get_account(account_id)
        .await
        .map_err(sync_error_response)?
        .is_none()
    {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            format!("account {account_id} not found"),
        ));
    }

    let report = state
        .container
        .orchestrator
        .dedup()
        .reconcile_existing(account_id)
        .await
        .map_err(sync_error_response)?;
    to_json(&report)
}
