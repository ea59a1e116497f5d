use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use super::{sync_error_response, to_json, trigger_job, ApiResult, AppState};
use crate::jobs::JobKind;

#[derive(Debug, Default, Deserialize)]
pub struct LearningRequest {
    /// Restrict the run to one user. Skip rules still apply.
    pub user_id: Option<Uuid>,
}

pub async fn run_learning(
    State(state): State<AppState>,
    request: Option<Json<LearningRequest>>,
) -> ApiResult {
    match request.and_then(|Json(r)| r.user_id) {
        Some(user_id) => {
            let report = state
                .container
                .learning_scheduler
                .run_learning_for_user(user_id)
                .await
                .map_err(sync_error_response)?;
            to_json(&report)
        }
        None => trigger_job(&state, JobKind::Learning).await,
    }
}

pub async fn run_milestones(State(state): State<AppState>) -> ApiResult {
    trigger_job(&state, JobKind::Milestones).await
}
