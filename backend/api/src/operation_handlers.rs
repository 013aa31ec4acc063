use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiResult, handlers::map_json_rejection, services::commissioning, state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct StartDateBody {
    pub operation_id: Uuid,
}

pub async fn confirm_start_date(
    State(state): State<AppState>,
    payload: Result<Json<StartDateBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = payload.map_err(map_json_rejection)?;

    let (outcome, tasks) =
        commissioning::confirm_start_date(&state.services, body.operation_id).await?;
    state.post_commit.spawn(tasks);

    Ok(Json(json!({
        "success": true,
        "operation_id": outcome.operation_id,
        "date_demarrage": outcome.start_date,
        "inserted_count": outcome.inserted_count,
    })))
}
