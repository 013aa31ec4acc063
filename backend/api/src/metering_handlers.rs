use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiResult,
    handlers::map_json_rejection,
    services::{
        metering::{ingest_operation_consumption, MeteringRequest},
        parse_api_timestamp,
    },
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct FetchConsumptionBody {
    #[serde(rename = "operationId")]
    pub operation_id: Uuid,
    pub start: String,
    pub end: String,
}

/// Pull definitive active energy of the operation's meter points.
pub async fn fetch_consumption(
    State(state): State<AppState>,
    payload: Result<Json<FetchConsumptionBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = payload.map_err(map_json_rejection)?;
    let request = MeteringRequest {
        operation_id: body.operation_id,
        start: parse_api_timestamp(&body.start)?,
        end: parse_api_timestamp(&body.end)?,
    };

    let outcome = ingest_operation_consumption(&state.services, request, Utc::now()).await?;
    Ok(Json(json!({
        "success": true,
        "operationId": outcome.operation_id,
        "prms": outcome.prms,
        "inserted": outcome.inserted,
    })))
}
