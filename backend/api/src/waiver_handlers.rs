use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::{
    error::ApiResult,
    handlers::{client_ip, map_json_rejection},
    services::waiver::{record_waiver, WaiverRequest},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct WaiverBody {
    pub user_id: Uuid,
    pub role: String,
    pub renoncement_retractation: bool,
    pub prm: Option<String>,
}

pub async fn record_retraction_waiver(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<WaiverBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(body) = payload.map_err(map_json_rejection)?;
    let request = WaiverRequest {
        user_id: body.user_id,
        role: body.role,
        waived: body.renoncement_retractation,
        prm: body.prm,
        client_ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
    };

    let outcome = record_waiver(state.services.store.as_ref(), request).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "renoncement": outcome.renoncement })),
    ))
}
