use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ConnectInfo, Path, Query, State,
    },
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::{
    auth::bearer_token,
    error::ApiResult,
    handlers::{client_ip, map_json_rejection, map_query_rejection},
    services::{
        parse_api_timestamp,
        signature::{self, ConsumerSignatureRequest, ProducerSignatureRequest},
        status::{self, StatusPreview},
    },
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct GenerateContractBody {
    pub contrat_id: Uuid,
    pub consommateur_id: Uuid,
    pub producteur_id: Uuid,
    pub installation_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ProducerSignatureBody {
    pub contrat_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct StatusPreviewQuery {
    pub date_signature_producteur: Option<String>,
}

/// Generate the contract and record the consumer's signature.
pub async fn sign_consumer_contract(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<GenerateContractBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = payload.map_err(map_json_rejection)?;
    let request = ConsumerSignatureRequest {
        contract_id: body.contrat_id,
        consumer_id: body.consommateur_id,
        producer_id: body.producteur_id,
        installation_id: body.installation_id,
        client_ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
    };

    let (outcome, tasks) =
        signature::sign_as_consumer(&state.services, request, Utc::now()).await?;
    state.post_commit.spawn(tasks);

    Ok(Json(json!({
        "success": true,
        "url": outcome.url,
        "statut": outcome.statut,
        "consommateur_rang": outcome.consommateur_rang,
    })))
}

/// Countersign a contract as the authenticated producer.
pub async fn sign_producer_contract(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<ProducerSignatureBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = payload.map_err(map_json_rejection)?;
    let token = bearer_token(&headers)?;
    let request = ProducerSignatureRequest {
        contract_id: body.contrat_id,
        token,
        client_ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
    };

    let (outcome, tasks) =
        signature::sign_as_producer(&state.services, request, Utc::now()).await?;
    state.post_commit.spawn(tasks);

    Ok(Json(json!({
        "success": true,
        "message": "Contrat signé par le producteur",
        "url_document": outcome.url_document,
        "statut": outcome.statut,
    })))
}

pub async fn preview_contract_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    query: Result<Query<StatusPreviewQuery>, QueryRejection>,
) -> ApiResult<Json<StatusPreview>> {
    let Query(query) = query.map_err(map_query_rejection)?;
    let producer_signed_at = query
        .date_signature_producteur
        .as_deref()
        .map(parse_api_timestamp)
        .transpose()?;

    let preview =
        status::preview_status(state.services.store.as_ref(), id, producer_signed_at, Utc::now())
            .await?;
    Ok(Json(preview))
}
