use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{DataSharingScope, ParticipationScope};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::{
    error::ApiResult,
    handlers::{client_ip, map_json_rejection},
    services::consent::{self, ConsentRequest},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct TermsBody {
    pub user_id: Uuid,
    pub role: String,
    pub validation_cgu: bool,
}

#[derive(Debug, Deserialize)]
pub struct DataSharingBody {
    pub user_id: Uuid,
    pub role: String,
    #[serde(default)]
    pub donnees_mesures: bool,
    #[serde(default)]
    pub donnees_index: bool,
    #[serde(default)]
    pub donnees_pmax: bool,
    #[serde(default)]
    pub donnees_cdc: bool,
    #[serde(default)]
    pub donnees_techniques: bool,
    #[serde(default)]
    pub habilitation: bool,
}

impl DataSharingBody {
    fn scope(&self) -> DataSharingScope {
        DataSharingScope {
            measures: self.donnees_mesures,
            index_readings: self.donnees_index,
            max_power: self.donnees_pmax,
            load_curve: self.donnees_cdc,
            technical_data: self.donnees_techniques,
            mandate: self.habilitation,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ParticipationBody {
    pub user_id: Uuid,
    pub role: String,
    #[serde(default)]
    pub collecte_cdc: bool,
    #[serde(default)]
    pub transmission_fournisseur: bool,
    #[serde(default)]
    pub transmission_tiers_cons: bool,
    #[serde(default)]
    pub transmission_tiers_prod: bool,
    pub accord_participation: bool,
}

impl ParticipationBody {
    fn scope(&self) -> ParticipationScope {
        ParticipationScope {
            load_curve_collection: self.collecte_cdc,
            supplier_transmission: self.transmission_fournisseur,
            consumer_third_party_transmission: self.transmission_tiers_cons,
            producer_third_party_transmission: self.transmission_tiers_prod,
            agreed: self.accord_participation,
        }
    }
}

/// Agreement for one meter point: the participation fields plus `prm`.
#[derive(Debug, Deserialize)]
pub struct MeterPointAgreementBody {
    #[serde(flatten)]
    pub participation: ParticipationBody,
    pub prm: String,
}

fn consent_request(
    user_id: Uuid,
    role: String,
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> ConsentRequest {
    ConsentRequest {
        user_id,
        role,
        client_ip: client_ip(headers, peer.map(|ConnectInfo(addr)| addr)),
    }
}

pub async fn accept_terms(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<TermsBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(body) = payload.map_err(map_json_rejection)?;
    let request = consent_request(body.user_id, body.role, &headers, peer);

    let outcome =
        consent::accept_terms(state.services.store.as_ref(), request, body.validation_cgu).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "cgu": outcome.cgu })),
    ))
}

pub async fn authorize_data_sharing(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<DataSharingBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(body) = payload.map_err(map_json_rejection)?;
    let scope = body.scope();
    let request = consent_request(body.user_id, body.role, &headers, peer);

    let outcome = consent::authorize_data_sharing(
        state.services.store.as_ref(),
        request,
        scope,
        Utc::now(),
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "autorisation": outcome.autorisation })),
    ))
}

pub async fn agree_participation(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<MeterPointAgreementBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(body) = payload.map_err(map_json_rejection)?;
    let scope = body.participation.scope();
    let request = consent_request(
        body.participation.user_id,
        body.participation.role,
        &headers,
        peer,
    );

    let accord = consent::record_participation(
        state.services.store.as_ref(),
        request,
        scope,
        Some(body.prm),
        Utc::now(),
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "accord": accord })),
    ))
}

pub async fn authorize_participation(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<ParticipationBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(body) = payload.map_err(map_json_rejection)?;
    let scope = body.scope();
    let request = consent_request(body.user_id, body.role, &headers, peer);

    let autorisation = consent::record_participation(
        state.services.store.as_ref(),
        request,
        scope,
        None,
        Utc::now(),
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "autorisation": autorisation })),
    ))
}
