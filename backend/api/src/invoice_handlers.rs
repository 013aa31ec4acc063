use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
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
        invoicing::{self, InvoiceRequest, InvoiceSummary, OperationBillingRequest},
        parse_api_timestamp,
    },
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct GenerateInvoiceBody {
    pub consommateur_prm: String,
    pub producteur_prm: String,
    pub contrat_id: Uuid,
    #[serde(rename = "operationId")]
    pub operation_id: Uuid,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Deserialize)]
pub struct OperationInvoicesBody {
    #[serde(rename = "operationId")]
    pub operation_id: Uuid,
    pub start: String,
    pub end: String,
}

pub async fn generate_invoice(
    State(state): State<AppState>,
    payload: Result<Json<GenerateInvoiceBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = payload.map_err(map_json_rejection)?;
    let request = InvoiceRequest {
        consumer_prm: body.consommateur_prm,
        producer_prm: body.producteur_prm,
        contract_id: body.contrat_id,
        operation_id: body.operation_id,
        start: parse_api_timestamp(&body.start)?,
        end: parse_api_timestamp(&body.end)?,
    };

    let (invoice, tasks) = invoicing::generate_invoice(&state.services, request, Utc::now()).await?;
    state.post_commit.spawn(tasks);

    Ok(Json(json!({
        "success": true,
        "facture": InvoiceSummary::from(&invoice),
    })))
}

pub async fn generate_operation_invoices(
    State(state): State<AppState>,
    payload: Result<Json<OperationInvoicesBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = payload.map_err(map_json_rejection)?;
    let request = OperationBillingRequest {
        operation_id: body.operation_id,
        start: parse_api_timestamp(&body.start)?,
        end: parse_api_timestamp(&body.end)?,
    };

    let (outcome, tasks) =
        invoicing::generate_operation_invoices(&state.services, request, Utc::now()).await?;
    state.post_commit.spawn(tasks);

    Ok(Json(json!({
        "success": true,
        "factures": outcome.factures,
        "ignores": outcome.ignores,
        "echecs": outcome.echecs,
    })))
}

/// 302 to a short-lived link of the stored document.
pub async fn download_invoice(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let url = invoicing::invoice_download_url(&state.services, id).await?;
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]))
}
