//! Definitive active energy ingestion for every meter point of an operation.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use shared::{ConsumptionRecord, DomainError, DomainResult};
use tracing::info;
use uuid::Uuid;

use super::{format_api_timestamp, Collaborators};
use crate::enedis::{ClientCredentials, EnergySeries};
use crate::metrics::CONSUMPTION_RECORDS_INGESTED;

#[derive(Debug, Clone)]
pub struct MeteringRequest {
    pub operation_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeteringOutcome {
    pub operation_id: Uuid,
    pub prms: Vec<String>,
    pub inserted: u64,
}

/// Map one series onto a record: `autocons` is self-consumed, `complement`
/// complementary and `cons` the total.
pub fn consumption_record(operation_id: Uuid, series: &EnergySeries, now: DateTime<Utc>) -> ConsumptionRecord {
    let own = series.distributor_bands("autocons");
    let complement = series.distributor_bands("complement");
    let total = series.distributor_bands("cons");
    ConsumptionRecord {
        id: Uuid::new_v4(),
        operation_id,
        prm: series.cons_id.clone(),
        start_date: series.start_date,
        end_date: series.end_date,
        unit: series.unit.clone(),
        peak_self: own.peak,
        hph_self: own.hph,
        hch_self: own.hch,
        hpb_self: own.hpb,
        hcb_self: own.hcb,
        peak_complement: complement.peak,
        hph_complement: complement.hph,
        hch_complement: complement.hch,
        hpb_complement: complement.hpb,
        hcb_complement: complement.hcb,
        peak_total: total.peak,
        hph_total: total.hph,
        hch_total: total.hch,
        hpb_total: total.hpb,
        hcb_total: total.hcb,
        created_at: now,
    }
}

/// Fetch the period for every participant of the operation and store it in
/// one batch. Nothing is stored if any meter point fails.
pub async fn ingest_operation_consumption(
    services: &Collaborators,
    request: MeteringRequest,
    now: DateTime<Utc>,
) -> DomainResult<MeteringOutcome> {
    let operation = services
        .store
        .operation(request.operation_id)
        .await?
        .ok_or_else(|| DomainError::not_found("operation", request.operation_id))?;
    let agreement = operation.agreement_number.clone().ok_or_else(|| {
        DomainError::InvalidState(format!("operation {} has no agreement number", operation.id))
    })?;
    let credentials = match (operation.client_id.clone(), operation.client_secret.clone()) {
        (Some(client_id), Some(client_secret)) => ClientCredentials {
            client_id,
            client_secret,
        },
        _ => {
            return Err(DomainError::InvalidState(format!(
                "operation {} has no metering credentials",
                operation.id
            )))
        }
    };

    let participants = services.store.participants(operation.id).await?;
    if participants.is_empty() {
        return Err(DomainError::not_found("meter point", format!("operation {}", operation.id)));
    }

    let token = services.metering.access_token(&credentials).await?;
    let start = format_api_timestamp(request.start);
    let end = format_api_timestamp(request.end);

    let fetches = participants.iter().map(|participant| {
        services.metering.definitive_active_energy(
            &token,
            &agreement,
            &participant.consumer_prm,
            &start,
            &end,
        )
    });
    let records: Vec<ConsumptionRecord> = try_join_all(fetches)
        .await?
        .iter()
        .map(|series| consumption_record(operation.id, series, now))
        .collect();

    let inserted = services.store.insert_consumption_records(&records).await?;
    CONSUMPTION_RECORDS_INGESTED.inc_by(inserted);
    info!(operation_id = %operation.id, inserted, %start, %end, "consumption ingested");

    Ok(MeteringOutcome {
        operation_id: operation.id,
        prms: participants.into_iter().map(|p| p.consumer_prm).collect(),
        inserted,
    })
}
