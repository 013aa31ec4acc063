use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    resolve_status, Consumer, Contract, ContractStatus, DomainError, DomainResult, Operation,
    StatusInputs,
};
use tracing::debug;
use uuid::Uuid;

use crate::store::Store;

/// Operation a contract belongs to: its own link first, else the producer's.
pub async fn contract_operation(
    store: &dyn Store,
    contract: &Contract,
) -> DomainResult<Option<Operation>> {
    if let Some(operation_id) = contract.operation_id {
        if let Some(operation) = store.operation(operation_id).await? {
            return Ok(Some(operation));
        }
    }
    store.operation_for_producer(contract.producer_id).await
}

/// Gather resolver inputs. The retraction waiver is read live per consumer.
pub async fn status_inputs(
    store: &dyn Store,
    consumer: &Consumer,
    operation: Option<&Operation>,
    consumer_signed_at: Option<DateTime<Utc>>,
    producer_signed_at: Option<DateTime<Utc>>,
) -> DomainResult<StatusInputs> {
    let waiver = store.latest_waiver(consumer.id).await?;
    Ok(StatusInputs {
        consumer_kind: consumer.consumer_kind()?,
        retraction_waived: waiver.map(|w| w.waived),
        consumer_signed_at,
        producer_signed_at,
        operation_status: operation.map(|o| o.status),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPreview {
    pub contrat_id: Uuid,
    pub statut: ContractStatus,
    pub statut_enregistre: String,
}

/// Resolve what the contract's status would be, optionally as if the producer
/// signed at `producer_signed_at`. Nothing is persisted.
pub async fn preview_status(
    store: &dyn Store,
    contract_id: Uuid,
    producer_signed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DomainResult<StatusPreview> {
    let contract = store
        .contract(contract_id)
        .await?
        .ok_or_else(|| DomainError::not_found("contract", contract_id))?;
    let consumer = store
        .consumer(contract.consumer_id)
        .await?
        .ok_or_else(|| DomainError::not_found("consumer", contract.consumer_id))?;
    let operation = contract_operation(store, &contract).await?;

    let inputs = status_inputs(
        store,
        &consumer,
        operation.as_ref(),
        contract.consumer_signed_at,
        producer_signed_at.or(contract.producer_signed_at),
    )
    .await?;
    let status = resolve_status(&inputs, now)?;
    debug!(%contract_id, status = status.as_str(), "status preview");

    Ok(StatusPreview {
        contrat_id: contract.id,
        statut: status,
        statut_enregistre: contract.status,
    })
}
