use serde::Serialize;
use shared::{
    ConsumerKind, DomainError, DomainResult, NewRetractionWaiver, Party, RetractionWaiver,
    SignerRole,
};
use tracing::info;
use uuid::Uuid;

use super::resolve_party;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct WaiverRequest {
    pub user_id: Uuid,
    pub role: String,
    pub waived: bool,
    pub prm: Option<String>,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaiverOutcome {
    pub renoncement: RetractionWaiver,
}

/// Record an individual consumer's answer about the cooling-off period.
pub async fn record_waiver(store: &dyn Store, request: WaiverRequest) -> DomainResult<WaiverOutcome> {
    if request.role != SignerRole::Consumer.as_str() {
        return Err(DomainError::InvalidInput(
            "only consumers can waive the retraction period".into(),
        ));
    }
    let consumer = match resolve_party(store, request.user_id).await? {
        Some(Party::Consumer(consumer)) => consumer,
        Some(party) => {
            return Err(DomainError::InvalidInput(format!(
                "user {} is registered as {}",
                request.user_id,
                party.role().as_str()
            )))
        }
        None => return Err(DomainError::not_found("consumer", request.user_id)),
    };
    if consumer.consumer_kind()? != ConsumerKind::Individual {
        return Err(DomainError::InvalidInput(
            "only individual consumers can waive the retraction period".into(),
        ));
    }

    let full_name = format!(
        "{} {}",
        consumer.contact_first_name.as_deref().unwrap_or_default(),
        consumer.contact_last_name.as_deref().unwrap_or_default()
    )
    .trim()
    .to_string();

    let waiver = store
        .insert_waiver(&NewRetractionWaiver {
            user_id: request.user_id,
            consumer_id: consumer.id,
            ip_address: request.client_ip,
            role: request.role,
            full_name,
            address: consumer.address.clone(),
            prm: consumer.prm.clone().or(request.prm),
            waived: request.waived,
        })
        .await?;
    info!(consumer_id = %consumer.id, waived = waiver.waived, "retraction answer recorded");
    Ok(WaiverOutcome { renoncement: waiver })
}
