//! Consent records: terms of use, metering-data sharing and participation in
//! the operation. Each one snapshots who gave it and from where.

use chrono::{DateTime, Months, Utc};
use serde::Serialize;
use shared::{
    ConsentIdentity, DataSharingAuthorization, DataSharingScope, DomainError, DomainResult,
    NewDataSharingAuthorization, NewParticipationAgreement, NewTermsAcceptance,
    ParticipationAgreement, ParticipationScope, Party, SignerRole, TermsAcceptance,
};
use tracing::info;
use uuid::Uuid;

use super::resolve_party;
use crate::store::Store;

/// Lifetime of data-sharing and standing participation authorizations.
pub const CONSENT_VALIDITY_MONTHS: u32 = 24;

/// The caller's side of every consent request.
#[derive(Debug, Clone)]
pub struct ConsentRequest {
    pub user_id: Uuid,
    pub role: String,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TermsOutcome {
    pub cgu: TermsAcceptance,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataSharingOutcome {
    pub autorisation: DataSharingAuthorization,
}

fn parse_role(role: &str) -> DomainResult<SignerRole> {
    [SignerRole::Consumer, SignerRole::Producer]
        .into_iter()
        .find(|r| r.as_str() == role)
        .ok_or_else(|| {
            DomainError::InvalidInput(format!(
                "invalid role {:?}, expected '{}' or '{}'",
                role,
                SignerRole::Consumer.as_str(),
                SignerRole::Producer.as_str()
            ))
        })
}

fn contact_name(first: Option<&str>, last: Option<&str>) -> String {
    format!("{} {}", first.unwrap_or_default(), last.unwrap_or_default())
        .trim()
        .to_string()
}

fn valid_until(now: DateTime<Utc>) -> DomainResult<DateTime<Utc>> {
    now.checked_add_months(Months::new(CONSENT_VALIDITY_MONTHS))
        .ok_or_else(|| DomainError::InvalidInput(format!("no validity end after {}", now)))
}

/// Resolve the caller under the role it claims. A consumer answers for its
/// own meter point; a producer for `prm` when given, else its first
/// installation's.
async fn identify(
    store: &dyn Store,
    request: &ConsentRequest,
    prm: Option<&str>,
) -> DomainResult<ConsentIdentity> {
    let role = parse_role(&request.role)?;
    let party = resolve_party(store, request.user_id)
        .await?
        .ok_or_else(|| DomainError::not_found(role.as_str(), request.user_id))?;
    if party.role() != role {
        return Err(DomainError::InvalidInput(format!(
            "user {} is registered as {}",
            request.user_id,
            party.role().as_str()
        )));
    }

    let (full_name, address, prm) = match party {
        Party::Consumer(consumer) => {
            if let Some(wanted) = prm {
                if consumer.prm.as_deref() != Some(wanted) {
                    return Err(DomainError::not_found("consumer meter point", wanted));
                }
            }
            (
                contact_name(
                    consumer.contact_first_name.as_deref(),
                    consumer.contact_last_name.as_deref(),
                ),
                consumer.address,
                consumer.prm,
            )
        }
        Party::Producer(producer) => {
            let prm = match prm {
                Some(prm) => prm.to_string(),
                None => store
                    .installations_of_producer(producer.id)
                    .await?
                    .into_iter()
                    .next()
                    .map(|i| i.prm)
                    .ok_or_else(|| DomainError::not_found("installation", producer.id))?,
            };
            (
                contact_name(
                    producer.contact_first_name.as_deref(),
                    producer.contact_last_name.as_deref(),
                ),
                producer.address,
                Some(prm),
            )
        }
    };

    Ok(ConsentIdentity {
        user_id: request.user_id,
        ip_address: request.client_ip.clone(),
        role: role.as_str().to_string(),
        full_name,
        address,
        prm,
    })
}

pub async fn accept_terms(
    store: &dyn Store,
    request: ConsentRequest,
    accepted: bool,
) -> DomainResult<TermsOutcome> {
    let identity = identify(store, &request, None).await?;
    let cgu = store
        .insert_terms_acceptance(&NewTermsAcceptance { identity, accepted })
        .await?;
    info!(user_id = %cgu.user_id, role = %cgu.role, accepted, "terms answer recorded");
    Ok(TermsOutcome { cgu })
}

pub async fn authorize_data_sharing(
    store: &dyn Store,
    request: ConsentRequest,
    scope: DataSharingScope,
    now: DateTime<Utc>,
) -> DomainResult<DataSharingOutcome> {
    let identity = identify(store, &request, None).await?;
    let autorisation = store
        .insert_data_sharing_authorization(&NewDataSharingAuthorization {
            identity,
            scope,
            valid_until: valid_until(now)?,
        })
        .await?;
    info!(
        user_id = %autorisation.user_id,
        valid_until = %autorisation.valid_until,
        "data sharing authorization recorded"
    );
    Ok(DataSharingOutcome { autorisation })
}

/// With `prm`, an agreement for that meter point that does not expire.
/// Without, a standing authorization for the caller's own meter point.
pub async fn record_participation(
    store: &dyn Store,
    request: ConsentRequest,
    scope: ParticipationScope,
    prm: Option<String>,
    now: DateTime<Utc>,
) -> DomainResult<ParticipationAgreement> {
    let identity = identify(store, &request, prm.as_deref()).await?;
    let valid_until = match prm {
        Some(_) => None,
        None => Some(valid_until(now)?),
    };
    let agreement = store
        .insert_participation_agreement(&NewParticipationAgreement {
            identity,
            scope,
            valid_until,
        })
        .await?;
    info!(
        user_id = %agreement.user_id,
        prm = ?agreement.prm,
        agreed = agreement.agreed,
        "participation answer recorded"
    );
    Ok(agreement)
}
