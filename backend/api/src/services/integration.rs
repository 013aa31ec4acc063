//! Operation-side consequences of a signature: the regulatory annex, the
//! declaration to the grid operator before commissioning, and the admission
//! of the consumer meter point once the operation is in service.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use shared::{
    Consumer, Contract, DomainError, DomainResult, NewOperationParticipant, Operation, Producer,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::status::contract_operation;
use super::templates::{annex_data, french_date};
use super::{Collaborators, ANNEX_BUCKET, XLSX_CONTENT_TYPE};
use crate::documents::TemplateSyntax;
use crate::enedis::{ClientCredentials, IntegrationRequest};
use crate::mailer::{contact_address, Email};
use crate::outbox::CompletedSteps;
use crate::storage::object_path_from_public_url;

static DATE_STAMP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{8}").expect("valid regex"));

/// Days after contract creation at which a pending cooling-off period is over
/// for the producer's planning.
const LEGAL_DELAY_NOTICE_DAYS: i64 = 15;

async fn load_contract(services: &Collaborators, id: Uuid) -> DomainResult<Contract> {
    services
        .store
        .contract(id)
        .await?
        .ok_or_else(|| DomainError::not_found("contract", id))
}

async fn load_consumer(services: &Collaborators, id: Uuid) -> DomainResult<Consumer> {
    services
        .store
        .consumer(id)
        .await?
        .ok_or_else(|| DomainError::not_found("consumer", id))
}

async fn load_producer(services: &Collaborators, id: Uuid) -> DomainResult<Producer> {
    services
        .store
        .producer(id)
        .await?
        .ok_or_else(|| DomainError::not_found("producer", id))
}

fn annex_path(operation: &Operation) -> DomainResult<Option<String>> {
    match operation.annex_url.as_deref() {
        None => Ok(None),
        Some(url) => object_path_from_public_url(url, ANNEX_BUCKET)
            .map(Some)
            .ok_or_else(|| DomainError::InvalidState(format!("unrecognised annex url: {}", url))),
    }
}

/// Annex file renamed to carry `today` as its date stamp.
pub fn restamped_annex_path(path: &str, today: DateTime<Utc>) -> String {
    let stamp = today.format("%Y%m%d").to_string();
    match path.rsplit_once('/') {
        Some((dir, file)) => format!("{}/{}", dir, DATE_STAMP.replace(file, stamp.as_str())),
        None => DATE_STAMP.replace(path, stamp.as_str()).into_owned(),
    }
}

fn greeting(first_name: Option<&str>) -> &str {
    first_name.filter(|n| !n.is_empty()).unwrap_or("")
}

/// Substitute the consumer's meter point into the operation's regulatory
/// spreadsheet and store it back in place.
pub async fn refresh_annex(services: &Collaborators, contract_id: Uuid) -> DomainResult<()> {
    let contract = load_contract(services, contract_id).await?;
    let Some(operation) = contract_operation(services.store.as_ref(), &contract).await? else {
        info!(%contract_id, "no operation yet, annex refresh skipped");
        return Ok(());
    };
    let Some(path) = annex_path(&operation)? else {
        info!(%contract_id, operation_id = %operation.id, "operation has no annex, refresh skipped");
        return Ok(());
    };
    let consumer = load_consumer(services, contract.consumer_id).await?;

    let template = services.storage.download(ANNEX_BUCKET, &path).await?;
    let rendered = services
        .renderer
        .render(template, TemplateSyntax::Spreadsheet, &annex_data(&consumer))
        .await?;
    services
        .storage
        .upload(ANNEX_BUCKET, &path, rendered, XLSX_CONTENT_TYPE, true)
        .await?;

    info!(%contract_id, operation_id = %operation.id, %path, "annex refreshed");
    Ok(())
}

/// Before commissioning: either tell the producer the consumer's cooling-off
/// period is still running, or file the annex with the grid operator and tell
/// both parties the contract is being processed.
///
/// Each external effect goes through `steps`, so a retried declaration picks
/// up where the previous attempt stopped.
pub async fn declare_operation(
    services: &Collaborators,
    contract_id: Uuid,
    now: DateTime<Utc>,
    steps: &CompletedSteps,
) -> DomainResult<()> {
    let contract = load_contract(services, contract_id).await?;
    let consumer = load_consumer(services, contract.consumer_id).await?;
    let producer = load_producer(services, contract.producer_id).await?;
    let producer_email = contact_address(producer.contact_email.as_deref());
    let consumer_email = contact_address(consumer.contact_email.as_deref());

    if contract.current_status()?.within_legal_delay() {
        let Some(producer_email) = producer_email else {
            warn!(%contract_id, producer_id = %producer.id, "producer has no email address, legal delay notice skipped");
            return Ok(());
        };
        let delay_end = contract.created_at + Duration::days(LEGAL_DELAY_NOTICE_DAYS);
        let html = format!(
            "<p>Bonjour {},</p><p>Nous vous informons que le délai légal de réflexion de {} est en cours.</p>\
             <p>Sans refus de sa part, le contrat sera traité à partir du {}.</p>",
            greeting(producer.contact_first_name.as_deref()),
            greeting(consumer.contact_first_name.as_deref()),
            french_date(delay_end)
        );
        services
            .mailer
            .send(&Email::new(
                producer_email,
                "En attente de fin du délai légal de votre acheteur",
                html,
            ))
            .await?;
        info!(%contract_id, "legal delay notice sent to producer");
        return Ok(());
    }

    let Some(operation) = contract_operation(services.store.as_ref(), &contract).await? else {
        info!(%contract_id, "no operation to declare");
        return Ok(());
    };
    let grid_agreement = operation.grid_agreement_id.clone().ok_or_else(|| {
        DomainError::InvalidState(format!("operation {} has no grid agreement", operation.id))
    })?;
    let grid_email = services
        .store
        .grid_contact_email(&grid_agreement)
        .await?
        .ok_or_else(|| DomainError::not_found("grid contact", &grid_agreement))?;
    let old_path = annex_path(&operation)?.ok_or_else(|| {
        DomainError::InvalidState(format!("operation {} has no annex", operation.id))
    })?;
    let installation = services
        .store
        .installation(contract.installation_id)
        .await?
        .ok_or_else(|| DomainError::not_found("installation", contract.installation_id))?;

    let new_path = restamped_annex_path(&old_path, now);
    if new_path != old_path {
        steps
            .once("annex_move", || {
                services.storage.move_object(ANNEX_BUCKET, &old_path, &new_path)
            })
            .await?;
        let url = services.storage.public_url(ANNEX_BUCKET, &new_path);
        services.store.update_operation_annex(operation.id, &url).await?;
        info!(operation_id = %operation.id, from = %old_path, to = %new_path, "annex restamped");
    }

    steps
        .once("grid_filing", || async {
            let annex = services.storage.download(ANNEX_BUCKET, &new_path).await?;
            let file_name = new_path.rsplit('/').next().unwrap_or(&new_path).to_string();
            let municipality = installation.municipality.clone().unwrap_or_default();
            services
                .mailer
                .send(
                    &Email::new(
                        grid_email.clone(),
                        format!("Déclaration préalable d'ACC sur la commune de {}", municipality),
                        "<p>Bonjour,</p>\
                         <p>En tant que mandataire de la PMO de Kinjo, vous trouverez en pièce jointe l'annexe 2.1 \
                         contenant l'ensemble des renseignements nécessaires à l'établissement de la convention d'ACC.</p>\
                         <p>Je vous serais reconnaissant de me communiquer en retour un numéro d'opération d'ACC \
                         ainsi que le projet de convention.</p>",
                    )
                    .with_attachment(file_name, annex),
                )
                .await
        })
        .await?;
    info!(%contract_id, operation_id = %operation.id, "annex filed with grid operator");

    let processing = |first_name: Option<&str>| {
        format!(
            "<p>Bonjour {},</p><p>Nous avons le plaisir de vous informer que votre contrat est en cours de traitement.</p>\
             <p>Une date de mise en service vous sera communiquée dans les prochains jours.</p>",
            greeting(first_name)
        )
    };
    let notices = [
        ("producer_notice", producer_email, producer.contact_first_name.as_deref()),
        ("consumer_notice", consumer_email, consumer.contact_first_name.as_deref()),
    ];
    for (step, address, first_name) in notices {
        let Some(address) = address else {
            warn!(%contract_id, step, "no email address, processing notice skipped");
            continue;
        };
        let email = Email::new(address, "Traitement du contrat en cours", processing(first_name));
        steps.once(step, || services.mailer.send(&email)).await?;
    }

    services.store.mark_operation_declared(operation.id, now).await?;
    info!(%contract_id, operation_id = %operation.id, "operation declared to grid operator");
    Ok(())
}

/// After commissioning: ask the grid operator to admit the consumer meter
/// point, record the admission and confirm it to the consumer. A meter point
/// already listed among the operation's participants is left alone.
pub async fn integrate_participant(
    services: &Collaborators,
    contract_id: Uuid,
    now: DateTime<Utc>,
    steps: &CompletedSteps,
) -> DomainResult<()> {
    let contract = load_contract(services, contract_id).await?;
    let operation = contract_operation(services.store.as_ref(), &contract)
        .await?
        .ok_or_else(|| DomainError::not_found("operation", contract.producer_id))?;
    let agreement = operation.agreement_number.clone().ok_or_else(|| {
        DomainError::InvalidState(format!("operation {} has no agreement number", operation.id))
    })?;
    let credentials = match (&operation.client_id, &operation.client_secret) {
        (Some(client_id), Some(client_secret)) => ClientCredentials {
            client_id: client_id.clone(),
            client_secret: client_secret.clone(),
        },
        _ => {
            return Err(DomainError::InvalidState(format!(
                "operation {} has no metering credentials",
                operation.id
            )))
        }
    };
    let consumer = load_consumer(services, contract.consumer_id).await?;
    let consumer_prm = contract
        .consumer_prm
        .clone()
        .or_else(|| consumer.prm.clone())
        .ok_or_else(|| DomainError::InvalidState(format!("contract {} has no consumer prm", contract.id)))?;

    let admitted = services.store.participants(operation.id).await?;
    if admitted.iter().any(|p| p.consumer_prm == consumer_prm) {
        info!(%contract_id, prm = %consumer_prm, "meter point already admitted");
        return Ok(());
    }

    let installation_prm = match contract.installation_prm.clone() {
        Some(prm) => prm,
        None => {
            services
                .store
                .installation(contract.installation_id)
                .await?
                .ok_or_else(|| DomainError::not_found("installation", contract.installation_id))?
                .prm
        }
    };

    steps
        .once("grid_submission", || async {
            let token = services.metering.access_token(&credentials).await?;
            services
                .metering
                .submit_integration(
                    &token,
                    &agreement,
                    &IntegrationRequest {
                        consumer_prm: consumer_prm.clone(),
                        installation_prm: installation_prm.clone(),
                        consumer_rank: contract.consumer_rank,
                        requested_at: now,
                    },
                )
                .await
        })
        .await?;

    let participant = services
        .store
        .insert_participant(&NewOperationParticipant {
            operation_id: operation.id,
            agreement_number: Some(agreement.clone()),
            entry_requested_at: now,
            entered_at: None,
            producer_id: contract.producer_id,
            consumer_prm: consumer_prm.clone(),
            installation_prm: installation_prm.clone(),
            consumer_id: consumer.id,
            consumer_rank: contract.consumer_rank,
        })
        .await?;
    info!(%contract_id, participant_id = %participant.id, "consumer meter point admitted");

    let Some(address) = contact_address(consumer.contact_email.as_deref()) else {
        warn!(%contract_id, consumer_id = %consumer.id, "consumer has no email address, confirmation skipped");
        return Ok(());
    };
    let html = format!(
        "<p>Bonjour {},</p><p>Votre point de livraison ({}) a été intégré à l'opération.</p>",
        greeting(consumer.contact_first_name.as_deref()),
        consumer_prm
    );
    if let Err(err) = services
        .mailer
        .send(&Email::new(
            address,
            "Votre intégration à l'opération est confirmée",
            html,
        ))
        .await
    {
        warn!(%contract_id, error = %err, "integration confirmation email failed");
    }
    Ok(())
}
