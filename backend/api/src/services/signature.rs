//! Consumer and producer signature flows.
//!
//! Each flow runs its critical steps in order and stops at the first failure;
//! the signature commit is the point of no return. Everything that follows it
//! is handed back as [`PostCommitTasks`] for the caller to run after the
//! response.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    resolve_status, Consumer, ConsumerSignatureCommit, Contract, ContractStatus, DomainError,
    DomainResult, Installation, OperationPhase, Party, Producer, ProducerSignatureCommit, SignerRole,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::integration::{declare_operation, integrate_participant, refresh_annex};
use super::status::{contract_operation, status_inputs};
use super::templates::{
    contract_document_data, contract_file_stem, fully_signed_path, stale_contract_paths,
    CONSUMER_SIGNED_SUFFIX,
};
use super::{
    convert_to_pdf, read_local_template, resolve_party, Collaborators, WorkDir, CONTRACT_BUCKET,
    CONTRACT_TEMPLATE, PDF_CONTENT_TYPE,
};
use crate::documents::{SignatureMark, TemplateSyntax};
use crate::mailer::{contact_address, Email};
use crate::metrics;
use crate::outbox::{CompletedSteps, PostCommitTask, PostCommitTasks};
use crate::storage::object_path_from_public_url;

const CONSUMER_FOLDER: &str = "consommateurs";

#[derive(Debug, Clone)]
pub struct ConsumerSignatureRequest {
    pub contract_id: Uuid,
    pub consumer_id: Uuid,
    pub producer_id: Uuid,
    pub installation_id: Uuid,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerSignatureOutcome {
    pub url: String,
    pub statut: ContractStatus,
    pub consommateur_rang: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ProducerSignatureRequest {
    pub contract_id: Uuid,
    pub token: String,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerSignatureOutcome {
    pub url_document: String,
    pub statut: ContractStatus,
}

struct ContractParties {
    contract: Contract,
    consumer: Consumer,
    producer: Producer,
    installation: Installation,
}

async fn load_parties(services: &Collaborators, contract: Contract) -> DomainResult<ContractParties> {
    let store = services.store.as_ref();
    let consumer = store
        .consumer(contract.consumer_id)
        .await?
        .ok_or_else(|| DomainError::not_found("consumer", contract.consumer_id))?;
    let producer = store
        .producer(contract.producer_id)
        .await?
        .ok_or_else(|| DomainError::not_found("producer", contract.producer_id))?;
    let installation = store
        .installation(contract.installation_id)
        .await?
        .ok_or_else(|| DomainError::not_found("installation", contract.installation_id))?;
    Ok(ContractParties {
        contract,
        consumer,
        producer,
        installation,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// CONSUMER
// ═══════════════════════════════════════════════════════════════════════════

/// Generate, sign and store the contract on the consumer's side, then commit
/// the signature (which also assigns the consumer rank).
pub async fn sign_as_consumer(
    services: &Collaborators,
    request: ConsumerSignatureRequest,
    now: DateTime<Utc>,
) -> DomainResult<(ConsumerSignatureOutcome, PostCommitTasks)> {
    let contract_id = request.contract_id;
    let result = consumer_flow(services, request, now).await;
    metrics::record_signature(SignerRole::Consumer.as_str(), result.is_ok());
    if let Err(err) = &result {
        error!(%contract_id, error = %err, "consumer signature failed");
    }
    result
}

async fn consumer_flow(
    services: &Collaborators,
    request: ConsumerSignatureRequest,
    now: DateTime<Utc>,
) -> DomainResult<(ConsumerSignatureOutcome, PostCommitTasks)> {
    let contract = services
        .store
        .contract(request.contract_id)
        .await?
        .ok_or_else(|| DomainError::not_found("contract", request.contract_id))?;
    if contract.consumer_id != request.consumer_id
        || contract.producer_id != request.producer_id
        || contract.installation_id != request.installation_id
    {
        return Err(DomainError::InvalidInput(format!(
            "parties do not match contract {}",
            contract.id
        )));
    }
    if contract.consumer_signed_at.is_some() {
        return Err(DomainError::Conflict(format!(
            "contract {} already signed by the consumer",
            contract.id
        )));
    }

    let parties = load_parties(services, contract).await?;
    let stem = contract_file_stem(&parties.consumer, &parties.producer);
    info!(contract_id = %parties.contract.id, %stem, step = "load", "contract parties loaded");

    let work_dir = WorkDir::create(&services.settings.temp_dir).await?;
    let (url, status, committed) =
        match store_and_commit(services, &parties, &stem, &work_dir, &request, now).await {
            Ok(done) => done,
            Err(err) => {
                work_dir.remove().await;
                return Err(err);
            }
        };

    let tasks = consumer_post_commit(services, &parties, work_dir);
    Ok((
        ConsumerSignatureOutcome {
            url,
            statut: status,
            consommateur_rang: committed.consumer_rank,
        },
        tasks,
    ))
}

/// Critical section of the consumer flow: document, upload, status, commit.
async fn store_and_commit(
    services: &Collaborators,
    parties: &ContractParties,
    stem: &str,
    work_dir: &WorkDir,
    request: &ConsumerSignatureRequest,
    now: DateTime<Utc>,
) -> DomainResult<(String, ContractStatus, Contract)> {
    let signed = generate_consumer_pdf(services, parties, stem, work_dir, request, now).await?;

    let path = format!("{}/{}{}", CONSUMER_FOLDER, stem, CONSUMER_SIGNED_SUFFIX);
    let url = services
        .storage
        .upload(CONTRACT_BUCKET, &path, signed, PDF_CONTENT_TYPE, true)
        .await?;
    info!(contract_id = %parties.contract.id, %path, step = "upload", "consumer copy stored");

    let operation = contract_operation(services.store.as_ref(), &parties.contract).await?;
    let inputs = status_inputs(
        services.store.as_ref(),
        &parties.consumer,
        operation.as_ref(),
        Some(now),
        parties.contract.producer_signed_at,
    )
    .await?;
    let status = resolve_status(&inputs, now)?;

    let committed = services
        .store
        .commit_consumer_signature(
            parties.contract.id,
            parties.contract.version,
            &ConsumerSignatureCommit {
                signed_at: now,
                status,
                document_url: url.clone(),
                consumer_ip: request.client_ip.clone(),
            },
        )
        .await?;
    info!(
        contract_id = %committed.id,
        status = status.as_str(),
        rank = ?committed.consumer_rank,
        step = "commit",
        "consumer signature committed"
    );
    Ok((url, status, committed))
}

async fn generate_consumer_pdf(
    services: &Collaborators,
    parties: &ContractParties,
    stem: &str,
    work_dir: &WorkDir,
    request: &ConsumerSignatureRequest,
    now: DateTime<Utc>,
) -> DomainResult<Vec<u8>> {
    let template = read_local_template(&services.settings.template_dir, CONTRACT_TEMPLATE).await?;
    let data = contract_document_data(
        &parties.contract,
        &parties.consumer,
        &parties.producer,
        &parties.installation,
        now,
    );
    let docx = services
        .renderer
        .render(template, TemplateSyntax::Document, &data)
        .await?;
    let pdf = convert_to_pdf(
        services.converter.as_ref(),
        work_dir,
        &format!("{}.docx", stem),
        &docx,
    )
    .await?;
    let mark = SignatureMark {
        signer_id: parties.consumer.id.to_string(),
        role: SignerRole::Consumer,
        signed_at: now,
        ip: request.client_ip.clone(),
    };
    services.signer.sign(pdf, &mark).await
}

fn consumer_post_commit(
    services: &Collaborators,
    parties: &ContractParties,
    work_dir: WorkDir,
) -> PostCommitTasks {
    let mut tasks = PostCommitTasks::new();
    let contract_id = parties.contract.id;

    let svc = services.clone();
    tasks.push(PostCommitTask::new("annex_refresh", move || {
        let svc = svc.clone();
        async move { refresh_annex(&svc, contract_id).await }
    }));

    match contact_address(parties.producer.contact_email.as_deref()) {
        Some(address) => {
            let mailer = services.mailer.clone();
            let email = Email::new(
                address,
                "Nouveau contrat de vente d'énergie locale à signer",
                format!(
                    "<p>Bonjour {},</p><p>{} vient de signer un contrat de vente d'énergie locale avec vous.</p>\
                     <p>Connectez-vous à votre espace pour le signer à votre tour.</p>",
                    parties.producer.contact_first_name.as_deref().unwrap_or_default(),
                    parties.consumer.holder_name()
                ),
            );
            tasks.push(PostCommitTask::new("producer_email", move || {
                let mailer = mailer.clone();
                let email = email.clone();
                async move { mailer.send(&email).await }
            }));
        }
        None => warn!(
            %contract_id,
            producer_id = %parties.producer.id,
            "producer has no email address, signing request skipped"
        ),
    }

    tasks.push(PostCommitTask::new("scratch_cleanup", move || {
        let work_dir = work_dir.clone();
        async move {
            work_dir.remove().await;
            Ok(())
        }
    }));
    tasks
}

// ═══════════════════════════════════════════════════════════════════════════
// PRODUCER
// ═══════════════════════════════════════════════════════════════════════════

/// Countersign the consumer-signed contract on behalf of the authenticated
/// producer.
pub async fn sign_as_producer(
    services: &Collaborators,
    request: ProducerSignatureRequest,
    now: DateTime<Utc>,
) -> DomainResult<(ProducerSignatureOutcome, PostCommitTasks)> {
    let contract_id = request.contract_id;
    let result = producer_flow(services, request, now).await;
    metrics::record_signature(SignerRole::Producer.as_str(), result.is_ok());
    if let Err(err) = &result {
        error!(%contract_id, error = %err, "producer signature failed");
    }
    result
}

async fn producer_flow(
    services: &Collaborators,
    request: ProducerSignatureRequest,
    now: DateTime<Utc>,
) -> DomainResult<(ProducerSignatureOutcome, PostCommitTasks)> {
    let user_id = services.auth.user_id(&request.token).await?;
    let contract = services
        .store
        .contract(request.contract_id)
        .await?
        .ok_or_else(|| DomainError::not_found("contract", request.contract_id))?;
    let producer = match resolve_party(services.store.as_ref(), user_id).await? {
        Some(Party::Producer(producer)) if producer.id == contract.producer_id => producer,
        _ => {
            return Err(DomainError::Forbidden(format!(
                "user {} is not the producer of this contract",
                user_id
            )))
        }
    };
    if contract.producer_signed_at.is_some() {
        return Err(DomainError::Conflict(format!(
            "contract {} already signed by the producer",
            contract.id
        )));
    }
    let consumer = services
        .store
        .consumer(contract.consumer_id)
        .await?
        .ok_or_else(|| DomainError::not_found("consumer", contract.consumer_id))?;

    let consumer_url = contract
        .document_url
        .clone()
        .ok_or_else(|| DomainError::not_found("consumer-signed document", contract.id))?;
    let consumer_path = object_path_from_public_url(&consumer_url, CONTRACT_BUCKET)
        .ok_or_else(|| DomainError::InvalidState(format!("unrecognised document url: {}", consumer_url)))?;

    let pdf = services.storage.download(CONTRACT_BUCKET, &consumer_path).await?;
    let mark = SignatureMark {
        signer_id: producer.id.to_string(),
        role: SignerRole::Producer,
        signed_at: now,
        ip: request.client_ip.clone(),
    };
    let signed = services.signer.sign(pdf, &mark).await?;
    info!(contract_id = %contract.id, step = "sign", "producer mark applied");

    let stale = stale_contract_paths(&consumer_path);
    if let Err(err) = services.storage.remove(CONTRACT_BUCKET, &stale).await {
        warn!(contract_id = %contract.id, error = %err, "stale contract artefacts not removed");
    }

    let final_path = fully_signed_path(&consumer_path);
    let url = services
        .storage
        .upload(CONTRACT_BUCKET, &final_path, signed, PDF_CONTENT_TYPE, true)
        .await?;
    info!(contract_id = %contract.id, path = %final_path, step = "upload", "signed contract stored");

    let operation = contract_operation(services.store.as_ref(), &contract).await?;
    let inputs = status_inputs(
        services.store.as_ref(),
        &consumer,
        operation.as_ref(),
        contract.consumer_signed_at,
        Some(now),
    )
    .await?;
    let status = resolve_status(&inputs, now)?;

    let committed = services
        .store
        .commit_producer_signature(
            contract.id,
            contract.version,
            &ProducerSignatureCommit {
                signed_at: now,
                status,
                document_url: url.clone(),
            },
        )
        .await?;
    info!(contract_id = %committed.id, status = status.as_str(), step = "commit", "producer signature committed");

    let phase = OperationPhase::from_status(operation.as_ref().map(|o| o.status));
    let tasks = producer_post_commit(services, &committed, &consumer, &producer, phase, now);
    Ok((
        ProducerSignatureOutcome {
            url_document: url,
            statut: status,
        },
        tasks,
    ))
}

fn producer_post_commit(
    services: &Collaborators,
    contract: &Contract,
    consumer: &Consumer,
    producer: &Producer,
    phase: Option<OperationPhase>,
    now: DateTime<Utc>,
) -> PostCommitTasks {
    let mut tasks = PostCommitTasks::new();
    let contract_id = contract.id;

    match phase {
        Some(OperationPhase::PreCommissioning) => {
            let svc = services.clone();
            tasks.push(PostCommitTask::new("annex_refresh", move || {
                let svc = svc.clone();
                async move { refresh_annex(&svc, contract_id).await }
            }));
            let svc = services.clone();
            let steps = CompletedSteps::new();
            tasks.push(PostCommitTask::new("operation_declaration", move || {
                let (svc, steps) = (svc.clone(), steps.clone());
                async move { declare_operation(&svc, contract_id, now, &steps).await }
            }));
        }
        _ => {
            let svc = services.clone();
            let steps = CompletedSteps::new();
            tasks.push(PostCommitTask::new("participant_integration", move || {
                let (svc, steps) = (svc.clone(), steps.clone());
                async move { integrate_participant(&svc, contract_id, now, &steps).await }
            }));
        }
    }

    let Some(address) = contact_address(consumer.contact_email.as_deref()) else {
        warn!(%contract_id, consumer_id = %consumer.id, "consumer has no email address, countersignature notice skipped");
        return tasks;
    };
    let mailer = services.mailer.clone();
    let producer_name = format!(
        "{} {}",
        producer.contact_first_name.as_deref().unwrap_or("un producteur"),
        producer.contact_last_name.as_deref().unwrap_or_default()
    )
    .trim()
    .to_string();
    let email = Email::new(
        address,
        format!("Contrat de vente d'énergie locale signé par {}", producer_name),
        format!(
            "<p>Bonjour {},</p><p>Le contrat de vente d'énergie locale a été signé par {}.</p>\
             <p>Il prendra effet au plus tard dans 15 jours si vous avez renoncé au délai légal de rétractation, \
             dans 30 jours sinon.</p><p>Vous serez informé prochainement de la date définitive d'effet du contrat.</p>",
            consumer.contact_first_name.as_deref().unwrap_or_default(),
            producer_name
        ),
    );
    tasks.push(PostCommitTask::new("consumer_email", move || {
        let mailer = mailer.clone();
        let email = email.clone();
        async move { mailer.send(&email).await }
    }));
    tasks
}
