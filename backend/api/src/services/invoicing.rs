//! Invoice orchestrator: one invoice per (consumer meter point, producer meter
//! point, period), and the batch over an operation's period.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{
    compute_invoice_lines, format_invoice_number, invoice_file_stem, invoice_storage_path,
    DomainError, DomainResult, ExciseSchedule, Invoice, NewInvoice,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::templates::{invoice_document_data, payment_due, InvoiceDocument};
use super::{
    convert_to_pdf, Collaborators, WorkDir, INVOICE_BUCKET, INVOICE_TEMPLATE, PDF_CONTENT_TYPE,
};
use crate::documents::TemplateSyntax;
use crate::mailer::{contact_address, Email};
use crate::metrics::{INVOICES_FAILED, INVOICES_GENERATED};
use crate::outbox::{CompletedSteps, PostCommitTask, PostCommitTasks};

#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    pub consumer_prm: String,
    pub producer_prm: String,
    pub contract_id: Uuid,
    pub operation_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceSummary {
    pub id: Uuid,
    pub numero: String,
    pub contrat_id: Uuid,
    pub url: String,
    pub total_ht: f64,
    pub total_tva: f64,
    pub total_ttc: f64,
}

impl From<&Invoice> for InvoiceSummary {
    fn from(invoice: &Invoice) -> Self {
        InvoiceSummary {
            id: invoice.id,
            numero: invoice.number.clone(),
            contrat_id: invoice.contract_id,
            url: invoice.document_url.clone(),
            total_ht: invoice.total_ht,
            total_tva: invoice.total_tva,
            total_ttc: invoice.total_ttc,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationBillingRequest {
    pub operation_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingFailure {
    pub prm: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationBillingOutcome {
    pub factures: Vec<InvoiceSummary>,
    pub ignores: Vec<String>,
    pub echecs: Vec<BillingFailure>,
}

/// The single excise schedule covering `[start, end]`.
pub fn select_excise_schedule(
    mut schedules: Vec<ExciseSchedule>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> DomainResult<ExciseSchedule> {
    match schedules.len() {
        0 => Err(DomainError::not_found(
            "excise schedule",
            format!("{} - {}", start, end),
        )),
        1 => Ok(schedules.remove(0)),
        n => Err(DomainError::InvalidState(format!(
            "{} excise schedules cover {} - {}",
            n, start, end
        ))),
    }
}

/// Generate, store and record one invoice.
pub async fn generate_invoice(
    services: &Collaborators,
    request: InvoiceRequest,
    now: DateTime<Utc>,
) -> DomainResult<(Invoice, PostCommitTasks)> {
    let contract_id = request.contract_id;
    match invoice_flow(services, request, now).await {
        Ok(done) => {
            INVOICES_GENERATED.inc();
            Ok(done)
        }
        Err(err) => {
            INVOICES_FAILED.inc();
            error!(%contract_id, error = %err, "invoice generation failed");
            Err(err)
        }
    }
}

async fn invoice_flow(
    services: &Collaborators,
    request: InvoiceRequest,
    now: DateTime<Utc>,
) -> DomainResult<(Invoice, PostCommitTasks)> {
    let store = services.store.as_ref();

    let consumer = store
        .consumer_by_prm(&request.consumer_prm)
        .await?
        .ok_or_else(|| DomainError::not_found("consumer", &request.consumer_prm))?;
    let producer_installation = store
        .installation_by_prm(&request.producer_prm)
        .await?
        .ok_or_else(|| DomainError::not_found("installation", &request.producer_prm))?;
    let producer = store
        .producer(producer_installation.producer_id)
        .await?
        .ok_or_else(|| DomainError::not_found("producer", producer_installation.producer_id))?;
    let contract = store
        .contract(request.contract_id)
        .await?
        .ok_or_else(|| DomainError::not_found("contract", request.contract_id))?;
    let installation = store
        .installation(contract.installation_id)
        .await?
        .ok_or_else(|| DomainError::not_found("installation", contract.installation_id))?;

    let consumption = store
        .latest_consumption(request.operation_id, &request.consumer_prm, request.start, request.end)
        .await?
        .ok_or_else(|| DomainError::not_found("consumption record", &request.consumer_prm))?;
    let excise = select_excise_schedule(
        store
            .excise_schedules_covering(consumption.start_date, consumption.end_date)
            .await?,
        consumption.start_date,
        consumption.end_date,
    )?;

    let computation = compute_invoice_lines(
        &consumption.self_consumption(),
        &contract.tariff_schedule(),
        &excise.rates(),
    );
    let sequence = store.peek_invoice_sequence(&request.producer_prm).await?;
    let number = format_invoice_number(sequence);
    info!(
        contract_id = %contract.id,
        invoice_number = %number,
        total_ttc = computation.total_ttc,
        step = "compute",
        "invoice computed"
    );

    let data = invoice_document_data(&InvoiceDocument {
        number: &number,
        issued_at: now,
        contract: &contract,
        consumer: &consumer,
        producer: &producer,
        installation: &installation,
        consumption: &consumption,
        computation: &computation,
    });
    let template = services.storage.download(INVOICE_BUCKET, INVOICE_TEMPLATE).await?;
    let docx = services
        .renderer
        .render(template, TemplateSyntax::Document, &data)
        .await?;

    let stem = invoice_file_stem(&request.producer_prm, &number);
    let work_dir = WorkDir::create(&services.settings.temp_dir).await?;
    let pdf = convert_to_pdf(
        services.converter.as_ref(),
        &work_dir,
        &format!("{}.docx", stem),
        &docx,
    )
    .await;
    work_dir.remove().await;
    let pdf = pdf?;

    let path = invoice_storage_path(request.operation_id, now, &format!("{}.pdf", stem));
    let url = services
        .storage
        .upload(INVOICE_BUCKET, &path, pdf, PDF_CONTENT_TYPE, false)
        .await?;

    // The number is only consumed here; on failure the uploaded PDF is
    // withdrawn so the next attempt can reuse both the number and the path.
    let recorded = store
        .insert_invoice(&NewInvoice {
            contract_id: contract.id,
            producer_prm: request.producer_prm.clone(),
            sequence,
            number: number.clone(),
            document_url: url,
            storage_path: path.clone(),
            issued_at: now,
            due_at: payment_due(now),
            total_ht: computation.total_ht,
            total_tva: computation.total_tva,
            total_ttc: computation.total_ttc,
        })
        .await;
    let invoice = match recorded {
        Ok(invoice) => invoice,
        Err(err) => {
            if let Err(cleanup) = services.storage.remove(INVOICE_BUCKET, &[path]).await {
                warn!(invoice_number = %number, error = %cleanup, "orphan invoice PDF left in storage");
            }
            return Err(err);
        }
    };
    info!(invoice_id = %invoice.id, invoice_number = %number, step = "record", "invoice recorded");

    let mut tasks = PostCommitTasks::new();
    match contact_address(consumer.contact_email.as_deref()) {
        Some(recipient) => tasks.push(invoice_email_task(
            services,
            &invoice,
            Email::new(
                recipient,
                format!("Votre facture {} est disponible", number),
                format!(
                    "<p>Bonjour,</p><p>Votre facture <strong>{}</strong> de {} est disponible.</p>\
                     <p>Vous pouvez la télécharger via le lien suivant :</p>\
                     <p><a href=\"{}/factures/{}\">Télécharger ma facture</a></p>",
                    number,
                    producer.display_name(),
                    services.settings.backend_base_url,
                    invoice.id
                ),
            ),
        )),
        None => warn!(
            invoice_id = %invoice.id,
            consumer_id = %consumer.id,
            "consumer has no email address, invoice notice skipped"
        ),
    }
    Ok((invoice, tasks))
}

/// Mail the invoice link, then stamp the row. An invoice already stamped is
/// never mailed twice, and a failed stamp does not resend the mail on retry.
fn invoice_email_task(services: &Collaborators, invoice: &Invoice, email: Email) -> PostCommitTask {
    let svc = services.clone();
    let invoice_id = invoice.id;
    let steps = CompletedSteps::new();
    PostCommitTask::new("invoice_email", move || {
        let (svc, email, steps) = (svc.clone(), email.clone(), steps.clone());
        async move {
            let stored = svc
                .store
                .invoice(invoice_id)
                .await?
                .ok_or_else(|| DomainError::not_found("invoice", invoice_id))?;
            if stored.notified_at.is_some() {
                info!(%invoice_id, "invoice already notified");
                return Ok(());
            }
            steps.once("send", || svc.mailer.send(&email)).await?;
            svc.store.mark_invoice_notified(invoice_id, Utc::now()).await
        }
    })
}

/// Invoice every meter point of an operation that has a consumption record
/// for exactly this period. Meter points without a contract are skipped.
pub async fn generate_operation_invoices(
    services: &Collaborators,
    request: OperationBillingRequest,
    now: DateTime<Utc>,
) -> DomainResult<(OperationBillingOutcome, PostCommitTasks)> {
    let store = services.store.as_ref();
    let operation = store
        .operation(request.operation_id)
        .await?
        .ok_or_else(|| DomainError::not_found("operation", request.operation_id))?;
    let records = store
        .consumption_for_period(operation.id, request.start, request.end)
        .await?;
    if records.is_empty() {
        return Err(DomainError::not_found(
            "consumption record",
            format!("operation {} for {} - {}", operation.id, request.start, request.end),
        ));
    }

    let mut outcome = OperationBillingOutcome::default();
    let mut tasks = PostCommitTasks::new();
    for record in records {
        let Some(contract) = store
            .contract_for_consumer_prm(operation.producer_id, &record.prm)
            .await?
        else {
            warn!(operation_id = %operation.id, prm = %record.prm, "no contract for meter point, skipped");
            outcome.ignores.push(record.prm);
            continue;
        };

        let single = match store.installation(contract.installation_id).await? {
            Some(installation) => {
                generate_invoice(
                    services,
                    InvoiceRequest {
                        consumer_prm: record.prm.clone(),
                        producer_prm: installation.prm,
                        contract_id: contract.id,
                        operation_id: operation.id,
                        start: record.start_date,
                        end: record.end_date,
                    },
                    now,
                )
                .await
            }
            None => Err(DomainError::not_found("installation", contract.installation_id)),
        };

        match single {
            Ok((invoice, invoice_tasks)) => {
                outcome.factures.push(InvoiceSummary::from(&invoice));
                tasks.extend(invoice_tasks);
            }
            Err(err) => outcome.echecs.push(BillingFailure {
                prm: record.prm,
                error: err.to_string(),
            }),
        }
    }

    info!(
        operation_id = %operation.id,
        generated = outcome.factures.len(),
        skipped = outcome.ignores.len(),
        failed = outcome.echecs.len(),
        "operation billing done"
    );
    Ok((outcome, tasks))
}

/// Short-lived download link of a stored invoice.
pub async fn invoice_download_url(services: &Collaborators, id: Uuid) -> DomainResult<String> {
    let invoice = services
        .store
        .invoice(id)
        .await?
        .ok_or_else(|| DomainError::not_found("invoice", id))?;
    if invoice.storage_path.is_empty() {
        return Err(DomainError::InvalidState(format!(
            "invoice {} has no storage path",
            id
        )));
    }
    services
        .storage
        .signed_url(
            INVOICE_BUCKET,
            &invoice.storage_path,
            services.settings.signed_url_ttl_secs,
        )
        .await
}
