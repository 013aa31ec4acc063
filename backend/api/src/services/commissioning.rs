//! Commissioning of an operation: once the grid operator sets the start date,
//! every committed contract's meter point enters the operation on that date
//! and the parties are told.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{Contract, DomainError, DomainResult, NewOperationParticipant, Operation};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::templates::french_date;
use super::Collaborators;
use crate::mailer::{contact_address, Email};
use crate::outbox::{PostCommitTask, PostCommitTasks};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct StartDateOutcome {
    pub operation_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub inserted_count: u64,
}

fn start_date_email(to: String, first_name: Option<&str>, agreement: &str, start: DateTime<Utc>) -> Email {
    let greeting = first_name.filter(|n| !n.is_empty()).unwrap_or("");
    Email::new(
        to,
        format!("Confirmation date de mise en service - ACC {}", agreement),
        format!(
            "<p>Bonjour {},</p>\
             <p>L'opération d'autoconsommation collective {} démarrera le {}.</p>\
             <p>À compter de cette date, votre énergie sera répartie dans le cadre de l'opération.</p>\
             <p>L'équipe Kinjo</p>",
            greeting,
            agreement,
            french_date(start)
        ),
    )
}

/// Meter point row for a contract entering at `start`. Contracts signed by
/// nobody yet have no entry request and are left out.
async fn admission(
    store: &dyn Store,
    operation: &Operation,
    contract: &Contract,
    start: DateTime<Utc>,
) -> DomainResult<Option<NewOperationParticipant>> {
    let Some(requested_at) = contract.consumer_signed_at else {
        warn!(contract_id = %contract.id, "contract never signed by the consumer, not admitted");
        return Ok(None);
    };
    let consumer_prm = match contract.consumer_prm.clone() {
        Some(prm) => prm,
        None => match store.consumer(contract.consumer_id).await?.and_then(|c| c.prm) {
            Some(prm) => prm,
            None => {
                warn!(contract_id = %contract.id, "consumer has no meter point, not admitted");
                return Ok(None);
            }
        },
    };
    let installation_prm = match contract.installation_prm.clone() {
        Some(prm) => prm,
        None => store
            .installation(contract.installation_id)
            .await?
            .map(|i| i.prm)
            .ok_or_else(|| DomainError::not_found("installation", contract.installation_id))?,
    };
    Ok(Some(NewOperationParticipant {
        operation_id: operation.id,
        agreement_number: operation.agreement_number.clone(),
        entry_requested_at: requested_at,
        entered_at: Some(start),
        producer_id: operation.producer_id,
        consumer_prm,
        installation_prm,
        consumer_id: contract.consumer_id,
        consumer_rank: contract.consumer_rank,
    }))
}

fn mail_task(services: &Collaborators, name: &'static str, email: Email, pause: Duration) -> PostCommitTask {
    let svc = services.clone();
    PostCommitTask::new(name, move || {
        let (svc, email) = (svc.clone(), email.clone());
        async move {
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            svc.mailer.send(&email).await
        }
    })
}

/// Admit the meter points of every committed contract of the operation's
/// producer and queue the start-date notices. Meter points already admitted
/// are left alone.
pub async fn confirm_start_date(
    services: &Collaborators,
    operation_id: Uuid,
) -> DomainResult<(StartDateOutcome, PostCommitTasks)> {
    let store = services.store.as_ref();
    let operation = store
        .operation(operation_id)
        .await?
        .ok_or_else(|| DomainError::not_found("operation", operation_id))?;
    let agreement = operation.agreement_number.clone().ok_or_else(|| {
        DomainError::InvalidState(format!("operation {} has no agreement number", operation_id))
    })?;
    let start = operation.start_date.ok_or_else(|| {
        DomainError::InvalidState(format!("operation {} has no start date", operation_id))
    })?;
    let producer = store
        .producer(operation.producer_id)
        .await?
        .ok_or_else(|| DomainError::not_found("producer", operation.producer_id))?;

    let mut committed = Vec::new();
    for contract in store.contracts_of_producer(producer.id).await? {
        if contract.current_status()?.enters_at_start() {
            committed.push(contract);
        }
    }

    let mut rows = Vec::with_capacity(committed.len());
    for contract in &committed {
        if let Some(row) = admission(store, &operation, contract, start).await? {
            rows.push(row);
        }
    }
    let inserted_count = store.insert_participants(&rows).await?;
    info!(%operation_id, committed = committed.len(), inserted_count, "meter points admitted at start date");

    let pacing = Duration::from_millis(services.settings.mail_pacing_ms);
    let mut tasks = PostCommitTasks::new();
    match contact_address(producer.contact_email.as_deref()) {
        Some(to) => tasks.push(mail_task(
            services,
            "start_date_producer_email",
            start_date_email(to, producer.contact_first_name.as_deref(), &agreement, start),
            Duration::ZERO,
        )),
        None => warn!(producer_id = %producer.id, "producer has no email address, start date notice skipped"),
    }

    let mut notified = HashSet::new();
    for contract in &committed {
        if !notified.insert(contract.consumer_id) {
            continue;
        }
        let Some(consumer) = store.consumer(contract.consumer_id).await? else {
            warn!(consumer_id = %contract.consumer_id, "consumer row missing, start date notice skipped");
            continue;
        };
        match contact_address(consumer.contact_email.as_deref()) {
            Some(to) => tasks.push(mail_task(
                services,
                "start_date_consumer_email",
                start_date_email(to, consumer.contact_first_name.as_deref(), &agreement, start),
                pacing,
            )),
            None => warn!(consumer_id = %consumer.id, "consumer has no email address, start date notice skipped"),
        }
    }

    Ok((
        StartDateOutcome {
            operation_id,
            start_date: start,
            inserted_count,
        },
        tasks,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn notice_names_the_operation_and_date() {
        let start = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let email = start_date_email("p@kinjo.test".into(), Some("Paul"), "ACC00042", start);
        assert_eq!(email.subject, "Confirmation date de mise en service - ACC ACC00042");
        assert!(email.html.contains("Bonjour Paul"));
        assert!(email.html.contains("01/04/2025"));
    }
}
