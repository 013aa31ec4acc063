use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    ConsentIdentity, Consumer, ConsumerSignatureCommit, ConsumptionRecord, Contract,
    DataSharingAuthorization, DomainError, DomainResult, ExciseSchedule, Installation, Invoice,
    NewDataSharingAuthorization, NewInvoice, NewOperationParticipant, NewParticipationAgreement,
    NewRetractionWaiver, NewTermsAcceptance, Operation, OperationParticipant,
    ParticipationAgreement, Producer, ProducerSignatureCommit, RetractionWaiver, TermsAcceptance,
    INVOICE_KIND_INVOICE,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Store;

#[derive(Default)]
struct Tables {
    consumers: Vec<Consumer>,
    producers: Vec<Producer>,
    installations: Vec<Installation>,
    operations: Vec<Operation>,
    grid_contacts: HashMap<String, String>,
    participants: Vec<OperationParticipant>,
    contracts: Vec<Contract>,
    rank_counters: HashMap<Uuid, i32>,
    waivers: Vec<RetractionWaiver>,
    terms: Vec<TermsAcceptance>,
    data_sharing: Vec<DataSharingAuthorization>,
    participation: Vec<ParticipationAgreement>,
    consumption: Vec<ConsumptionRecord>,
    excise: Vec<ExciseSchedule>,
    invoice_counters: HashMap<String, i64>,
    invoices: Vec<Invoice>,
}

impl Tables {
    fn contract_mut(&mut self, id: Uuid, expected_version: i64) -> DomainResult<&mut Contract> {
        let contract = self
            .contracts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DomainError::not_found("contract", id))?;
        if contract.version != expected_version {
            return Err(DomainError::Conflict(format!(
                "contract {} changed since version {}",
                id, expected_version
            )));
        }
        Ok(contract)
    }

    fn admitted(&self, operation_id: Uuid, consumer_prm: &str) -> bool {
        self.participants
            .iter()
            .any(|p| p.operation_id == operation_id && p.consumer_prm == consumer_prm)
    }

    fn admit(&mut self, p: &NewOperationParticipant) -> OperationParticipant {
        let row = OperationParticipant {
            id: Uuid::new_v4(),
            operation_id: p.operation_id,
            agreement_number: p.agreement_number.clone(),
            entry_requested_at: p.entry_requested_at,
            entered_at: p.entered_at,
            producer_id: p.producer_id,
            consumer_prm: p.consumer_prm.clone(),
            installation_prm: p.installation_prm.clone(),
            consumer_id: p.consumer_id,
            consumer_rank: p.consumer_rank,
        };
        self.participants.push(row.clone());
        row
    }

    fn last_invoice_number(&self, producer_prm: &str) -> i64 {
        if let Some(last) = self.invoice_counters.get(producer_prm) {
            return *last;
        }
        self.invoices
            .iter()
            .filter(|i| i.producer_prm == producer_prm && i.kind == INVOICE_KIND_INVOICE)
            .filter_map(|i| i.number.parse::<i64>().ok())
            .max()
            .unwrap_or(0)
    }
}

/// In-process store with the same semantics as [`super::PgStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_consumer(&self, consumer: Consumer) {
        self.tables.write().await.consumers.push(consumer);
    }

    pub async fn add_producer(&self, producer: Producer) {
        self.tables.write().await.producers.push(producer);
    }

    pub async fn add_installation(&self, installation: Installation) {
        self.tables.write().await.installations.push(installation);
    }

    pub async fn add_operation(&self, operation: Operation) {
        self.tables.write().await.operations.push(operation);
    }

    pub async fn add_grid_contact(&self, grid_agreement_id: &str, email: &str) {
        self.tables
            .write()
            .await
            .grid_contacts
            .insert(grid_agreement_id.to_string(), email.to_string());
    }

    pub async fn add_contract(&self, contract: Contract) {
        self.tables.write().await.contracts.push(contract);
    }

    pub async fn add_excise_schedule(&self, schedule: ExciseSchedule) {
        self.tables.write().await.excise.push(schedule);
    }

    pub async fn add_invoice(&self, invoice: Invoice) {
        self.tables.write().await.invoices.push(invoice);
    }

    /// Simulates a concurrent writer touching the row.
    pub async fn bump_contract_version(&self, id: Uuid) {
        let mut tables = self.tables.write().await;
        if let Some(contract) = tables.contracts.iter_mut().find(|c| c.id == id) {
            contract.version += 1;
        }
    }

    pub async fn invoices(&self) -> Vec<Invoice> {
        self.tables.read().await.invoices.clone()
    }

    pub async fn consumption_records(&self) -> Vec<ConsumptionRecord> {
        self.tables.read().await.consumption.clone()
    }

    pub async fn terms_acceptances(&self) -> Vec<TermsAcceptance> {
        self.tables.read().await.terms.clone()
    }

    pub async fn data_sharing_authorizations(&self) -> Vec<DataSharingAuthorization> {
        self.tables.read().await.data_sharing.clone()
    }

    pub async fn participation_agreements(&self) -> Vec<ParticipationAgreement> {
        self.tables.read().await.participation.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> DomainResult<()> {
        Ok(())
    }

    async fn contract(&self, id: Uuid) -> DomainResult<Option<Contract>> {
        let tables = self.tables.read().await;
        Ok(tables.contracts.iter().find(|c| c.id == id).cloned())
    }

    async fn consumer(&self, id: Uuid) -> DomainResult<Option<Consumer>> {
        let tables = self.tables.read().await;
        Ok(tables.consumers.iter().find(|c| c.id == id).cloned())
    }

    async fn consumer_by_user(&self, user_id: Uuid) -> DomainResult<Option<Consumer>> {
        let tables = self.tables.read().await;
        Ok(tables.consumers.iter().find(|c| c.user_id == user_id).cloned())
    }

    async fn consumer_by_prm(&self, prm: &str) -> DomainResult<Option<Consumer>> {
        let tables = self.tables.read().await;
        Ok(tables
            .consumers
            .iter()
            .filter(|c| c.prm.as_deref() == Some(prm))
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn producer(&self, id: Uuid) -> DomainResult<Option<Producer>> {
        let tables = self.tables.read().await;
        Ok(tables.producers.iter().find(|p| p.id == id).cloned())
    }

    async fn producer_by_user(&self, user_id: Uuid) -> DomainResult<Option<Producer>> {
        let tables = self.tables.read().await;
        Ok(tables.producers.iter().find(|p| p.user_id == user_id).cloned())
    }

    async fn installation(&self, id: Uuid) -> DomainResult<Option<Installation>> {
        let tables = self.tables.read().await;
        Ok(tables.installations.iter().find(|i| i.id == id).cloned())
    }

    async fn installation_by_prm(&self, prm: &str) -> DomainResult<Option<Installation>> {
        let tables = self.tables.read().await;
        Ok(tables.installations.iter().find(|i| i.prm == prm).cloned())
    }

    async fn installations_of_producer(&self, producer_id: Uuid) -> DomainResult<Vec<Installation>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Installation> = tables
            .installations
            .iter()
            .filter(|i| i.producer_id == producer_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.prm.cmp(&b.prm));
        Ok(rows)
    }

    async fn contracts_of_producer(&self, producer_id: Uuid) -> DomainResult<Vec<Contract>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Contract> = tables
            .contracts
            .iter()
            .filter(|c| c.producer_id == producer_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    async fn contract_for_consumer_prm(
        &self,
        producer_id: Uuid,
        consumer_prm: &str,
    ) -> DomainResult<Option<Contract>> {
        let tables = self.tables.read().await;
        Ok(tables
            .contracts
            .iter()
            .filter(|c| c.producer_id == producer_id && c.consumer_prm.as_deref() == Some(consumer_prm))
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn operation(&self, id: Uuid) -> DomainResult<Option<Operation>> {
        let tables = self.tables.read().await;
        Ok(tables.operations.iter().find(|o| o.id == id).cloned())
    }

    async fn operation_for_producer(&self, producer_id: Uuid) -> DomainResult<Option<Operation>> {
        let tables = self.tables.read().await;
        Ok(tables
            .operations
            .iter()
            .find(|o| o.producer_id == producer_id)
            .cloned())
    }

    async fn update_operation_annex(&self, id: Uuid, annex_url: &str) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let operation = tables
            .operations
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| DomainError::not_found("operation", id))?;
        operation.annex_url = Some(annex_url.to_string());
        Ok(())
    }

    async fn mark_operation_declared(&self, id: Uuid, mailed_at: DateTime<Utc>) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let operation = tables
            .operations
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| DomainError::not_found("operation", id))?;
        operation.status = 1;
        operation.annex_mailed_at = Some(mailed_at);
        Ok(())
    }

    async fn grid_contact_email(&self, grid_agreement_id: &str) -> DomainResult<Option<String>> {
        let tables = self.tables.read().await;
        Ok(tables.grid_contacts.get(grid_agreement_id).cloned())
    }

    async fn participants(&self, operation_id: Uuid) -> DomainResult<Vec<OperationParticipant>> {
        let tables = self.tables.read().await;
        Ok(tables
            .participants
            .iter()
            .filter(|p| p.operation_id == operation_id)
            .cloned()
            .collect())
    }

    async fn insert_participant(
        &self,
        p: &NewOperationParticipant,
    ) -> DomainResult<OperationParticipant> {
        let mut tables = self.tables.write().await;
        if tables.admitted(p.operation_id, &p.consumer_prm) {
            return Err(DomainError::Conflict(format!(
                "meter point {} already admitted to operation {}",
                p.consumer_prm, p.operation_id
            )));
        }
        Ok(tables.admit(p))
    }

    async fn insert_participants(&self, participants: &[NewOperationParticipant]) -> DomainResult<u64> {
        let mut tables = self.tables.write().await;
        let mut written = 0;
        for p in participants {
            if !tables.admitted(p.operation_id, &p.consumer_prm) {
                tables.admit(p);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn latest_waiver(&self, consumer_id: Uuid) -> DomainResult<Option<RetractionWaiver>> {
        let tables = self.tables.read().await;
        // Insertion order breaks ties between identical timestamps.
        Ok(tables
            .waivers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.consumer_id == consumer_id)
            .max_by_key(|(idx, w)| (w.created_at, *idx))
            .map(|(_, w)| w.clone()))
    }

    async fn insert_waiver(&self, w: &NewRetractionWaiver) -> DomainResult<RetractionWaiver> {
        let row = RetractionWaiver {
            id: Uuid::new_v4(),
            user_id: w.user_id,
            consumer_id: w.consumer_id,
            ip_address: w.ip_address.clone(),
            role: w.role.clone(),
            full_name: w.full_name.clone(),
            address: w.address.clone(),
            prm: w.prm.clone(),
            waived: w.waived,
            created_at: Utc::now(),
        };
        self.tables.write().await.waivers.push(row.clone());
        Ok(row)
    }

    async fn insert_terms_acceptance(
        &self,
        a: &NewTermsAcceptance,
    ) -> DomainResult<TermsAcceptance> {
        let ConsentIdentity { user_id, ip_address, role, full_name, address, prm } =
            a.identity.clone();
        let row = TermsAcceptance {
            id: Uuid::new_v4(),
            user_id,
            ip_address,
            role,
            full_name,
            address,
            prm,
            accepted: a.accepted,
            created_at: Utc::now(),
        };
        self.tables.write().await.terms.push(row.clone());
        Ok(row)
    }

    async fn insert_data_sharing_authorization(
        &self,
        a: &NewDataSharingAuthorization,
    ) -> DomainResult<DataSharingAuthorization> {
        let ConsentIdentity { user_id, ip_address, role, full_name, address, prm } =
            a.identity.clone();
        let row = DataSharingAuthorization {
            id: Uuid::new_v4(),
            user_id,
            ip_address,
            role,
            full_name,
            address,
            prm,
            measures: a.scope.measures,
            index_readings: a.scope.index_readings,
            max_power: a.scope.max_power,
            load_curve: a.scope.load_curve,
            technical_data: a.scope.technical_data,
            mandate: a.scope.mandate,
            valid_until: a.valid_until,
            created_at: Utc::now(),
        };
        self.tables.write().await.data_sharing.push(row.clone());
        Ok(row)
    }

    async fn insert_participation_agreement(
        &self,
        a: &NewParticipationAgreement,
    ) -> DomainResult<ParticipationAgreement> {
        let ConsentIdentity { user_id, ip_address, role, full_name, address, prm } =
            a.identity.clone();
        let row = ParticipationAgreement {
            id: Uuid::new_v4(),
            user_id,
            ip_address,
            role,
            full_name,
            address,
            prm,
            load_curve_collection: a.scope.load_curve_collection,
            supplier_transmission: a.scope.supplier_transmission,
            consumer_third_party_transmission: a.scope.consumer_third_party_transmission,
            producer_third_party_transmission: a.scope.producer_third_party_transmission,
            agreed: a.scope.agreed,
            valid_until: a.valid_until,
            created_at: Utc::now(),
        };
        self.tables.write().await.participation.push(row.clone());
        Ok(row)
    }

    async fn commit_consumer_signature(
        &self,
        id: Uuid,
        expected_version: i64,
        commit: &ConsumerSignatureCommit,
    ) -> DomainResult<Contract> {
        let mut tables = self.tables.write().await;
        let (producer_id, rank) = {
            let contract = tables.contract_mut(id, expected_version)?;
            (contract.producer_id, contract.consumer_rank)
        };

        let rank = match rank {
            Some(rank) => rank,
            None => {
                let next = tables.rank_counters.entry(producer_id).or_insert(0);
                let assigned = *next;
                *next += 1;
                assigned
            }
        };

        let contract = tables.contract_mut(id, expected_version)?;
        contract.consumer_signed_at = Some(commit.signed_at);
        contract.status = commit.status.as_str().to_string();
        contract.document_url = Some(commit.document_url.clone());
        contract.consumer_ip = commit.consumer_ip.clone();
        contract.consumer_rank = Some(rank);
        contract.version += 1;
        contract.updated_at = Utc::now();
        Ok(contract.clone())
    }

    async fn commit_producer_signature(
        &self,
        id: Uuid,
        expected_version: i64,
        commit: &ProducerSignatureCommit,
    ) -> DomainResult<Contract> {
        let mut tables = self.tables.write().await;
        let contract = tables.contract_mut(id, expected_version)?;
        contract.producer_signed_at = Some(commit.signed_at);
        contract.status = commit.status.as_str().to_string();
        contract.document_url = Some(commit.document_url.clone());
        contract.version += 1;
        contract.updated_at = Utc::now();
        Ok(contract.clone())
    }

    async fn insert_consumption_records(&self, records: &[ConsumptionRecord]) -> DomainResult<u64> {
        let mut tables = self.tables.write().await;
        tables.consumption.extend(records.iter().cloned());
        Ok(records.len() as u64)
    }

    async fn latest_consumption(
        &self,
        operation_id: Uuid,
        prm: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Option<ConsumptionRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .consumption
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.operation_id == operation_id
                    && r.prm == prm
                    && r.start_date >= start
                    && r.end_date <= end
            })
            .max_by_key(|(idx, r)| (r.created_at, *idx))
            .map(|(_, r)| r.clone()))
    }

    async fn consumption_for_period(
        &self,
        operation_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<ConsumptionRecord>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ConsumptionRecord> = tables
            .consumption
            .iter()
            .filter(|r| r.operation_id == operation_id && r.start_date == start && r.end_date == end)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.prm.cmp(&b.prm));
        Ok(rows)
    }

    async fn excise_schedules_covering(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<ExciseSchedule>> {
        let tables = self.tables.read().await;
        Ok(tables
            .excise
            .iter()
            .filter(|s| s.covers(start, end))
            .cloned()
            .collect())
    }

    async fn peek_invoice_sequence(&self, producer_prm: &str) -> DomainResult<i64> {
        Ok(self.tables.read().await.last_invoice_number(producer_prm) + 1)
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> DomainResult<Invoice> {
        let mut tables = self.tables.write().await;
        let duplicate = tables.invoices.iter().any(|i| {
            i.producer_prm == invoice.producer_prm
                && i.kind == INVOICE_KIND_INVOICE
                && i.number == invoice.number
        });
        if duplicate || tables.last_invoice_number(&invoice.producer_prm) != invoice.sequence - 1 {
            return Err(DomainError::Conflict(format!(
                "invoice {} already exists for {}",
                invoice.number, invoice.producer_prm
            )));
        }

        let row = Invoice {
            id: Uuid::new_v4(),
            contract_id: invoice.contract_id,
            producer_prm: invoice.producer_prm.clone(),
            number: invoice.number.clone(),
            kind: INVOICE_KIND_INVOICE.to_string(),
            document_url: invoice.document_url.clone(),
            storage_path: invoice.storage_path.clone(),
            issued_at: invoice.issued_at,
            due_at: invoice.due_at,
            notified_at: None,
            total_ht: invoice.total_ht,
            total_tva: invoice.total_tva,
            total_ttc: invoice.total_ttc,
            created_at: Utc::now(),
        };
        tables
            .invoice_counters
            .insert(invoice.producer_prm.clone(), invoice.sequence);
        tables.invoices.push(row.clone());
        Ok(row)
    }

    async fn mark_invoice_notified(&self, id: Uuid, at: DateTime<Utc>) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let invoice = tables
            .invoices
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| DomainError::not_found("invoice", id))?;
        invoice.notified_at = Some(at);
        Ok(())
    }

    async fn invoice(&self, id: Uuid) -> DomainResult<Option<Invoice>> {
        let tables = self.tables.read().await;
        Ok(tables.invoices.iter().find(|i| i.id == id).cloned())
    }
}
