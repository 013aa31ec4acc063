//! Relational store seam.
//!
//! Orchestrators only see [`Store`]; production wires [`PgStore`], tests wire
//! [`MemoryStore`]. Every lookup returns `Ok(None)` for a missing row so the
//! caller decides which entity name goes into the `NotFound` it raises.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    Consumer, ConsumerSignatureCommit, ConsumptionRecord, Contract, DataSharingAuthorization,
    DomainResult, ExciseSchedule, Installation, Invoice, NewDataSharingAuthorization, NewInvoice,
    NewOperationParticipant, NewParticipationAgreement, NewRetractionWaiver, NewTermsAcceptance,
    Operation, OperationParticipant, ParticipationAgreement, Producer, ProducerSignatureCommit,
    RetractionWaiver, TermsAcceptance,
};
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap round trip used by the health check.
    async fn ping(&self) -> DomainResult<()>;

    // ── parties and assets ──────────────────────────────────────────────────
    async fn contract(&self, id: Uuid) -> DomainResult<Option<Contract>>;
    async fn consumer(&self, id: Uuid) -> DomainResult<Option<Consumer>>;
    async fn consumer_by_user(&self, user_id: Uuid) -> DomainResult<Option<Consumer>>;
    async fn consumer_by_prm(&self, prm: &str) -> DomainResult<Option<Consumer>>;
    async fn producer(&self, id: Uuid) -> DomainResult<Option<Producer>>;
    async fn producer_by_user(&self, user_id: Uuid) -> DomainResult<Option<Producer>>;
    async fn installation(&self, id: Uuid) -> DomainResult<Option<Installation>>;
    async fn installation_by_prm(&self, prm: &str) -> DomainResult<Option<Installation>>;
    /// Installations of a producer, ordered by meter point.
    async fn installations_of_producer(&self, producer_id: Uuid) -> DomainResult<Vec<Installation>>;
    async fn contracts_of_producer(&self, producer_id: Uuid) -> DomainResult<Vec<Contract>>;

    /// Most recent contract of `producer_id` for the given consumer meter point.
    async fn contract_for_consumer_prm(
        &self,
        producer_id: Uuid,
        consumer_prm: &str,
    ) -> DomainResult<Option<Contract>>;

    // ── operations ──────────────────────────────────────────────────────────
    async fn operation(&self, id: Uuid) -> DomainResult<Option<Operation>>;
    async fn operation_for_producer(&self, producer_id: Uuid) -> DomainResult<Option<Operation>>;
    async fn update_operation_annex(&self, id: Uuid, annex_url: &str) -> DomainResult<()>;
    /// Sets the operation to declared (ordinal 1) and stamps the mail-out time.
    async fn mark_operation_declared(&self, id: Uuid, mailed_at: DateTime<Utc>) -> DomainResult<()>;
    async fn grid_contact_email(&self, grid_agreement_id: &str) -> DomainResult<Option<String>>;
    async fn participants(&self, operation_id: Uuid) -> DomainResult<Vec<OperationParticipant>>;
    /// Fails with `Conflict` when the meter point is already admitted.
    async fn insert_participant(
        &self,
        participant: &NewOperationParticipant,
    ) -> DomainResult<OperationParticipant>;
    /// Bulk admission; meter points already admitted are left untouched.
    /// Returns how many rows were written.
    async fn insert_participants(&self, participants: &[NewOperationParticipant]) -> DomainResult<u64>;

    // ── retraction waivers ──────────────────────────────────────────────────
    async fn latest_waiver(&self, consumer_id: Uuid) -> DomainResult<Option<RetractionWaiver>>;
    async fn insert_waiver(&self, waiver: &NewRetractionWaiver) -> DomainResult<RetractionWaiver>;

    // ── consent records ─────────────────────────────────────────────────────
    async fn insert_terms_acceptance(
        &self,
        acceptance: &NewTermsAcceptance,
    ) -> DomainResult<TermsAcceptance>;
    async fn insert_data_sharing_authorization(
        &self,
        authorization: &NewDataSharingAuthorization,
    ) -> DomainResult<DataSharingAuthorization>;
    async fn insert_participation_agreement(
        &self,
        agreement: &NewParticipationAgreement,
    ) -> DomainResult<ParticipationAgreement>;

    // ── signature commits ───────────────────────────────────────────────────
    /// Persist the consumer signature if the row is still at `expected_version`.
    /// Assigns the consumer rank from the producer's sequence when the contract
    /// has none yet, in the same unit of work.
    async fn commit_consumer_signature(
        &self,
        id: Uuid,
        expected_version: i64,
        commit: &ConsumerSignatureCommit,
    ) -> DomainResult<Contract>;

    async fn commit_producer_signature(
        &self,
        id: Uuid,
        expected_version: i64,
        commit: &ProducerSignatureCommit,
    ) -> DomainResult<Contract>;

    // ── metering ────────────────────────────────────────────────────────────
    async fn insert_consumption_records(&self, records: &[ConsumptionRecord]) -> DomainResult<u64>;

    /// Newest record for a meter point contained in `[start, end]`.
    async fn latest_consumption(
        &self,
        operation_id: Uuid,
        prm: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Option<ConsumptionRecord>>;

    /// Every record of the operation for exactly that period.
    async fn consumption_for_period(
        &self,
        operation_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<ConsumptionRecord>>;

    async fn excise_schedules_covering(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<ExciseSchedule>>;

    // ── invoices ────────────────────────────────────────────────────────────
    /// Next free invoice sequence number of a producer. Reading it reserves
    /// nothing: the number only counts as used once `insert_invoice` succeeds.
    async fn peek_invoice_sequence(&self, producer_prm: &str) -> DomainResult<i64>;
    /// Claim `invoice.sequence` and write the row in one unit of work.
    /// Fails with `Conflict` when another invoice took that number first.
    async fn insert_invoice(&self, invoice: &NewInvoice) -> DomainResult<Invoice>;
    async fn mark_invoice_notified(&self, id: Uuid, at: DateTime<Utc>) -> DomainResult<()>;
    async fn invoice(&self, id: Uuid) -> DomainResult<Option<Invoice>>;
}
