use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    Consumer, ConsumerSignatureCommit, ConsumptionRecord, Contract, DataSharingAuthorization,
    DomainError, DomainResult, ExciseSchedule, Installation, Invoice, NewDataSharingAuthorization,
    NewInvoice, NewOperationParticipant, NewParticipationAgreement, NewRetractionWaiver,
    NewTermsAcceptance, Operation, OperationParticipant, ParticipationAgreement, Producer,
    ProducerSignatureCommit, RetractionWaiver, TermsAcceptance, INVOICE_KIND_INVOICE,
};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use super::Store;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    /// Lock the contract row at `expected_version`, or explain why it cannot be.
    async fn lock_contract(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        expected_version: i64,
    ) -> DomainResult<Contract> {
        let row = sqlx::query_as::<_, Contract>(
            "SELECT * FROM contracts WHERE id = $1 AND version = $2 FOR UPDATE",
        )
        .bind(id)
        .bind(expected_version)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(contract) = row {
            return Ok(contract);
        }

        let exists = sqlx::query("SELECT 1 FROM contracts WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?
            .is_some();
        if exists {
            Err(DomainError::Conflict(format!(
                "contract {} changed since version {}",
                id, expected_version
            )))
        } else {
            Err(DomainError::not_found("contract", id))
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> DomainResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn contract(&self, id: Uuid) -> DomainResult<Option<Contract>> {
        Ok(sqlx::query_as("SELECT * FROM contracts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn consumer(&self, id: Uuid) -> DomainResult<Option<Consumer>> {
        Ok(sqlx::query_as("SELECT * FROM consumers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn consumer_by_user(&self, user_id: Uuid) -> DomainResult<Option<Consumer>> {
        Ok(sqlx::query_as("SELECT * FROM consumers WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn consumer_by_prm(&self, prm: &str) -> DomainResult<Option<Consumer>> {
        Ok(
            sqlx::query_as("SELECT * FROM consumers WHERE prm = $1 ORDER BY created_at DESC LIMIT 1")
                .bind(prm)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn producer(&self, id: Uuid) -> DomainResult<Option<Producer>> {
        Ok(sqlx::query_as("SELECT * FROM producers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn producer_by_user(&self, user_id: Uuid) -> DomainResult<Option<Producer>> {
        Ok(sqlx::query_as("SELECT * FROM producers WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn installation(&self, id: Uuid) -> DomainResult<Option<Installation>> {
        Ok(sqlx::query_as("SELECT * FROM installations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn installation_by_prm(&self, prm: &str) -> DomainResult<Option<Installation>> {
        Ok(sqlx::query_as("SELECT * FROM installations WHERE prm = $1 LIMIT 1")
            .bind(prm)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn installations_of_producer(&self, producer_id: Uuid) -> DomainResult<Vec<Installation>> {
        Ok(
            sqlx::query_as("SELECT * FROM installations WHERE producer_id = $1 ORDER BY prm")
                .bind(producer_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn contracts_of_producer(&self, producer_id: Uuid) -> DomainResult<Vec<Contract>> {
        Ok(
            sqlx::query_as("SELECT * FROM contracts WHERE producer_id = $1 ORDER BY created_at")
                .bind(producer_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn contract_for_consumer_prm(
        &self,
        producer_id: Uuid,
        consumer_prm: &str,
    ) -> DomainResult<Option<Contract>> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM contracts
            WHERE producer_id = $1 AND consumer_prm = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(producer_id)
        .bind(consumer_prm)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn operation(&self, id: Uuid) -> DomainResult<Option<Operation>> {
        Ok(sqlx::query_as("SELECT * FROM operations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn operation_for_producer(&self, producer_id: Uuid) -> DomainResult<Option<Operation>> {
        Ok(sqlx::query_as("SELECT * FROM operations WHERE producer_id = $1")
            .bind(producer_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_operation_annex(&self, id: Uuid, annex_url: &str) -> DomainResult<()> {
        let result = sqlx::query("UPDATE operations SET annex_url = $2 WHERE id = $1")
            .bind(id)
            .bind(annex_url)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("operation", id));
        }
        Ok(())
    }

    async fn mark_operation_declared(&self, id: Uuid, mailed_at: DateTime<Utc>) -> DomainResult<()> {
        let result =
            sqlx::query("UPDATE operations SET status = 1, annex_mailed_at = $2 WHERE id = $1")
                .bind(id)
                .bind(mailed_at)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("operation", id));
        }
        Ok(())
    }

    async fn grid_contact_email(&self, grid_agreement_id: &str) -> DomainResult<Option<String>> {
        let row = sqlx::query("SELECT email FROM grid_contacts WHERE grid_agreement_id = $1")
            .bind(grid_agreement_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("email")))
    }

    async fn participants(&self, operation_id: Uuid) -> DomainResult<Vec<OperationParticipant>> {
        Ok(sqlx::query_as(
            "SELECT * FROM operation_participants WHERE operation_id = $1 ORDER BY entry_requested_at",
        )
        .bind(operation_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert_participant(
        &self,
        p: &NewOperationParticipant,
    ) -> DomainResult<OperationParticipant> {
        sqlx::query_as(
            r#"
            INSERT INTO operation_participants (
                operation_id, agreement_number, entry_requested_at, entered_at, producer_id,
                consumer_prm, installation_prm, consumer_id, consumer_rank
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(p.operation_id)
        .bind(&p.agreement_number)
        .bind(p.entry_requested_at)
        .bind(p.entered_at)
        .bind(p.producer_id)
        .bind(&p.consumer_prm)
        .bind(&p.installation_prm)
        .bind(p.consumer_id)
        .bind(p.consumer_rank)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => DomainError::Conflict(format!(
                "meter point {} already admitted to operation {}",
                p.consumer_prm, p.operation_id
            )),
            _ => DomainError::from(err),
        })
    }

    async fn insert_participants(&self, participants: &[NewOperationParticipant]) -> DomainResult<u64> {
        if participants.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"INSERT INTO operation_participants (
                operation_id, agreement_number, entry_requested_at, entered_at, producer_id,
                consumer_prm, installation_prm, consumer_id, consumer_rank
            ) "#,
        );
        builder.push_values(participants, |mut row, p| {
            row.push_bind(p.operation_id)
                .push_bind(&p.agreement_number)
                .push_bind(p.entry_requested_at)
                .push_bind(p.entered_at)
                .push_bind(p.producer_id)
                .push_bind(&p.consumer_prm)
                .push_bind(&p.installation_prm)
                .push_bind(p.consumer_id)
                .push_bind(p.consumer_rank);
        });
        builder.push(" ON CONFLICT (operation_id, consumer_prm) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        debug!(rows = result.rows_affected(), "operation participants inserted");
        Ok(result.rows_affected())
    }

    async fn latest_waiver(&self, consumer_id: Uuid) -> DomainResult<Option<RetractionWaiver>> {
        Ok(sqlx::query_as(
            "SELECT * FROM retraction_waivers WHERE consumer_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn insert_waiver(&self, w: &NewRetractionWaiver) -> DomainResult<RetractionWaiver> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO retraction_waivers (
                user_id, consumer_id, ip_address, role, full_name, address, prm, waived
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(w.user_id)
        .bind(w.consumer_id)
        .bind(&w.ip_address)
        .bind(&w.role)
        .bind(&w.full_name)
        .bind(&w.address)
        .bind(&w.prm)
        .bind(w.waived)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn insert_terms_acceptance(
        &self,
        a: &NewTermsAcceptance,
    ) -> DomainResult<TermsAcceptance> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO terms_acceptances (
                user_id, ip_address, role, full_name, address, prm, accepted
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(a.identity.user_id)
        .bind(&a.identity.ip_address)
        .bind(&a.identity.role)
        .bind(&a.identity.full_name)
        .bind(&a.identity.address)
        .bind(&a.identity.prm)
        .bind(a.accepted)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn insert_data_sharing_authorization(
        &self,
        a: &NewDataSharingAuthorization,
    ) -> DomainResult<DataSharingAuthorization> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO data_sharing_authorizations (
                user_id, ip_address, role, full_name, address, prm,
                measures, index_readings, max_power, load_curve, technical_data, mandate,
                valid_until
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(a.identity.user_id)
        .bind(&a.identity.ip_address)
        .bind(&a.identity.role)
        .bind(&a.identity.full_name)
        .bind(&a.identity.address)
        .bind(&a.identity.prm)
        .bind(a.scope.measures)
        .bind(a.scope.index_readings)
        .bind(a.scope.max_power)
        .bind(a.scope.load_curve)
        .bind(a.scope.technical_data)
        .bind(a.scope.mandate)
        .bind(a.valid_until)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn insert_participation_agreement(
        &self,
        a: &NewParticipationAgreement,
    ) -> DomainResult<ParticipationAgreement> {
        Ok(sqlx::query_as(
            r#"
            INSERT INTO participation_agreements (
                user_id, ip_address, role, full_name, address, prm,
                load_curve_collection, supplier_transmission,
                consumer_third_party_transmission, producer_third_party_transmission,
                agreed, valid_until
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(a.identity.user_id)
        .bind(&a.identity.ip_address)
        .bind(&a.identity.role)
        .bind(&a.identity.full_name)
        .bind(&a.identity.address)
        .bind(&a.identity.prm)
        .bind(a.scope.load_curve_collection)
        .bind(a.scope.supplier_transmission)
        .bind(a.scope.consumer_third_party_transmission)
        .bind(a.scope.producer_third_party_transmission)
        .bind(a.scope.agreed)
        .bind(a.valid_until)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn commit_consumer_signature(
        &self,
        id: Uuid,
        expected_version: i64,
        commit: &ConsumerSignatureCommit,
    ) -> DomainResult<Contract> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_contract(&mut tx, id, expected_version).await?;

        let rank = match current.consumer_rank {
            Some(rank) => rank,
            None => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO producer_rank_counters (producer_id, next_rank)
                    VALUES ($1, 1)
                    ON CONFLICT (producer_id)
                    DO UPDATE SET next_rank = producer_rank_counters.next_rank + 1
                    RETURNING next_rank - 1 AS rank
                    "#,
                )
                .bind(current.producer_id)
                .fetch_one(&mut *tx)
                .await?;
                row.get::<i32, _>("rank")
            }
        };

        let updated = sqlx::query_as::<_, Contract>(
            r#"
            UPDATE contracts
            SET consumer_signed_at = $2,
                status = $3,
                document_url = $4,
                consumer_ip = $5,
                consumer_rank = $6,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(commit.signed_at)
        .bind(commit.status.as_str())
        .bind(&commit.document_url)
        .bind(&commit.consumer_ip)
        .bind(rank)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(contract_id = %id, rank, status = %commit.status, "consumer signature committed");
        Ok(updated)
    }

    async fn commit_producer_signature(
        &self,
        id: Uuid,
        expected_version: i64,
        commit: &ProducerSignatureCommit,
    ) -> DomainResult<Contract> {
        let mut tx = self.pool.begin().await?;
        Self::lock_contract(&mut tx, id, expected_version).await?;

        let updated = sqlx::query_as::<_, Contract>(
            r#"
            UPDATE contracts
            SET producer_signed_at = $2,
                status = $3,
                document_url = $4,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(commit.signed_at)
        .bind(commit.status.as_str())
        .bind(&commit.document_url)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(contract_id = %id, status = %commit.status, "producer signature committed");
        Ok(updated)
    }

    async fn insert_consumption_records(&self, records: &[ConsumptionRecord]) -> DomainResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"INSERT INTO consumption_records (
                operation_id, prm, start_date, end_date, unit,
                peak_self, hph_self, hch_self, hpb_self, hcb_self,
                peak_complement, hph_complement, hch_complement, hpb_complement, hcb_complement,
                peak_total, hph_total, hch_total, hpb_total, hcb_total
            ) "#,
        );
        builder.push_values(records, |mut row, r| {
            row.push_bind(r.operation_id)
                .push_bind(&r.prm)
                .push_bind(r.start_date)
                .push_bind(r.end_date)
                .push_bind(&r.unit)
                .push_bind(r.peak_self)
                .push_bind(r.hph_self)
                .push_bind(r.hch_self)
                .push_bind(r.hpb_self)
                .push_bind(r.hcb_self)
                .push_bind(r.peak_complement)
                .push_bind(r.hph_complement)
                .push_bind(r.hch_complement)
                .push_bind(r.hpb_complement)
                .push_bind(r.hcb_complement)
                .push_bind(r.peak_total)
                .push_bind(r.hph_total)
                .push_bind(r.hch_total)
                .push_bind(r.hpb_total)
                .push_bind(r.hcb_total);
        });

        let result = builder.build().execute(&self.pool).await?;
        debug!(rows = result.rows_affected(), "consumption records inserted");
        Ok(result.rows_affected())
    }

    async fn latest_consumption(
        &self,
        operation_id: Uuid,
        prm: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Option<ConsumptionRecord>> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM consumption_records
            WHERE operation_id = $1 AND prm = $2 AND start_date >= $3 AND end_date <= $4
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(operation_id)
        .bind(prm)
        .bind(start)
        .bind(end)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn consumption_for_period(
        &self,
        operation_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<ConsumptionRecord>> {
        Ok(sqlx::query_as(
            r#"
            SELECT * FROM consumption_records
            WHERE operation_id = $1 AND start_date = $2 AND end_date = $3
            ORDER BY prm
            "#,
        )
        .bind(operation_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn excise_schedules_covering(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DomainResult<Vec<ExciseSchedule>> {
        Ok(sqlx::query_as(
            "SELECT * FROM excise_schedules WHERE period_start <= $1 AND period_end >= $2",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn peek_invoice_sequence(&self, producer_prm: &str) -> DomainResult<i64> {
        // Without a counter row yet, continue after invoices issued before it existed.
        let row = sqlx::query(
            r#"
            SELECT COALESCE(
                (SELECT last_number FROM invoice_counters WHERE producer_prm = $1),
                (SELECT MAX(number::BIGINT) FROM invoices
                 WHERE producer_prm = $1 AND kind = $2 AND number ~ '^[0-9]+$'),
                0
            ) + 1 AS next_number
            "#,
        )
        .bind(producer_prm)
        .bind(INVOICE_KIND_INVOICE)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("next_number"))
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> DomainResult<Invoice> {
        let taken = || {
            DomainError::Conflict(format!(
                "invoice {} already exists for {}",
                invoice.number, invoice.producer_prm
            ))
        };
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO invoice_counters (producer_prm, last_number)
            VALUES ($1, $2)
            ON CONFLICT (producer_prm)
            DO UPDATE SET last_number = EXCLUDED.last_number
            WHERE invoice_counters.last_number = EXCLUDED.last_number - 1
            RETURNING last_number
            "#,
        )
        .bind(&invoice.producer_prm)
        .bind(invoice.sequence)
        .fetch_optional(&mut *tx)
        .await?;
        if claimed.is_none() {
            return Err(taken());
        }

        let row = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (
                contract_id, producer_prm, number, kind, document_url, storage_path,
                issued_at, due_at, total_ht, total_tva, total_ttc
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(invoice.contract_id)
        .bind(&invoice.producer_prm)
        .bind(&invoice.number)
        .bind(INVOICE_KIND_INVOICE)
        .bind(&invoice.document_url)
        .bind(&invoice.storage_path)
        .bind(invoice.issued_at)
        .bind(invoice.due_at)
        .bind(invoice.total_ht)
        .bind(invoice.total_tva)
        .bind(invoice.total_ttc)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => taken(),
            _ => DomainError::from(err),
        })?;

        tx.commit().await?;
        info!(invoice_id = %row.id, number = %row.number, "invoice number claimed");
        Ok(row)
    }

    async fn mark_invoice_notified(&self, id: Uuid, at: DateTime<Utc>) -> DomainResult<()> {
        let result = sqlx::query("UPDATE invoices SET notified_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DomainError::not_found("invoice", id));
        }
        Ok(())
    }

    async fn invoice(&self, id: Uuid) -> DomainResult<Option<Invoice>> {
        Ok(sqlx::query_as("SELECT * FROM invoices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }
}
