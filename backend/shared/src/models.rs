use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::billing::{ExciseRates, SelfConsumption, TariffSchedule};
use crate::error::DomainError;
use crate::status::ContractStatus;

// ═══════════════════════════════════════════════════════════════════════════
// PARTIES
// ═══════════════════════════════════════════════════════════════════════════

/// Legal category of a consumer. Gates the retraction-delay branch of the
/// status resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerKind {
    #[serde(rename = "particulier")]
    Individual,
    #[serde(rename = "pro")]
    Professional,
}

impl ConsumerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerKind::Individual => "particulier",
            ConsumerKind::Professional => "pro",
        }
    }
}

impl FromStr for ConsumerKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "particulier" => Ok(ConsumerKind::Individual),
            "pro" => Ok(ConsumerKind::Professional),
            other => Err(DomainError::InvalidState(format!(
                "unknown consumer type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Energy buyer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Consumer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub prm: Option<String>,
    pub contact_first_name: Option<String>,
    pub contact_last_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub address: Option<String>,
    pub siret: Option<String>,
    pub legal_name: Option<String>,
    pub legal_acronym: Option<String>,
    pub power_category: Option<i16>,
    pub created_at: DateTime<Utc>,
}

impl Consumer {
    pub fn consumer_kind(&self) -> Result<ConsumerKind, DomainError> {
        self.kind.parse()
    }

    /// Business entity when a registration number is on file.
    pub fn is_business(&self) -> bool {
        self.siret.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Name of the meter-point holder as written on regulatory filings.
    pub fn holder_name(&self) -> String {
        match self.consumer_kind() {
            Ok(ConsumerKind::Individual) => format!(
                "{} {}",
                self.contact_first_name.as_deref().unwrap_or_default(),
                self.contact_last_name.as_deref().unwrap_or_default()
            )
            .trim()
            .to_string(),
            _ => self.legal_name.clone().unwrap_or_default(),
        }
    }
}

/// Energy seller; owns installations and at most one operation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Producer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub contact_first_name: Option<String>,
    pub contact_last_name: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub address: Option<String>,
    pub siret: Option<String>,
    pub legal_name: Option<String>,
    pub legal_acronym: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Producer {
    pub fn is_business(&self) -> bool {
        self.siret.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Name shown to consumers: first name for individuals, legal name (or
    /// acronym) for businesses.
    pub fn display_name(&self) -> String {
        if self.is_business() {
            self.legal_name
                .clone()
                .filter(|n| !n.is_empty())
                .or_else(|| self.legal_acronym.clone())
                .unwrap_or_default()
        } else {
            self.contact_first_name.clone().unwrap_or_default()
        }
    }
}

/// Role a signer holds on a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignerRole {
    #[serde(rename = "consommateur")]
    Consumer,
    #[serde(rename = "producteur")]
    Producer,
}

impl SignerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerRole::Consumer => "consommateur",
            SignerRole::Producer => "producteur",
        }
    }
}

/// A contract party, resolved once at lookup time.
#[derive(Debug, Clone)]
pub enum Party {
    Consumer(Consumer),
    Producer(Producer),
}

impl Party {
    pub fn id(&self) -> Uuid {
        match self {
            Party::Consumer(c) => c.id,
            Party::Producer(p) => p.id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            Party::Consumer(c) => c.user_id,
            Party::Producer(p) => p.user_id,
        }
    }

    pub fn role(&self) -> SignerRole {
        match self {
            Party::Consumer(_) => SignerRole::Consumer,
            Party::Producer(_) => SignerRole::Producer,
        }
    }

    pub fn first_name(&self) -> &str {
        match self {
            Party::Consumer(c) => c.contact_first_name.as_deref().unwrap_or_default(),
            Party::Producer(p) => p.contact_first_name.as_deref().unwrap_or_default(),
        }
    }

    pub fn last_name(&self) -> &str {
        match self {
            Party::Consumer(c) => c.contact_last_name.as_deref().unwrap_or_default(),
            Party::Producer(p) => p.contact_last_name.as_deref().unwrap_or_default(),
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            Party::Consumer(c) => c.contact_email.as_deref(),
            Party::Producer(p) => p.contact_email.as_deref(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ASSETS
// ═══════════════════════════════════════════════════════════════════════════

/// Production installation (meter point on the producer side).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Installation {
    pub id: Uuid,
    pub producer_id: Uuid,
    pub prm: String,
    pub power_kva: Option<f64>,
    pub address: Option<String>,
    pub holder: Option<String>,
    pub municipality: Option<String>,
}

/// Collective self-consumption operation (ACC).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Operation {
    pub id: Uuid,
    pub producer_id: Uuid,
    pub agreement_number: Option<String>,
    /// Lifecycle ordinal, 1 (declared) to 8 (resiliated).
    pub status: i16,
    pub annex_url: Option<String>,
    pub annex_mailed_at: Option<DateTime<Utc>>,
    pub grid_agreement_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
}

/// Meter point admitted into an operation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OperationParticipant {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub agreement_number: Option<String>,
    pub entry_requested_at: DateTime<Utc>,
    pub entered_at: Option<DateTime<Utc>>,
    pub producer_id: Uuid,
    pub consumer_prm: String,
    pub installation_prm: String,
    pub consumer_id: Uuid,
    pub consumer_rank: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOperationParticipant {
    pub operation_id: Uuid,
    pub agreement_number: Option<String>,
    pub entry_requested_at: DateTime<Utc>,
    pub entered_at: Option<DateTime<Utc>>,
    pub producer_id: Uuid,
    pub consumer_prm: String,
    pub installation_prm: String,
    pub consumer_id: Uuid,
    pub consumer_rank: Option<i32>,
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTRACTS
// ═══════════════════════════════════════════════════════════════════════════

/// One consumer↔producer energy-sale agreement (CPV).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Contract {
    pub id: Uuid,
    pub consumer_id: Uuid,
    pub producer_id: Uuid,
    pub installation_id: Uuid,
    pub operation_id: Option<Uuid>,
    pub consumer_prm: Option<String>,
    pub installation_prm: Option<String>,
    pub number: Option<String>,
    pub status: String,
    pub consumer_signed_at: Option<DateTime<Utc>>,
    pub producer_signed_at: Option<DateTime<Utc>>,
    pub tariff_base: Option<f64>,
    pub tariff_peak: Option<f64>,
    pub tariff_hph: Option<f64>,
    pub tariff_hch: Option<f64>,
    pub tariff_hpb: Option<f64>,
    pub tariff_hcb: Option<f64>,
    pub consumer_rank: Option<i32>,
    pub document_url: Option<String>,
    pub consumer_ip: Option<String>,
    /// Bumped on every write; signature commits are conditional on it.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    pub fn tariff_schedule(&self) -> TariffSchedule {
        TariffSchedule {
            base: self.tariff_base,
            peak: self.tariff_peak,
            hph: self.tariff_hph,
            hch: self.tariff_hch,
            hpb: self.tariff_hpb,
            hcb: self.tariff_hcb,
        }
    }

    /// Persisted status, parsed. Unrecognised values surface as InvalidState.
    pub fn current_status(&self) -> Result<ContractStatus, DomainError> {
        self.status.parse()
    }
}

/// Fields written by the consumer-signature commit.
#[derive(Debug, Clone)]
pub struct ConsumerSignatureCommit {
    pub signed_at: DateTime<Utc>,
    pub status: ContractStatus,
    pub document_url: String,
    pub consumer_ip: Option<String>,
}

/// Fields written by the producer-signature commit.
#[derive(Debug, Clone)]
pub struct ProducerSignatureCommit {
    pub signed_at: DateTime<Utc>,
    pub status: ContractStatus,
    pub document_url: String,
}

/// Per-consumer record of the statutory cooling-off waiver.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RetractionWaiver {
    pub id: Uuid,
    pub user_id: Uuid,
    pub consumer_id: Uuid,
    pub ip_address: Option<String>,
    pub role: String,
    pub full_name: String,
    pub address: Option<String>,
    pub prm: Option<String>,
    pub waived: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRetractionWaiver {
    pub user_id: Uuid,
    pub consumer_id: Uuid,
    pub ip_address: Option<String>,
    pub role: String,
    pub full_name: String,
    pub address: Option<String>,
    pub prm: Option<String>,
    pub waived: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// CONSENT RECORDS
// ═══════════════════════════════════════════════════════════════════════════

/// Who gave a consent, as known when it was given.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsentIdentity {
    pub user_id: Uuid,
    pub ip_address: Option<String>,
    pub role: String,
    pub full_name: String,
    pub address: Option<String>,
    pub prm: Option<String>,
}

/// Acceptance of the platform's terms of use.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TermsAcceptance {
    pub id: Uuid,
    pub user_id: Uuid,
    pub ip_address: Option<String>,
    pub role: String,
    pub full_name: String,
    pub address: Option<String>,
    pub prm: Option<String>,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTermsAcceptance {
    pub identity: ConsentIdentity,
    pub accepted: bool,
}

/// Metering data a party lets the organiser read from the grid operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataSharingScope {
    pub measures: bool,
    pub index_readings: bool,
    pub max_power: bool,
    pub load_curve: bool,
    pub technical_data: bool,
    pub mandate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DataSharingAuthorization {
    pub id: Uuid,
    pub user_id: Uuid,
    pub ip_address: Option<String>,
    pub role: String,
    pub full_name: String,
    pub address: Option<String>,
    pub prm: Option<String>,
    pub measures: bool,
    pub index_readings: bool,
    pub max_power: bool,
    pub load_curve: bool,
    pub technical_data: bool,
    pub mandate: bool,
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDataSharingAuthorization {
    pub identity: ConsentIdentity,
    pub scope: DataSharingScope,
    pub valid_until: DateTime<Utc>,
}

/// What a party accepts by joining a collective self-consumption operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParticipationScope {
    pub load_curve_collection: bool,
    pub supplier_transmission: bool,
    pub consumer_third_party_transmission: bool,
    pub producer_third_party_transmission: bool,
    pub agreed: bool,
}

/// Participation consent. Agreements given for a named meter point carry no
/// end date; standing authorizations expire.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ParticipationAgreement {
    pub id: Uuid,
    pub user_id: Uuid,
    pub ip_address: Option<String>,
    pub role: String,
    pub full_name: String,
    pub address: Option<String>,
    pub prm: Option<String>,
    pub load_curve_collection: bool,
    pub supplier_transmission: bool,
    pub consumer_third_party_transmission: bool,
    pub producer_third_party_transmission: bool,
    pub agreed: bool,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewParticipationAgreement {
    pub identity: ConsentIdentity,
    pub scope: ParticipationScope,
    pub valid_until: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════
// METERING & BILLING
// ═══════════════════════════════════════════════════════════════════════════

/// Definitive active energy of one meter point over one period. Each band is
/// split into self-consumed, complementary and total volumes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct ConsumptionRecord {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub prm: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub unit: Option<String>,
    pub peak_self: Option<f64>,
    pub hph_self: Option<f64>,
    pub hch_self: Option<f64>,
    pub hpb_self: Option<f64>,
    pub hcb_self: Option<f64>,
    pub peak_complement: Option<f64>,
    pub hph_complement: Option<f64>,
    pub hch_complement: Option<f64>,
    pub hpb_complement: Option<f64>,
    pub hcb_complement: Option<f64>,
    pub peak_total: Option<f64>,
    pub hph_total: Option<f64>,
    pub hch_total: Option<f64>,
    pub hpb_total: Option<f64>,
    pub hcb_total: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl ConsumptionRecord {
    pub fn self_consumption(&self) -> SelfConsumption {
        SelfConsumption {
            peak: self.peak_self,
            hph: self.hph_self,
            hch: self.hch_self,
            hpb: self.hpb_self,
            hcb: self.hcb_self,
        }
    }
}

/// Excise-tax rates valid over `[period_start, period_end]`, stored ×100.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExciseSchedule {
    pub id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub rate_below_36kva: Option<f64>,
    pub rate_36_to_250kva: Option<f64>,
    pub rate_above_250kva: Option<f64>,
    pub rate_reduced: Option<f64>,
}

impl ExciseSchedule {
    pub fn rates(&self) -> ExciseRates {
        ExciseRates {
            below_36kva: self.rate_below_36kva,
            from_36_to_250kva: self.rate_36_to_250kva,
            above_250kva: self.rate_above_250kva,
            reduced: self.rate_reduced,
        }
    }

    pub fn covers(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.period_start <= start && self.period_end >= end
    }
}

/// Invoice ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub producer_prm: String,
    pub number: String,
    pub kind: String,
    pub document_url: String,
    pub storage_path: String,
    pub issued_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub notified_at: Option<DateTime<Utc>>,
    pub total_ht: f64,
    pub total_tva: f64,
    pub total_ttc: f64,
    pub created_at: DateTime<Utc>,
}

pub const INVOICE_KIND_INVOICE: &str = "facture";

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub contract_id: Uuid,
    pub producer_prm: String,
    /// Position in the producer's sequence; claimed when the row is written.
    pub sequence: i64,
    pub number: String,
    pub document_url: String,
    pub storage_path: String,
    pub issued_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub total_ht: f64,
    pub total_tva: f64,
    pub total_ttc: f64,
}
