//! Contract status resolution.
//!
//! The status of a contract is derived, never authoritative: it is a pure
//! function of the consumer's legal category, the retraction waiver, both
//! signature timestamps and the phase of the linked operation. Callers
//! recompute it whenever one of those inputs changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DomainError, DomainResult};
use crate::models::ConsumerKind;

/// Statutory cooling-off period for individual consumers, in calendar days.
pub const RETRACTION_DELAY_DAYS: i64 = 14;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Canonical contract status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractStatus {
    /// Consumer has not signed yet.
    #[serde(rename = "panier")]
    Panier,
    #[serde(rename = "attente_prod")]
    AttenteProd,
    #[serde(rename = "attente_prod_délai_légal")]
    AttenteProdDelaiLegal,
    #[serde(rename = "abandon_délai_légal_expiré")]
    AbandonDelaiLegalExpire,
    #[serde(rename = "attente_mes")]
    AttenteMes,
    #[serde(rename = "attente_mes_délai_légal")]
    AttenteMesDelaiLegal,
    #[serde(rename = "en_cours")]
    EnCours,
    #[serde(rename = "attente_délai_légal")]
    AttenteDelaiLegal,
    #[serde(rename = "résilié")]
    Resilie,
    /// Unreachable for well-formed inputs.
    #[serde(rename = "inconnu")]
    Inconnu,
}

impl ContractStatus {
    pub const ALL: [ContractStatus; 10] = [
        ContractStatus::Panier,
        ContractStatus::AttenteProd,
        ContractStatus::AttenteProdDelaiLegal,
        ContractStatus::AbandonDelaiLegalExpire,
        ContractStatus::AttenteMes,
        ContractStatus::AttenteMesDelaiLegal,
        ContractStatus::EnCours,
        ContractStatus::AttenteDelaiLegal,
        ContractStatus::Resilie,
        ContractStatus::Inconnu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Panier => "panier",
            ContractStatus::AttenteProd => "attente_prod",
            ContractStatus::AttenteProdDelaiLegal => "attente_prod_délai_légal",
            ContractStatus::AbandonDelaiLegalExpire => "abandon_délai_légal_expiré",
            ContractStatus::AttenteMes => "attente_mes",
            ContractStatus::AttenteMesDelaiLegal => "attente_mes_délai_légal",
            ContractStatus::EnCours => "en_cours",
            ContractStatus::AttenteDelaiLegal => "attente_délai_légal",
            ContractStatus::Resilie => "résilié",
            ContractStatus::Inconnu => "inconnu",
        }
    }

    /// Statuses in which the producer has not signed yet.
    pub fn awaits_producer(&self) -> bool {
        matches!(
            self,
            ContractStatus::Panier
                | ContractStatus::AttenteProd
                | ContractStatus::AttenteProdDelaiLegal
        )
    }

    /// Statuses in which the consumer's cooling-off period is still running.
    /// Contracts whose meter points enter the operation on its start date.
    pub fn enters_at_start(&self) -> bool {
        matches!(
            self,
            ContractStatus::AttenteDelaiLegal | ContractStatus::AttenteMes | ContractStatus::EnCours
        )
    }

    pub fn within_legal_delay(&self) -> bool {
        matches!(
            self,
            ContractStatus::AttenteProdDelaiLegal
                | ContractStatus::AttenteMesDelaiLegal
                | ContractStatus::AttenteDelaiLegal
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContractStatus::AbandonDelaiLegalExpire | ContractStatus::Resilie
        )
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContractStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| DomainError::InvalidState(format!("unknown contract status: {}", s)))
    }
}

/// Phase of the operation a contract belongs to, derived from its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    /// No operation yet, or declared but not commissioned (`< 6`).
    PreCommissioning,
    /// Commissioned and exchanging energy (`6` or `7`).
    InService,
    /// Operation ended (`8`).
    Resiliated,
}

impl OperationPhase {
    /// `None` for ordinals beyond the known lifecycle.
    pub fn from_status(status: Option<i16>) -> Option<Self> {
        match status {
            None => Some(OperationPhase::PreCommissioning),
            Some(s) if s < 6 => Some(OperationPhase::PreCommissioning),
            Some(6) | Some(7) => Some(OperationPhase::InService),
            Some(8) => Some(OperationPhase::Resiliated),
            Some(_) => None,
        }
    }
}

/// Everything the resolver looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusInputs {
    pub consumer_kind: ConsumerKind,
    /// `None` when the consumer never answered; treated as not waived.
    pub retraction_waived: Option<bool>,
    pub consumer_signed_at: Option<DateTime<Utc>>,
    pub producer_signed_at: Option<DateTime<Utc>>,
    pub operation_status: Option<i16>,
}

/// Where the consumer stands with respect to the cooling-off period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegalDelay {
    Waived,
    /// Consumer has not signed, so the period has not started.
    NotStarted,
    Running,
    Elapsed,
}

impl LegalDelay {
    pub fn evaluate(inputs: &StatusInputs, now: DateTime<Utc>) -> Self {
        if inputs.retraction_waived == Some(true) {
            return LegalDelay::Waived;
        }
        match inputs.consumer_signed_at {
            None => LegalDelay::NotStarted,
            Some(signed_at) if elapsed_days(signed_at, now) >= RETRACTION_DELAY_DAYS => {
                LegalDelay::Elapsed
            }
            Some(_) => LegalDelay::Running,
        }
    }
}

/// Whole calendar days since `since`, truncated toward negative infinity.
pub fn elapsed_days(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_milliseconds().div_euclid(MILLIS_PER_DAY)
}

/// Apply the transition table. Returns `Inconnu` when no rule matches.
pub fn transition(inputs: &StatusInputs, now: DateTime<Utc>) -> ContractStatus {
    use ContractStatus::*;

    let delay = LegalDelay::evaluate(inputs, now);
    let phase = OperationPhase::from_status(inputs.operation_status);
    let producer_signed = inputs.producer_signed_at.is_some();

    match (inputs.consumer_kind, producer_signed) {
        (ConsumerKind::Individual, false) => match delay {
            LegalDelay::Waived => AttenteProd,
            LegalDelay::NotStarted => Panier,
            LegalDelay::Elapsed => AbandonDelaiLegalExpire,
            LegalDelay::Running => AttenteProdDelaiLegal,
        },
        (ConsumerKind::Professional, false) => AttenteProd,
        (ConsumerKind::Individual, true) => match (delay, phase) {
            (LegalDelay::Waived | LegalDelay::Elapsed, Some(p)) => settled_status(p),
            (LegalDelay::Running, Some(OperationPhase::PreCommissioning)) => AttenteMesDelaiLegal,
            (LegalDelay::Running, Some(OperationPhase::InService)) => AttenteDelaiLegal,
            (LegalDelay::Running, Some(OperationPhase::Resiliated)) => Resilie,
            _ => Inconnu,
        },
        (ConsumerKind::Professional, true) => phase.map(settled_status).unwrap_or(Inconnu),
    }
}

fn settled_status(phase: OperationPhase) -> ContractStatus {
    match phase {
        OperationPhase::PreCommissioning => ContractStatus::AttenteMes,
        OperationPhase::InService => ContractStatus::EnCours,
        OperationPhase::Resiliated => ContractStatus::Resilie,
    }
}

/// Resolve the canonical status. Falling through every rule is an internal
/// consistency failure and is reported as `InvalidState`.
pub fn resolve_status(inputs: &StatusInputs, now: DateTime<Utc>) -> DomainResult<ContractStatus> {
    match transition(inputs, now) {
        ContractStatus::Inconnu => Err(DomainError::InvalidState(format!(
            "no status rule matches {:?}",
            inputs
        ))),
        status => Ok(status),
    }
}
