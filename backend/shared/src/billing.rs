//! Invoice line computation.
//!
//! Tariff and excise rates are stored in minor currency units (×100). Every
//! line is rounded to cents on its own and the rounded text is parsed back
//! before summing, so totals match the published documents to the cent.

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// VAT applied on the HT total.
pub const VAT_RATE: f64 = 0.20;

/// Width of the zero-padded per-producer invoice number.
pub const INVOICE_NUMBER_WIDTH: usize = 6;

/// Days between invoice issue and payment due date.
pub const PAYMENT_TERM_DAYS: i64 = 15;

/// Per-band unit prices of a contract, in minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TariffSchedule {
    pub base: Option<f64>,
    pub peak: Option<f64>,
    pub hph: Option<f64>,
    pub hch: Option<f64>,
    pub hpb: Option<f64>,
    pub hcb: Option<f64>,
}

impl TariffSchedule {
    pub fn rate(&self, band: EnergyBand) -> Option<f64> {
        match band {
            EnergyBand::Base => self.base,
            EnergyBand::Peak => self.peak,
            EnergyBand::Hph => self.hph,
            EnergyBand::Hch => self.hch,
            EnergyBand::Hpb => self.hpb,
            EnergyBand::Hcb => self.hcb,
        }
    }
}

/// Excise-tax rates by connected-power tier, in minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExciseRates {
    pub below_36kva: Option<f64>,
    pub from_36_to_250kva: Option<f64>,
    pub above_250kva: Option<f64>,
    pub reduced: Option<f64>,
}

impl ExciseRates {
    pub fn rate(&self, tier: ExciseTier) -> Option<f64> {
        match tier {
            ExciseTier::Below36kVA => self.below_36kva,
            ExciseTier::From36To250kVA => self.from_36_to_250kva,
            ExciseTier::Above250kVA => self.above_250kva,
            ExciseTier::Reduced => self.reduced,
        }
    }
}

/// Self-consumed volumes of the five metered bands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SelfConsumption {
    pub peak: Option<f64>,
    pub hph: Option<f64>,
    pub hch: Option<f64>,
    pub hpb: Option<f64>,
    pub hcb: Option<f64>,
}

impl SelfConsumption {
    /// Base volume is never stored; it is the sum of the five bands.
    pub fn base(&self) -> f64 {
        self.peak.unwrap_or(0.0)
            + self.hph.unwrap_or(0.0)
            + self.hch.unwrap_or(0.0)
            + self.hpb.unwrap_or(0.0)
            + self.hcb.unwrap_or(0.0)
    }

    pub fn volume(&self, band: EnergyBand) -> f64 {
        match band {
            EnergyBand::Base => self.base(),
            EnergyBand::Peak => self.peak.unwrap_or(0.0),
            EnergyBand::Hph => self.hph.unwrap_or(0.0),
            EnergyBand::Hch => self.hch.unwrap_or(0.0),
            EnergyBand::Hpb => self.hpb.unwrap_or(0.0),
            EnergyBand::Hcb => self.hcb.unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyBand {
    Base,
    Peak,
    Hph,
    Hch,
    Hpb,
    Hcb,
}

impl EnergyBand {
    /// Line order on the invoice.
    pub const ALL: [EnergyBand; 6] = [
        EnergyBand::Base,
        EnergyBand::Peak,
        EnergyBand::Hph,
        EnergyBand::Hch,
        EnergyBand::Hpb,
        EnergyBand::Hcb,
    ];

    /// Key fragment used by the invoice template.
    pub fn template_key(&self) -> &'static str {
        match self {
            EnergyBand::Base => "base",
            EnergyBand::Peak => "pointe",
            EnergyBand::Hph => "HPH",
            EnergyBand::Hch => "HCH",
            EnergyBand::Hpb => "HPB",
            EnergyBand::Hcb => "HCB",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExciseTier {
    Below36kVA,
    From36To250kVA,
    Above250kVA,
    Reduced,
}

impl ExciseTier {
    pub const ALL: [ExciseTier; 4] = [
        ExciseTier::Below36kVA,
        ExciseTier::From36To250kVA,
        ExciseTier::Above250kVA,
        ExciseTier::Reduced,
    ];

    pub fn template_key(&self) -> &'static str {
        match self {
            ExciseTier::Below36kVA => "taux_inf_36kVA",
            ExciseTier::From36To250kVA => "taux_36kVA_250kVA",
            ExciseTier::Above250kVA => "taux_sup_250kVA",
            ExciseTier::Reduced => "taux_reduit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandLine {
    pub band: EnergyBand,
    pub volume: f64,
    /// Stored rate, minor units.
    pub rate: Option<f64>,
    pub amount_ht: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExciseLine {
    pub tier: ExciseTier,
    pub volume: f64,
    pub rate: Option<f64>,
    pub amount_ht: f64,
}

/// Line-itemized invoice amounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceComputation {
    pub band_lines: Vec<BandLine>,
    pub excise_lines: Vec<ExciseLine>,
    pub self_consumed_total: f64,
    pub total_ht: f64,
    pub total_tva: f64,
    pub total_ttc: f64,
}

impl InvoiceComputation {
    pub fn band(&self, band: EnergyBand) -> Option<&BandLine> {
        self.band_lines.iter().find(|l| l.band == band)
    }

    pub fn excise(&self, tier: ExciseTier) -> Option<&ExciseLine> {
        self.excise_lines.iter().find(|l| l.tier == tier)
    }
}

/// Compute the six energy lines, the four excise lines and the totals.
pub fn compute_invoice_lines(
    consumption: &SelfConsumption,
    tariff: &TariffSchedule,
    excise: &ExciseRates,
) -> InvoiceComputation {
    let band_lines: Vec<BandLine> = EnergyBand::ALL
        .iter()
        .map(|&band| {
            let volume = consumption.volume(band);
            let rate = tariff.rate(band);
            BandLine {
                band,
                volume,
                rate,
                amount_ht: round2(volume * rate.unwrap_or(0.0) / 100.0),
            }
        })
        .collect();

    let self_consumed_total = consumption.base();
    let excise_lines: Vec<ExciseLine> = ExciseTier::ALL
        .iter()
        .map(|&tier| {
            let rate = excise.rate(tier);
            ExciseLine {
                tier,
                volume: self_consumed_total,
                rate,
                amount_ht: round2(self_consumed_total * rate.unwrap_or(0.0) / 100.0),
            }
        })
        .collect();

    let line_sum = band_lines
        .iter()
        .map(|l| l.amount_ht)
        .chain(excise_lines.iter().map(|l| l.amount_ht))
        .fold(0.0, |acc, amount| acc + amount);
    let total_tva = round2(line_sum * VAT_RATE);
    let total_ttc = round2(line_sum + total_tva);
    let total_ht = round2(line_sum);

    InvoiceComputation {
        band_lines,
        excise_lines,
        self_consumed_total,
        total_ht,
        total_tva,
        total_ttc,
    }
}

/// Fixed-point text with `places` decimals, halves away from zero.
/// Non-finite input renders as zero.
pub fn to_fixed(value: f64, places: u32) -> String {
    let rounded = Decimal::from_f64_retain(value)
        .map(|d| d.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero))
        .unwrap_or(Decimal::ZERO);
    format!("{:.*}", places as usize, rounded)
}

pub fn fixed2(value: f64) -> String {
    to_fixed(value, 2)
}

pub fn fixed4(value: f64) -> String {
    to_fixed(value, 4)
}

/// Round to cents through the fixed-point text representation.
pub fn round2(value: f64) -> f64 {
    fixed2(value).parse().unwrap_or(0.0)
}

/// Unit price shown on documents: actual currency per kWh, 4 decimals.
pub fn display_rate(stored: Option<f64>) -> String {
    fixed4(stored.unwrap_or(0.0) / 100.0)
}

pub fn format_invoice_number(sequence: i64) -> String {
    format!("{:0width$}", sequence, width = INVOICE_NUMBER_WIDTH)
}

pub fn invoice_file_stem(producer_prm: &str, number: &str) -> String {
    format!("FA-{}_{}", producer_prm, number)
}

/// Billed month: the calendar month preceding the run date.
pub fn billing_month(run_date: NaiveDate) -> (i32, u32) {
    let previous = run_date
        .with_day(1)
        .and_then(|first| first.checked_sub_months(Months::new(1)))
        .unwrap_or(run_date);
    (previous.year(), previous.month())
}

/// Storage key of an invoice document: `{operation}/{yyyy}/{mm}/{file}`.
pub fn invoice_storage_path(operation_id: Uuid, run_at: DateTime<Utc>, file_name: &str) -> String {
    let (year, month) = billing_month(run_at.date_naive());
    format!("{}/{}/{:02}/{}", operation_id, year, month, file_name)
}
