//! Document naming and template data maps.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use shared::{
    display_rate, fixed2, ConsumptionRecord, Consumer, Contract, EnergyBand,
    Installation, InvoiceComputation, Producer, PAYMENT_TERM_DAYS,
};

use crate::documents::TemplateData;

pub const CONSUMER_SIGNED_SUFFIX: &str = "_cons.pdf";
pub const FULLY_SIGNED_SUFFIX: &str = "_prod.pdf";

fn or_placeholder(value: Option<&str>, placeholder: &str) -> Value {
    match value.filter(|v| !v.is_empty()) {
        Some(v) => json!(v),
        None => json!(placeholder),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn file_name_part(is_business: bool, legal: Option<&str>, last: Option<&str>, fallback: &str) -> String {
    let legal = legal.filter(|n| !n.is_empty());
    let last = last.filter(|n| !n.is_empty());
    let name = match (is_business, legal) {
        (true, Some(legal)) => legal,
        _ => last.unwrap_or(fallback),
    };
    sanitize(name)
}

/// `CPV_{producer}_{consumer}`, shared by every artefact of one contract.
pub fn contract_file_stem(consumer: &Consumer, producer: &Producer) -> String {
    let producer_name = file_name_part(
        producer.is_business(),
        producer.legal_name.as_deref(),
        producer.contact_last_name.as_deref(),
        "ProducteurInconnu",
    );
    let consumer_name = file_name_part(
        consumer.is_business(),
        consumer.legal_name.as_deref(),
        consumer.contact_last_name.as_deref(),
        "ConsommateurInconnu",
    );
    format!("CPV_{}_{}", producer_name, consumer_name)
}

/// `finalises/{stem}_prod.pdf` from the consumer-signed object path.
pub fn fully_signed_path(consumer_signed_path: &str) -> String {
    let file = consumer_signed_path
        .rsplit('/')
        .next()
        .unwrap_or(consumer_signed_path);
    let stem = file.strip_suffix(CONSUMER_SIGNED_SUFFIX).unwrap_or(file);
    format!("finalises/{}{}", stem, FULLY_SIGNED_SUFFIX)
}

/// Intermediate artefacts superseded by the fully signed document.
pub fn stale_contract_paths(consumer_signed_path: &str) -> Vec<String> {
    let prefix = consumer_signed_path
        .strip_suffix(CONSUMER_SIGNED_SUFFIX)
        .unwrap_or(consumer_signed_path);
    vec![
        format!("finalises/{}.docx", prefix),
        format!("finalises/{}{}", prefix, CONSUMER_SIGNED_SUFFIX),
    ]
}

pub fn french_date(at: DateTime<Utc>) -> String {
    at.format("%d/%m/%Y").to_string()
}

fn party_flags(data: &mut TemplateData, consumer: &Consumer, producer: &Producer) {
    data.insert("consommateur_particulier".into(), json!(!consumer.is_business()));
    data.insert("consommateur_entreprise".into(), json!(consumer.is_business()));
    data.insert("producteur_particulier".into(), json!(!producer.is_business()));
    data.insert("producteur_entreprise".into(), json!(producer.is_business()));
}

fn party_fields(data: &mut TemplateData, consumer: &Consumer, producer: &Producer) {
    let fields = [
        ("consommateur_contact_prenom", consumer.contact_first_name.as_deref(), "[PRENOM_ABSENT]"),
        ("consommateur_contact_nom", consumer.contact_last_name.as_deref(), "[NOM_ABSENT]"),
        ("consommateur_contact_email", consumer.contact_email.as_deref(), "[EMAIL_ABSENT]"),
        ("consommateur_contact_telephone", consumer.contact_phone.as_deref(), "[TEL_ABSENT]"),
        ("consommateur_adresse", consumer.address.as_deref(), "[ADRESSE_ABSENTE]"),
        ("consommateur_siret", consumer.siret.as_deref(), "[SIRET_ABSENT]"),
        ("consommateur_denominationUniteLegale", consumer.legal_name.as_deref(), "[DENOMINATION_ABSENTE]"),
        ("consommateur_sigleUniteLegale", consumer.legal_acronym.as_deref(), "[SIGLE_ABSENT]"),
        ("producteur_contact_prenom", producer.contact_first_name.as_deref(), "[PRENOM_ABSENT]"),
        ("producteur_contact_nom", producer.contact_last_name.as_deref(), "[NOM_ABSENT]"),
        ("producteur_contact_email", producer.contact_email.as_deref(), "[EMAIL_ABSENT]"),
        ("producteur_contact_telephone", producer.contact_phone.as_deref(), "[TEL_ABSENT]"),
        ("producteur_adresse", producer.address.as_deref(), "[ADRESSE_ABSENTE]"),
        ("producteur_siret", producer.siret.as_deref(), "[SIRET_ABSENT]"),
        ("producteur_denominationUniteLegale", producer.legal_name.as_deref(), "[DENOMINATION_ABSENTE]"),
        ("producteur_sigleUniteLegale", producer.legal_acronym.as_deref(), "[SIGLE_ABSENT]"),
    ];
    for (key, value, placeholder) in fields {
        data.insert(key.into(), or_placeholder(value, placeholder));
    }
}

/// Substitution map of the sale contract.
pub fn contract_document_data(
    contract: &Contract,
    consumer: &Consumer,
    producer: &Producer,
    installation: &Installation,
    today: DateTime<Utc>,
) -> TemplateData {
    let mut data = TemplateData::new();
    party_flags(&mut data, consumer, producer);
    party_fields(&mut data, consumer, producer);

    data.insert("consommateur_prm".into(), or_placeholder(consumer.prm.as_deref(), "[PRM_ABSENT]"));
    data.insert("installation_prm".into(), or_placeholder(Some(&installation.prm), "[PRM_ABSENT]"));
    data.insert(
        "installation_puissance".into(),
        match installation.power_kva {
            Some(power) => json!(power.to_string()),
            None => json!("[PUISSANCE_ABSENTE]"),
        },
    );
    data.insert(
        "installation_tarif_base".into(),
        match contract.tariff_base {
            Some(rate) => json!(display_rate(Some(rate))),
            None => json!("[TARIF_ABSENT]"),
        },
    );
    data.insert(
        "installation_adresse".into(),
        or_placeholder(installation.address.as_deref(), "[ADRESSE_INSTALLATION_ABSENTE]"),
    );
    data.insert(
        "installation_titulaire".into(),
        or_placeholder(installation.holder.as_deref(), "[TITULAIRE_ABSENT]"),
    );
    data.insert("date".into(), json!(french_date(today)));
    data.insert("contrat_id".into(), json!(contract.id.to_string()));
    data
}

/// Everything an invoice document is rendered from.
pub struct InvoiceDocument<'a> {
    pub number: &'a str,
    pub issued_at: DateTime<Utc>,
    pub contract: &'a Contract,
    pub consumer: &'a Consumer,
    pub producer: &'a Producer,
    pub installation: &'a Installation,
    pub consumption: &'a ConsumptionRecord,
    pub computation: &'a InvoiceComputation,
}

pub fn payment_due(issued_at: DateTime<Utc>) -> DateTime<Utc> {
    issued_at + Duration::days(PAYMENT_TERM_DAYS)
}

/// Substitution map of an invoice.
pub fn invoice_document_data(doc: &InvoiceDocument<'_>) -> TemplateData {
    let mut data = TemplateData::new();
    party_flags(&mut data, doc.consumer, doc.producer);
    party_fields(&mut data, doc.consumer, doc.producer);

    let tariff = doc.contract.tariff_schedule();
    for band in EnergyBand::ALL {
        let key = band.template_key();
        data.insert(format!("contrat_{}", key), json!(tariff.rate(band).is_some()));
        data.insert(format!("tarif_{}", key), json!(display_rate(tariff.rate(band))));
        if let Some(line) = doc.computation.band(band) {
            data.insert(format!("{}_autocons", key), json!(line.volume));
            data.insert(format!("{}_total_ht", key.to_lowercase()), json!(fixed2(line.amount_ht)));
        }
    }
    for category in 1..=4 {
        data.insert(
            format!("categorie_puissance_branchement_{}", category),
            json!(doc.consumer.power_category == Some(category)),
        );
    }
    for line in &doc.computation.excise_lines {
        let key = line.tier.template_key();
        data.insert(key.into(), json!(line.rate));
        data.insert(format!("accise_totale_{}", key), json!(fixed2(line.amount_ht)));
    }

    data.insert("consommateur_prm".into(), json!(doc.consumption.prm));
    data.insert(
        "installation_titulaire".into(),
        or_placeholder(doc.installation.holder.as_deref(), "[TITULAIRE_ABSENT]"),
    );
    data.insert("facture_numero".into(), json!(doc.number));
    data.insert("date_facture".into(), json!(french_date(doc.issued_at)));
    data.insert("date_reglement_du".into(), json!(french_date(payment_due(doc.issued_at))));
    data.insert(
        "contrat_numero".into(),
        or_placeholder(doc.contract.number.as_deref(), "[NUMERO_CONTRAT_ABSENT]"),
    );
    data.insert("start_date".into(), json!(french_date(doc.consumption.start_date)));
    data.insert("end_date".into(), json!(french_date(doc.consumption.end_date)));
    data.insert("autocons_totale".into(), json!(doc.computation.self_consumed_total));
    data.insert("total_ht".into(), json!(fixed2(doc.computation.total_ht)));
    data.insert("total_tva".into(), json!(fixed2(doc.computation.total_tva)));
    data.insert("total_ttc".into(), json!(fixed2(doc.computation.total_ttc)));
    data
}

/// Substitution map of the operation's regulatory spreadsheet.
pub fn annex_data(consumer: &Consumer) -> TemplateData {
    let mut data = TemplateData::new();
    data.insert("consommateurs.prm".into(), json!(consumer.prm.clone().unwrap_or_default()));
    data.insert("consommateurs.titulaire".into(), json!(consumer.holder_name()));
    data.insert(
        "consommateurs.adresse".into(),
        json!(consumer.address.clone().unwrap_or_default()),
    );
    data.insert(
        "consommateurs.siret".into(),
        json!(consumer.siret.clone().unwrap_or_default()),
    );
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn consumer() -> Consumer {
        Consumer {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            kind: "particulier".into(),
            prm: Some("11111111111111".into()),
            contact_first_name: Some("Marie".into()),
            contact_last_name: Some("Le Goff".into()),
            contact_email: None,
            contact_phone: None,
            address: Some("1 rue de Brest".into()),
            siret: None,
            legal_name: None,
            legal_acronym: None,
            power_category: Some(1),
            created_at: Utc::now(),
        }
    }

    fn producer() -> Producer {
        Producer {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            contact_first_name: Some("Paul".into()),
            contact_last_name: Some("Durand".into()),
            contact_email: Some("paul@example.fr".into()),
            contact_phone: None,
            address: None,
            siret: Some("12345678900012".into()),
            legal_name: Some("Soleil & Co".into()),
            legal_acronym: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn file_stem_prefers_legal_name_for_businesses() {
        assert_eq!(contract_file_stem(&consumer(), &producer()), "CPV_Soleil___Co_Le_Goff");

        let mut anonymous = consumer();
        anonymous.contact_last_name = None;
        let mut individual_producer = producer();
        individual_producer.siret = None;
        assert_eq!(
            contract_file_stem(&anonymous, &individual_producer),
            "CPV_Durand_ConsommateurInconnu"
        );
    }

    #[test]
    fn signed_document_paths() {
        assert_eq!(
            fully_signed_path("consommateurs/CPV_A_B_cons.pdf"),
            "finalises/CPV_A_B_prod.pdf"
        );
        assert_eq!(
            stale_contract_paths("consommateurs/CPV_A_B_cons.pdf"),
            vec![
                "finalises/consommateurs/CPV_A_B.docx".to_string(),
                "finalises/consommateurs/CPV_A_B_cons.pdf".to_string()
            ]
        );
    }

    #[test]
    fn missing_fields_render_placeholders() {
        let mut data = TemplateData::new();
        party_fields(&mut data, &consumer(), &producer());
        assert_eq!(data["consommateur_contact_email"], "[EMAIL_ABSENT]");
        assert_eq!(data["consommateur_siret"], "[SIRET_ABSENT]");
        assert_eq!(data["producteur_denominationUniteLegale"], "Soleil & Co");
    }

    #[test]
    fn annex_holder_depends_on_consumer_kind() {
        assert_eq!(annex_data(&consumer())["consommateurs.titulaire"], "Marie Le Goff");
        let mut pro = consumer();
        pro.kind = "pro".into();
        pro.legal_name = Some("Boulangerie Martin".into());
        assert_eq!(annex_data(&pro)["consommateurs.titulaire"], "Boulangerie Martin");
    }
}
