// tests/api_tests.rs
//
// HTTP surface exercised through the full router with in-process
// collaborators: routing, request parsing, status codes and response bodies.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use common::{at, consumer, energy_series, seed, seed_with, Harness};
use kinjo_api::services::commissioning::confirm_start_date;
use kinjo_api::services::invoicing::{generate_invoice, InvoiceRequest};
use kinjo_api::services::{INVOICE_BUCKET, INVOICE_TEMPLATE};
use kinjo_api::storage::ObjectStore;
use kinjo_api::store::Store;
use serde_json::{json, Value};
use shared::{ConsumptionRecord, ExciseSchedule, NewOperationParticipant};
use tower::ServiceExt;
use uuid::Uuid;

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value, Option<String>) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let location = response
        .headers()
        .get(header::LOCATION)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, body, location)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// ─── Service endpoints ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_reports_ok() {
    let h = Harness::new().await;
    let (status, body, _) = send(h.router(), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["uptime_secs"].is_u64());
}

#[tokio::test]
async fn test_metrics_are_exposed_in_text_format() {
    let h = Harness::new().await;
    let app = h.router();
    send(app.clone(), get("/health")).await;

    let (status, body, _) = send(app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("test_http_requests_total"));
    assert!(text.contains("# TYPE"));
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let h = Harness::new().await;
    let (status, body, _) = send(h.router(), get("/nowhere")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_malformed_body_is_400() {
    let h = Harness::new().await;
    let (status, body, _) = send(h.router(), post("/generate", json!({"contrat_id": "x"}))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

// ─── Signatures ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_consumer_signature_endpoint() {
    let h = Harness::new().await;
    let parties = seed(&h, "pro", 3).await;

    let (status, body, _) = send(
        h.router(),
        post(
            "/generate",
            json!({
                "contrat_id": parties.contract.id,
                "consommateur_id": parties.consumer.id,
                "producteur_id": parties.producer.id,
                "installation_id": parties.installation.id,
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["success"], true);
    assert_eq!(body["statut"], "attente_prod");
    assert_eq!(body["consommateur_rang"], 0);
    assert!(body["url"].as_str().unwrap().ends_with("_cons.pdf"));
}

#[tokio::test]
async fn test_producer_signature_without_token_is_401() {
    let h = Harness::new().await;
    let parties = seed(&h, "pro", 6).await;

    let (status, body, _) = send(
        h.router(),
        post("/signature-producteur", json!({ "contrat_id": parties.contract.id })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_producer_signature_status_codes() {
    let h = Harness::new().await;
    let parties = seed(&h, "pro", 6).await;
    h.auth.grant("producer", parties.producer.user_id);
    h.auth.grant("stranger", Uuid::new_v4());

    let request = |token: &str, contract_id: Uuid| {
        Request::builder()
            .method("POST")
            .uri("/signature-producteur")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::from(json!({ "contrat_id": contract_id }).to_string()))
            .unwrap()
    };

    let (status, _, _) = send(h.router(), request("producer", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(h.router(), request("stranger", parties.contract.id)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_status_preview_does_not_persist() {
    let h = Harness::new().await;
    let parties = seed(&h, "pro", 3).await;

    let uri = format!(
        "/contrats/{}/statut?date_signature_producteur=20250301T120000Z",
        parties.contract.id
    );
    let (status, body, _) = send(h.router(), get(&uri)).await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["statut"], "attente_mes");
    assert_eq!(body["statut_enregistre"], "panier");
    let stored = h.store.contract(parties.contract.id).await.unwrap().unwrap();
    assert_eq!(stored.status, "panier");
    assert!(stored.producer_signed_at.is_none());
}

// ─── Retraction waiver ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_individual_consumer_records_waiver() {
    let h = Harness::new().await;
    let parties = seed(&h, "particulier", 3).await;

    let request = Request::builder()
        .method("POST")
        .uri("/autorisations/renoncement-droit-retractation")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "198.51.100.4, 10.0.0.1")
        .body(Body::from(
            json!({
                "user_id": parties.consumer.user_id,
                "role": "consommateur",
                "renoncement_retractation": true,
            })
            .to_string(),
        ))
        .unwrap();
    let (status, body, _) = send(h.router(), request).await;

    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["renoncement"]["waived"], true);
    assert_eq!(body["renoncement"]["ip_address"], "198.51.100.4");
    assert_eq!(body["renoncement"]["full_name"], "Claire Martin");
    assert_eq!(body["renoncement"]["prm"], "PRM-C1");

    let latest = h.store.latest_waiver(parties.consumer.id).await.unwrap();
    assert_eq!(latest.map(|w| w.waived), Some(true));
}

#[tokio::test]
async fn test_waiver_rejections() {
    let h = Harness::new().await;
    let business = seed(&h, "pro", 3).await;
    let uri = "/autorisations/renoncement-droit-retractation";

    let (status, _, _) = send(
        h.router(),
        post(
            uri,
            json!({"user_id": business.consumer.user_id, "role": "consommateur", "renoncement_retractation": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        h.router(),
        post(
            uri,
            json!({"user_id": business.consumer.user_id, "role": "producteur", "renoncement_retractation": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        h.router(),
        post(
            uri,
            json!({"user_id": Uuid::new_v4(), "role": "consommateur", "renoncement_retractation": false}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // a producer account claiming the consumer role
    let (status, _, _) = send(
        h.router(),
        post(
            uri,
            json!({"user_id": business.producer.user_id, "role": "consommateur", "renoncement_retractation": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ─── Consent records ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_producer_accepts_terms_for_first_installation() {
    let h = Harness::new().await;
    let parties = seed(&h, "pro", 3).await;

    let (status, body, _) = send(
        h.router(),
        post(
            "/autorisations/acceptation-cgu",
            json!({"user_id": parties.producer.user_id, "role": "producteur", "validation_cgu": true}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["success"], true);
    assert_eq!(body["cgu"]["accepted"], true);
    assert_eq!(body["cgu"]["prm"], "PRM-P1");
    assert_eq!(body["cgu"]["full_name"], "Paul Durand");
    assert_eq!(h.store.terms_acceptances().await.len(), 1);
}

#[tokio::test]
async fn test_data_sharing_is_authorized_for_two_years() {
    let h = Harness::new().await;
    let parties = seed(&h, "particulier", 3).await;
    let body = json!({
        "user_id": parties.consumer.user_id,
        "role": "consommateur",
        "donnees_mesures": true,
        "donnees_cdc": true,
    });

    for uri in ["/autorisations/autorisation-communication", "/dac/autorisation-communication"] {
        let (status, response, _) = send(h.router(), post(uri, body.clone())).await;
        assert_eq!(status, StatusCode::CREATED, "{}: {}", uri, response);
        assert_eq!(response["autorisation"]["prm"], "PRM-C1");
        assert_eq!(response["autorisation"]["measures"], true);
        assert_eq!(response["autorisation"]["index_readings"], false);
    }

    let stored = h.store.data_sharing_authorizations().await;
    assert_eq!(stored.len(), 2);
    let days = (stored[0].valid_until - stored[0].created_at).num_days();
    assert!((729..=731).contains(&days), "valid for {} days", days);
}

#[tokio::test]
async fn test_participation_agreement_and_standing_authorization() {
    let h = Harness::new().await;
    let parties = seed(&h, "particulier", 3).await;
    let fields = json!({
        "user_id": parties.consumer.user_id,
        "role": "consommateur",
        "collecte_cdc": true,
        "accord_participation": true,
    });

    let mut with_prm = fields.clone();
    with_prm["prm"] = json!("PRM-C1");
    let (status, body, _) =
        send(h.router(), post("/autorisations/accord-participation-acc", with_prm)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["accord"]["agreed"], true);
    assert_eq!(body["accord"]["load_curve_collection"], true);
    assert!(body["accord"]["valid_until"].is_null());

    let (status, body, _) =
        send(h.router(), post("/autorisations/autorisation-participation-acc", fields.clone())).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert!(body["autorisation"]["valid_until"].is_string());

    // another consumer's meter point
    let mut foreign = fields;
    foreign["prm"] = json!("PRM-C9");
    let (status, _, _) =
        send(h.router(), post("/autorisations/accord-participation-acc", foreign)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert_eq!(h.store.participation_agreements().await.len(), 2);
}

#[tokio::test]
async fn test_consent_rejections() {
    let h = Harness::new().await;
    let parties = seed(&h, "particulier", 3).await;
    let uri = "/autorisations/acceptation-cgu";

    let (status, _, _) = send(
        h.router(),
        post(uri, json!({"user_id": parties.consumer.user_id, "role": "consommateur"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        h.router(),
        post(uri, json!({"user_id": parties.consumer.user_id, "role": "admin", "validation_cgu": true})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        h.router(),
        post(uri, json!({"user_id": parties.consumer.user_id, "role": "producteur", "validation_cgu": true})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        h.router(),
        post(
            "/autorisations/accord-participation-acc",
            json!({"user_id": parties.consumer.user_id, "role": "consommateur", "accord_participation": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(h.store.terms_acceptances().await.is_empty());
    assert!(h.store.participation_agreements().await.is_empty());
}

// ─── Start date ───────────────────────────────────────────────────────────────

/// Operation starting 2025-04-01 with the seeded basket contract plus one
/// contract per `(prm, status, email)`, each signed by its consumer.
async fn commissioned(h: &Harness, contracts: &[(&str, &str, Option<&str>)]) -> common::Parties {
    let parties = seed_with(h, consumer("pro", "PRM-C1"), 5, |op| {
        op.start_date = Some(at(2025, 4, 1))
    })
    .await;
    for (rank, (prm, status, email)) in contracts.iter().enumerate() {
        let mut member = consumer("particulier", prm);
        member.contact_email = email.map(str::to_string);
        let mut signed = common::contract(&member, &parties.installation, &parties.operation);
        signed.status = status.to_string();
        signed.consumer_signed_at = Some(at(2025, 2, 1));
        signed.consumer_rank = Some(rank as i32);
        h.store.add_consumer(member).await;
        h.store.add_contract(signed).await;
    }
    parties
}

#[tokio::test]
async fn test_start_date_admits_committed_meter_points() {
    let h = Harness::new().await;
    let parties = commissioned(
        &h,
        &[
            ("PRM-C2", "en_cours", Some("c2@conso.test")),
            ("PRM-C3", "attente_mes", None),
            ("PRM-C4", "résilié", Some("c4@conso.test")),
        ],
    )
    .await;

    let (status, body, _) = send(
        h.router(),
        post(
            "/operations/date-demarrage-notification",
            json!({"operation_id": parties.operation.id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["inserted_count"], 2);

    let admitted = h.store.participants(parties.operation.id).await.unwrap();
    let mut prms: Vec<&str> = admitted.iter().map(|p| p.consumer_prm.as_str()).collect();
    prms.sort();
    assert_eq!(prms, ["PRM-C2", "PRM-C3"]);
    assert!(admitted.iter().all(|p| p.entered_at == Some(at(2025, 4, 1))));
    assert!(admitted.iter().all(|p| p.entry_requested_at == at(2025, 2, 1)));
    assert!(admitted.iter().all(|p| p.installation_prm == "PRM-P1"));

    // a second confirmation admits nobody twice
    let (status, body, _) = send(
        h.router(),
        post(
            "/operations/date-demarrage-notification",
            json!({"operation_id": parties.operation.id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["inserted_count"], 0);
    assert_eq!(h.store.participants(parties.operation.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_start_date_notices_reach_producer_and_consumers_with_email() {
    let h = Harness::new().await;
    let parties = commissioned(
        &h,
        &[
            ("PRM-C2", "en_cours", Some("c2@conso.test")),
            ("PRM-C3", "attente_délai_légal", None),
        ],
    )
    .await;

    let (outcome, tasks) = confirm_start_date(&h.services, parties.operation.id).await.unwrap();
    assert_eq!(outcome.inserted_count, 2);
    assert_eq!(
        tasks.names(),
        ["start_date_producer_email", "start_date_consumer_email"]
    );

    let report = h.runner().run(tasks).await;
    assert!(report.failed.is_empty(), "{:?}", report.failed);
    let to_producer = h.mailer.sent_to("paul@prod.test");
    assert_eq!(to_producer.len(), 1);
    assert_eq!(
        to_producer[0].subject,
        "Confirmation date de mise en service - ACC ACC-0042"
    );
    assert!(to_producer[0].html.contains("01/04/2025"));
    assert_eq!(h.mailer.sent_to("c2@conso.test").len(), 1);
    assert_eq!(h.mailer.sent().len(), 2);
}

#[tokio::test]
async fn test_start_date_requires_a_date_and_an_operation() {
    let h = Harness::new().await;
    let parties = seed(&h, "pro", 5).await;

    let (status, _, _) = send(
        h.router(),
        post(
            "/operations/date-demarrage-notification",
            json!({"operation_id": parties.operation.id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, _, _) = send(
        h.router(),
        post(
            "/operations/date-demarrage-notification",
            json!({"operation_id": Uuid::new_v4()}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(h.router(), post("/operations/date-demarrage-notification", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(h.mailer.sent().is_empty());
}

// ─── Metering ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fetch_consumption_stores_one_record_per_meter_point() {
    let h = Harness::new().await;
    let parties = seed(&h, "pro", 6).await;
    let (start, end) = (at(2025, 4, 1), at(2025, 4, 30));
    for prm in ["PRM-C1", "PRM-C2"] {
        h.store
            .insert_participant(&NewOperationParticipant {
                operation_id: parties.operation.id,
                agreement_number: Some("ACC-0042".to_string()),
                entry_requested_at: at(2025, 2, 1),
                entered_at: None,
                producer_id: parties.producer.id,
                consumer_prm: prm.to_string(),
                installation_prm: "PRM-P1".to_string(),
                consumer_id: parties.consumer.id,
                consumer_rank: None,
            })
            .await
            .unwrap();
        h.metering.add_series(energy_series(prm, start, end, 10.0, 4.0));
    }

    let (status, body, _) = send(
        h.router(),
        post(
            "/enedis/fetch",
            json!({
                "operationId": parties.operation.id,
                "start": "20250401T000000Z",
                "end": "20250430T000000Z",
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["inserted"], 2);
    assert_eq!(body["prms"], json!(["PRM-C1", "PRM-C2"]));

    let records = h.store.consumption_records().await;
    assert_eq!(records.len(), 2);
    let first = records.iter().find(|r| r.prm == "PRM-C1").unwrap();
    assert_eq!(first.hph_self, Some(10.0));
    assert_eq!(first.hph_complement, Some(4.0));
    assert_eq!(first.hph_total, Some(14.0));
}

#[tokio::test]
async fn test_fetch_consumption_without_meter_points_is_404() {
    let h = Harness::new().await;
    let parties = seed(&h, "pro", 6).await;

    let (status, _, _) = send(
        h.router(),
        post(
            "/enedis/fetch",
            json!({
                "operationId": parties.operation.id,
                "start": "20250401T000000Z",
                "end": "20250430T000000Z",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.store.consumption_records().await.is_empty());
}

// ─── Invoicing ────────────────────────────────────────────────────────────────

fn excise_year(year: i32) -> ExciseSchedule {
    ExciseSchedule {
        id: Uuid::new_v4(),
        period_start: at(year, 1, 1),
        period_end: at(year, 12, 31),
        rate_below_36kva: Some(2.1),
        rate_36_to_250kva: Some(2.1),
        rate_above_250kva: Some(2.1),
        rate_reduced: Some(0.1),
    }
}

async fn billable(h: &Harness) -> common::Parties {
    billable_with(h, vec![excise_year(2025)]).await
}

async fn billable_with(h: &Harness, excise: Vec<ExciseSchedule>) -> common::Parties {
    let parties = seed_with(h, consumer("pro", "PRM-C1"), 6, |_| {}).await;
    let (start, end) = (at(2025, 4, 1), at(2025, 4, 30));
    h.store
        .insert_consumption_records(&[
            ConsumptionRecord {
                id: Uuid::new_v4(),
                operation_id: parties.operation.id,
                prm: "PRM-C1".to_string(),
                start_date: start,
                end_date: end,
                peak_self: Some(10.0),
                hph_self: Some(10.0),
                hch_self: Some(10.0),
                hpb_self: Some(10.0),
                hcb_self: Some(10.0),
                created_at: Utc::now(),
                ..Default::default()
            },
            ConsumptionRecord {
                id: Uuid::new_v4(),
                operation_id: parties.operation.id,
                prm: "PRM-ORPHAN".to_string(),
                start_date: start,
                end_date: end,
                hph_self: Some(3.0),
                created_at: Utc::now(),
                ..Default::default()
            },
        ])
        .await
        .unwrap();
    for schedule in excise {
        h.store.add_excise_schedule(schedule).await;
    }
    h.storage.put(INVOICE_BUCKET, INVOICE_TEMPLATE, b"invoice template");
    parties
}

fn invoice_body(parties: &common::Parties) -> Value {
    json!({
        "consommateur_prm": "PRM-C1",
        "producteur_prm": "PRM-P1",
        "contrat_id": parties.contract.id,
        "operationId": parties.operation.id,
        "start": "2025-04-01T00:00:00Z",
        "end": "2025-04-30T00:00:00Z",
    })
}

#[tokio::test]
async fn test_invoice_numbers_increase_per_producer() {
    let h = Harness::new().await;
    let parties = billable(&h).await;

    let (status, first, _) = send(h.router(), post("/factures/generate", invoice_body(&parties))).await;
    assert_eq!(status, StatusCode::OK, "{}", first);
    let (_, second, _) = send(h.router(), post("/factures/generate", invoice_body(&parties))).await;

    assert_eq!(first["facture"]["numero"], "000001");
    assert_eq!(second["facture"]["numero"], "000002");
    let ht = first["facture"]["total_ht"].as_f64().unwrap();
    let ttc = first["facture"]["total_ttc"].as_f64().unwrap();
    assert!(ht > 0.0 && ttc > ht);

    let invoices = h.store.invoices().await;
    assert_eq!(invoices.len(), 2);
    assert!(invoices[0].storage_path.ends_with("FA-PRM-P1_000001.pdf"));
    assert!(h
        .storage
        .uploads()
        .iter()
        .filter(|u| u.bucket == INVOICE_BUCKET)
        .all(|u| !u.upsert));
}

#[tokio::test]
async fn test_invoice_without_consumption_is_404() {
    let h = Harness::new().await;
    let parties = billable(&h).await;
    let mut body = invoice_body(&parties);
    body["start"] = json!("2024-04-01T00:00:00Z");
    body["end"] = json!("2024-04-30T00:00:00Z");

    let (status, _, _) = send(h.router(), post("/factures/generate", body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.store.invoices().await.is_empty());
}

#[tokio::test]
async fn test_failed_attempt_does_not_use_up_an_invoice_number() {
    let h = Harness::new().await;
    let parties = billable(&h).await;
    h.storage
        .remove(INVOICE_BUCKET, &[INVOICE_TEMPLATE.to_string()])
        .await
        .unwrap();

    let (status, _, _) = send(h.router(), post("/factures/generate", invoice_body(&parties))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.store.invoices().await.is_empty());

    h.storage.put(INVOICE_BUCKET, INVOICE_TEMPLATE, b"invoice template");
    let (status, body, _) = send(h.router(), post("/factures/generate", invoice_body(&parties))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["facture"]["numero"], "000001");
}

#[tokio::test]
async fn test_invoice_without_excise_schedule_is_404() {
    let h = Harness::new().await;
    let parties = billable_with(&h, vec![]).await;

    let (status, body, _) = send(h.router(), post("/factures/generate", invoice_body(&parties))).await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{}", body);
    assert!(h.store.invoices().await.is_empty());
}

#[tokio::test]
async fn test_overlapping_excise_schedules_are_refused() {
    let h = Harness::new().await;
    let mut spring = excise_year(2025);
    spring.period_start = at(2025, 3, 1);
    spring.period_end = at(2025, 6, 30);
    let parties = billable_with(&h, vec![excise_year(2025), spring]).await;

    let (status, body, _) = send(h.router(), post("/factures/generate", invoice_body(&parties))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{}", body);
    assert!(h.store.invoices().await.is_empty());
    assert!(h.storage.uploads().iter().all(|u| u.bucket != INVOICE_BUCKET));
}

#[tokio::test]
async fn test_invoice_email_stamps_the_invoice() {
    let h = Harness::new().await;
    let parties = billable(&h).await;

    let (invoice, tasks) = generate_invoice(
        &h.services,
        InvoiceRequest {
            consumer_prm: "PRM-C1".to_string(),
            producer_prm: "PRM-P1".to_string(),
            contract_id: parties.contract.id,
            operation_id: parties.operation.id,
            start: at(2025, 4, 1),
            end: at(2025, 4, 30),
        },
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(tasks.names(), vec!["invoice_email"]);
    assert!(invoice.notified_at.is_none());

    let report = h.runner().run(tasks).await;
    assert!(report.failed.is_empty(), "{:?}", report.failed);

    let mails = h.mailer.sent_to("prm-c1@conso.test");
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].subject, "Votre facture 000001 est disponible");
    assert!(mails[0]
        .html
        .contains(&format!("http://api.test/factures/{}", invoice.id)));
    assert!(h.store.invoices().await[0].notified_at.is_some());
}

#[tokio::test]
async fn test_operation_billing_skips_meter_points_without_contract() {
    let h = Harness::new().await;
    let parties = billable(&h).await;

    let (status, body, _) = send(
        h.router(),
        post(
            "/factures/operation",
            json!({
                "operationId": parties.operation.id,
                "start": "2025-04-01T00:00:00Z",
                "end": "2025-04-30T00:00:00Z",
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["factures"].as_array().unwrap().len(), 1);
    assert_eq!(body["ignores"], json!(["PRM-ORPHAN"]));
    assert_eq!(body["echecs"], json!([]));
}

#[tokio::test]
async fn test_invoice_download_redirects_to_signed_url() {
    let h = Harness::new().await;
    let parties = billable(&h).await;
    let (_, created, _) = send(h.router(), post("/factures/generate", invoice_body(&parties))).await;
    let id = created["facture"]["id"].as_str().unwrap().to_string();

    let (status, _, location) = send(h.router(), get(&format!("/factures/{}", id))).await;
    assert_eq!(status, StatusCode::FOUND);
    let location = location.unwrap();
    assert!(location.starts_with("https://storage.test/signed/factures/"));
    assert!(location.ends_with("?ttl=300"));

    let (status, _, _) = send(h.router(), get(&format!("/factures/{}", Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
