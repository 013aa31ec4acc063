// tests/common/mod.rs
//
// In-process collaborators and seed data shared by the integration tests.
// Every fake implements the production trait, so the orchestrators and the
// router run unchanged on top of `MemoryStore`.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

use kinjo_api::auth::Authenticator;
use kinjo_api::config::{AppConfig, RetryConfig};
use kinjo_api::documents::{
    DocumentConverter, DocumentSigner, SignatureMark, TemplateData, TemplateRenderer,
    TemplateSyntax,
};
use kinjo_api::enedis::{
    ClientCredentials, EnergySeries, IntegrationRequest, MeteringApi, NamedQuantity, QuantityGroup,
};
use kinjo_api::mailer::{Email, Mailer};
use kinjo_api::outbox::PostCommitRunner;
use kinjo_api::services::{Collaborators, ServiceSettings, CONTRACT_TEMPLATE};
use kinjo_api::state::AppState;
use kinjo_api::storage::ObjectStore;
use kinjo_api::store::MemoryStore;
use shared::{Consumer, Contract, DomainError, DomainResult, Installation, Operation, Producer};

pub const STORAGE_BASE: &str = "https://storage.test";

// ─── Fakes ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub bucket: String,
    pub path: String,
    pub upsert: bool,
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    uploads: Mutex<Vec<Upload>>,
    removed: Mutex<Vec<String>>,
}

impl FakeStorage {
    pub fn put(&self, bucket: &str, path: &str, bytes: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), path.to_string()), bytes.to_vec());
    }

    pub fn get(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for FakeStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
        upsert: bool,
    ) -> DomainResult<String> {
        if !upsert && self.get(bucket, path).is_some() {
            return Err(DomainError::external("storage", "object already exists"));
        }
        self.put(bucket, path, &bytes);
        self.uploads.lock().unwrap().push(Upload {
            bucket: bucket.to_string(),
            path: path.to_string(),
            upsert,
        });
        Ok(self.public_url(bucket, path))
    }

    async fn download(&self, bucket: &str, path: &str) -> DomainResult<Vec<u8>> {
        self.get(bucket, path)
            .ok_or_else(|| DomainError::not_found("object", format!("{}/{}", bucket, path)))
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> DomainResult<()> {
        let mut objects = self.objects.lock().unwrap();
        for path in paths {
            objects.remove(&(bucket.to_string(), path.clone()));
            self.removed.lock().unwrap().push(path.clone());
        }
        Ok(())
    }

    async fn move_object(&self, bucket: &str, from: &str, to: &str) -> DomainResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let bytes = objects
            .remove(&(bucket.to_string(), from.to_string()))
            .ok_or_else(|| DomainError::not_found("object", from))?;
        objects.insert((bucket.to_string(), to.to_string()), bytes);
        Ok(())
    }

    async fn signed_url(&self, bucket: &str, path: &str, ttl_secs: u64) -> DomainResult<String> {
        Ok(format!("{}/signed/{}/{}?ttl={}", STORAGE_BASE, bucket, path, ttl_secs))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", STORAGE_BASE, bucket, path)
    }
}

#[derive(Default)]
pub struct FakeAuth {
    tokens: Mutex<HashMap<String, Uuid>>,
}

impl FakeAuth {
    pub fn grant(&self, token: &str, user_id: Uuid) {
        self.tokens.lock().unwrap().insert(token.to_string(), user_id);
    }
}

#[async_trait]
impl Authenticator for FakeAuth {
    async fn user_id(&self, token: &str) -> DomainResult<Uuid> {
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .ok_or_else(|| DomainError::Unauthorized("invalid session".to_string()))
    }
}

/// Records delivered mail. Subjects registered with `fail_once` are refused
/// with a transient error the first time they are sent.
#[derive(Default)]
pub struct FakeMailer {
    sent: Mutex<Vec<Email>>,
    failing: Mutex<Vec<String>>,
}

impl FakeMailer {
    pub fn fail_once(&self, subject: &str) {
        self.failing.lock().unwrap().push(subject.to_string());
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, address: &str) -> Vec<Email> {
        self.sent()
            .into_iter()
            .filter(|e| e.to.iter().any(|to| to == address))
            .collect()
    }
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(&self, email: &Email) -> DomainResult<()> {
        {
            let mut failing = self.failing.lock().unwrap();
            if let Some(idx) = failing.iter().position(|s| *s == email.subject) {
                failing.remove(idx);
                return Err(DomainError::external("email", "HTTP 503"));
            }
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

/// Renders to the JSON of the data it was given.
#[derive(Default)]
pub struct FakeRenderer {
    rendered: Mutex<Vec<(TemplateSyntax, TemplateData)>>,
}

impl FakeRenderer {
    pub fn rendered(&self) -> Vec<(TemplateSyntax, TemplateData)> {
        self.rendered.lock().unwrap().clone()
    }
}

#[async_trait]
impl TemplateRenderer for FakeRenderer {
    async fn render(
        &self,
        _template: Vec<u8>,
        syntax: TemplateSyntax,
        data: &TemplateData,
    ) -> DomainResult<Vec<u8>> {
        self.rendered.lock().unwrap().push((syntax, data.clone()));
        serde_json::to_vec(data).map_err(|e| DomainError::external("renderer", e.to_string()))
    }
}

/// Appends the mark text to the document.
#[derive(Default)]
pub struct FakeSigner {
    marks: Mutex<Vec<SignatureMark>>,
}

impl FakeSigner {
    pub fn marks(&self) -> Vec<SignatureMark> {
        self.marks.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentSigner for FakeSigner {
    async fn sign(&self, mut pdf: Vec<u8>, mark: &SignatureMark) -> DomainResult<Vec<u8>> {
        self.marks.lock().unwrap().push(mark.clone());
        pdf.extend_from_slice(mark.text().as_bytes());
        Ok(pdf)
    }
}

/// Copies the source next to itself with a `.pdf` extension.
pub struct FakeConverter;

#[async_trait]
impl DocumentConverter for FakeConverter {
    async fn convert(&self, source: &Path, out_dir: &Path) -> DomainResult<PathBuf> {
        let file_name = source
            .file_stem()
            .map(|s| format!("{}.pdf", s.to_string_lossy()))
            .unwrap_or_else(|| "out.pdf".to_string());
        let target = out_dir.join(file_name);
        tokio::fs::copy(source, &target)
            .await
            .map_err(|e| DomainError::external("converter", e.to_string()))?;
        Ok(target)
    }
}

#[derive(Default)]
pub struct FakeMetering {
    series: Mutex<HashMap<String, EnergySeries>>,
    integrations: Mutex<Vec<(String, IntegrationRequest)>>,
}

impl FakeMetering {
    pub fn add_series(&self, series: EnergySeries) {
        self.series
            .lock()
            .unwrap()
            .insert(series.cons_id.clone(), series);
    }

    pub fn integrations(&self) -> Vec<(String, IntegrationRequest)> {
        self.integrations.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeteringApi for FakeMetering {
    async fn access_token(&self, credentials: &ClientCredentials) -> DomainResult<String> {
        Ok(format!("token-{}", credentials.client_id))
    }

    async fn definitive_active_energy(
        &self,
        _token: &str,
        _agreement: &str,
        prm: &str,
        _start: &str,
        _end: &str,
    ) -> DomainResult<EnergySeries> {
        self.series
            .lock()
            .unwrap()
            .get(prm)
            .cloned()
            .ok_or_else(|| DomainError::external("enedis", format!("no data for {}", prm)))
    }

    async fn submit_integration(
        &self,
        _token: &str,
        agreement: &str,
        request: &IntegrationRequest,
    ) -> DomainResult<()> {
        self.integrations
            .lock()
            .unwrap()
            .push((agreement.to_string(), request.clone()));
        Ok(())
    }
}

/// One series with the same value in every DISTRIB band of each type.
pub fn energy_series(
    prm: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    own: f64,
    complement: f64,
) -> EnergySeries {
    let group = |kind: &str, value: f64| QuantityGroup {
        kind: kind.to_string(),
        calendar_type: "DISTRIB".to_string(),
        quantities: ["P", "HPH", "HCH", "HPB", "HCB"]
            .iter()
            .map(|name| NamedQuantity {
                name: name.to_string(),
                value: Some(value),
            })
            .collect(),
    };
    EnergySeries {
        cons_id: prm.to_string(),
        start_date: start,
        end_date: end,
        unit: Some("kWh".to_string()),
        quantities: vec![
            group("autocons", own),
            group("complement", complement),
            group("cons", own + complement),
        ],
    }
}

// ─── Harness ──────────────────────────────────────────────────────────────────

pub struct Harness {
    pub services: Collaborators,
    pub store: Arc<MemoryStore>,
    pub storage: Arc<FakeStorage>,
    pub auth: Arc<FakeAuth>,
    pub mailer: Arc<FakeMailer>,
    pub renderer: Arc<FakeRenderer>,
    pub signer: Arc<FakeSigner>,
    pub metering: Arc<FakeMetering>,
    pub scratch: TempDir,
    pub templates: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let templates = tempfile::tempdir().unwrap();
        tokio::fs::write(templates.path().join(CONTRACT_TEMPLATE), b"docx template")
            .await
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let storage = Arc::new(FakeStorage::default());
        let auth = Arc::new(FakeAuth::default());
        let mailer = Arc::new(FakeMailer::default());
        let renderer = Arc::new(FakeRenderer::default());
        let signer = Arc::new(FakeSigner::default());
        let metering = Arc::new(FakeMetering::default());

        let services = Collaborators {
            store: store.clone(),
            storage: storage.clone(),
            auth: auth.clone(),
            mailer: mailer.clone(),
            renderer: renderer.clone(),
            signer: signer.clone(),
            converter: Arc::new(FakeConverter),
            metering: metering.clone(),
            settings: ServiceSettings {
                temp_dir: scratch.path().to_path_buf(),
                template_dir: templates.path().to_path_buf(),
                backend_base_url: "http://api.test".to_string(),
                signed_url_ttl_secs: 300,
                mail_pacing_ms: 0,
            },
        };

        Harness {
            services,
            store,
            storage,
            auth,
            mailer,
            renderer,
            signer,
            metering,
            scratch,
            templates,
        }
    }

    /// Single attempt, so failing tasks surface immediately.
    pub fn runner(&self) -> PostCommitRunner {
        PostCommitRunner::new(RetryConfig {
            max_attempts: 1,
            backoff_base_secs: 1,
            backoff_max_secs: 1,
        })
    }

    /// Retries transient failures without waiting between attempts.
    pub fn retrying_runner(&self, max_attempts: u32) -> PostCommitRunner {
        PostCommitRunner::new(RetryConfig {
            max_attempts,
            backoff_base_secs: 0,
            backoff_max_secs: 0,
        })
    }

    pub fn state(&self) -> AppState {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://localhost/kinjo"),
            ("SUPABASE_URL", STORAGE_BASE),
            ("SUPABASE_SERVICE_ROLE_KEY", "service-key"),
            ("RESEND_API_KEY", "re_test"),
            ("POST_COMMIT_MAX_ATTEMPTS", "1"),
        ]);
        let config = AppConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        let registry = prometheus::Registry::new_custom(Some("test".into()), None).unwrap();
        kinjo_api::metrics::register_all(&registry).unwrap();
        AppState::new(self.services.clone(), config, registry)
    }

    pub fn router(&self) -> axum::Router {
        kinjo_api::routes::app(self.state())
    }
}

// ─── Seed data ────────────────────────────────────────────────────────────────

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub struct Parties {
    pub consumer: Consumer,
    pub producer: Producer,
    pub installation: Installation,
    pub operation: Operation,
    pub contract: Contract,
}

pub fn consumer(kind: &str, prm: &str) -> Consumer {
    let business = kind == "pro";
    Consumer {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        kind: kind.to_string(),
        prm: Some(prm.to_string()),
        contact_first_name: Some("Claire".to_string()),
        contact_last_name: Some("Martin".to_string()),
        contact_email: Some(format!("{}@conso.test", prm.to_lowercase())),
        contact_phone: None,
        address: Some("3 rue des Lilas 69003 Lyon".to_string()),
        siret: business.then(|| "12345678900011".to_string()),
        legal_name: business.then(|| "Boulangerie Martin".to_string()),
        legal_acronym: None,
        power_category: Some(1),
        created_at: at(2025, 1, 1),
    }
}

pub fn producer() -> Producer {
    Producer {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        contact_first_name: Some("Paul".to_string()),
        contact_last_name: Some("Durand".to_string()),
        contact_email: Some("paul@prod.test".to_string()),
        contact_phone: None,
        address: Some("Lieu-dit Le Soleil 26000 Valence".to_string()),
        siret: None,
        legal_name: None,
        legal_acronym: None,
        created_at: at(2025, 1, 1),
    }
}

pub fn operation(producer_id: Uuid, status: i16) -> Operation {
    Operation {
        id: Uuid::new_v4(),
        producer_id,
        agreement_number: Some("ACC-0042".to_string()),
        status,
        annex_url: None,
        annex_mailed_at: None,
        grid_agreement_id: Some("GRD-7".to_string()),
        client_id: Some("client".to_string()),
        client_secret: Some("secret".to_string()),
        start_date: None,
    }
}

pub fn contract(consumer: &Consumer, installation: &Installation, operation: &Operation) -> Contract {
    Contract {
        id: Uuid::new_v4(),
        consumer_id: consumer.id,
        producer_id: installation.producer_id,
        installation_id: installation.id,
        operation_id: Some(operation.id),
        consumer_prm: consumer.prm.clone(),
        installation_prm: Some(installation.prm.clone()),
        number: Some("CPV-2025-001".to_string()),
        status: "panier".to_string(),
        consumer_signed_at: None,
        producer_signed_at: None,
        tariff_base: Some(15.0),
        tariff_peak: None,
        tariff_hph: None,
        tariff_hch: None,
        tariff_hpb: None,
        tariff_hcb: None,
        consumer_rank: None,
        document_url: None,
        consumer_ip: None,
        version: 0,
        created_at: at(2025, 1, 10),
        updated_at: at(2025, 1, 10),
    }
}

/// A consumer, a producer with one installation and operation, and an
/// unsigned contract between them, all stored.
pub async fn seed(h: &Harness, consumer_kind: &str, operation_status: i16) -> Parties {
    let consumer = consumer(consumer_kind, "PRM-C1");
    seed_with(h, consumer, operation_status, |_| {}).await
}

pub async fn seed_with(
    h: &Harness,
    consumer: Consumer,
    operation_status: i16,
    adjust: impl FnOnce(&mut Operation),
) -> Parties {
    let producer = producer();
    let installation = Installation {
        id: Uuid::new_v4(),
        producer_id: producer.id,
        prm: "PRM-P1".to_string(),
        power_kva: Some(36.0),
        address: Some("Toiture hangar".to_string()),
        holder: Some("Paul Durand".to_string()),
        municipality: Some("Valence".to_string()),
    };
    let mut operation = operation(producer.id, operation_status);
    adjust(&mut operation);
    let contract = contract(&consumer, &installation, &operation);

    h.store.add_consumer(consumer.clone()).await;
    h.store.add_producer(producer.clone()).await;
    h.store.add_installation(installation.clone()).await;
    h.store.add_operation(operation.clone()).await;
    h.store.add_contract(contract.clone()).await;

    Parties {
        consumer,
        producer,
        installation,
        operation,
        contract,
    }
}
