//! Orchestrators of the signing, integration, invoicing and metering flows.
//!
//! Every flow receives its collaborators through [`Collaborators`]; nothing in
//! here reaches for process-wide clients.

pub mod commissioning;
pub mod consent;
pub mod integration;
pub mod invoicing;
pub mod metering;
pub mod signature;
pub mod status;
pub mod templates;
pub mod waiver;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use shared::{DomainError, DomainResult, Party};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::documents::{DocumentConverter, DocumentSigner, TemplateRenderer};
use crate::enedis::MeteringApi;
use crate::mailer::Mailer;
use crate::storage::ObjectStore;
use crate::store::Store;

pub const CONTRACT_BUCKET: &str = "contrats";
pub const ANNEX_BUCKET: &str = "annexes21";
pub const INVOICE_BUCKET: &str = "factures";

pub const CONTRACT_TEMPLATE: &str = "CPV_template.docx";
pub const INVOICE_TEMPLATE: &str = "facture_template_V0_1.docx";

pub const PDF_CONTENT_TYPE: &str = "application/pdf";
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// The contract party an authenticated user stands for. Consumers are looked
/// up first; a user with neither row resolves to `None`.
pub async fn resolve_party(store: &dyn Store, user_id: Uuid) -> DomainResult<Option<Party>> {
    if let Some(consumer) = store.consumer_by_user(user_id).await? {
        return Ok(Some(Party::Consumer(consumer)));
    }
    Ok(store.producer_by_user(user_id).await?.map(Party::Producer))
}

/// Compact timestamp form of the metering API.
const API_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Settings the orchestrators need beyond their collaborators.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub temp_dir: PathBuf,
    pub template_dir: PathBuf,
    pub backend_base_url: String,
    pub signed_url_ttl_secs: u64,
    pub mail_pacing_ms: u64,
}

/// Injected collaborators of every flow.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub storage: Arc<dyn ObjectStore>,
    pub auth: Arc<dyn Authenticator>,
    pub mailer: Arc<dyn Mailer>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub signer: Arc<dyn DocumentSigner>,
    pub converter: Arc<dyn DocumentConverter>,
    pub metering: Arc<dyn MeteringApi>,
    pub settings: ServiceSettings,
}

/// Accepts `YYYYMMDDTHHMMSSZ` and RFC 3339.
pub fn parse_api_timestamp(value: &str) -> DomainResult<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, API_TIMESTAMP_FORMAT) {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DomainError::InvalidInput(format!("invalid timestamp: {}", value)))
}

pub fn format_api_timestamp(at: DateTime<Utc>) -> String {
    at.format(API_TIMESTAMP_FORMAT).to_string()
}

/// Per-request scratch directory under the configured temp dir.
#[derive(Debug, Clone)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub async fn create(root: &Path) -> DomainResult<Self> {
        let path = root.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| io_error("create scratch directory", e))?;
        Ok(WorkDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the directory and everything in it. Failures are only logged.
    pub async fn remove(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "scratch cleanup failed");
            }
        }
    }
}

pub(crate) fn io_error(action: &str, err: std::io::Error) -> DomainError {
    DomainError::external("filesystem", format!("{}: {}", action, err))
}

/// Read a document template shipped next to the binary.
pub(crate) async fn read_local_template(dir: &Path, name: &str) -> DomainResult<Vec<u8>> {
    let path = dir.join(name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(DomainError::not_found("template", path.display()))
        }
        Err(e) => Err(io_error("read template", e)),
    }
}

/// Write `source` into the work dir, convert it and return the PDF bytes.
pub(crate) async fn convert_to_pdf(
    converter: &dyn DocumentConverter,
    work_dir: &WorkDir,
    file_name: &str,
    source: &[u8],
) -> DomainResult<Vec<u8>> {
    let source_path = work_dir.path().join(file_name);
    tokio::fs::write(&source_path, source)
        .await
        .map_err(|e| io_error("write document", e))?;
    let pdf_path = converter.convert(&source_path, work_dir.path()).await?;
    tokio::fs::read(&pdf_path)
        .await
        .map_err(|e| io_error("read converted document", e))
}
