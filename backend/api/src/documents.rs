//! Document pipeline collaborators: template rendering, visible signature
//! stamping and office-to-PDF conversion.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use shared::{DomainError, DomainResult, SignerRole};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{error, info};

use crate::http::{build_client, ensure_success, transport_error};
use crate::metrics;

const SERVICE: &str = "document service";

/// Flat placeholder → value map; booleans drive conditional sections.
pub type TemplateData = Map<String, Value>;

/// Placeholder delimiters used by a template family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSyntax {
    /// Word contracts and invoices: `<<field>>`.
    Document,
    /// Regulatory spreadsheets: `{{path.to.field}}`.
    Spreadsheet,
}

impl TemplateSyntax {
    pub fn delimiters(&self) -> (&'static str, &'static str) {
        match self {
            TemplateSyntax::Document => ("<<", ">>"),
            TemplateSyntax::Spreadsheet => ("{{", "}}"),
        }
    }
}

/// Visible acceptance mark stamped on the last page of a PDF.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureMark {
    pub signer_id: String,
    pub role: SignerRole,
    pub signed_at: DateTime<Utc>,
    pub ip: Option<String>,
}

impl SignatureMark {
    pub const X: u32 = 50;
    pub const FONT_SIZE: u32 = 12;

    pub fn text(&self) -> String {
        format!(
            "Signé par : {} ({}) le {}",
            self.signer_id,
            self.role.as_str(),
            self.signed_at.format("%d/%m/%Y %H:%M:%S")
        )
    }

    /// Producer marks sit just above the consumer's.
    pub fn y(&self) -> u32 {
        match self.role {
            SignerRole::Consumer => 50,
            SignerRole::Producer => 70,
        }
    }
}

#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        template: Vec<u8>,
        syntax: TemplateSyntax,
        data: &TemplateData,
    ) -> DomainResult<Vec<u8>>;
}

#[async_trait]
pub trait DocumentSigner: Send + Sync {
    async fn sign(&self, pdf: Vec<u8>, mark: &SignatureMark) -> DomainResult<Vec<u8>>;
}

#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Convert `source` into `out_dir`, returning the produced PDF path.
    async fn convert(&self, source: &Path, out_dir: &Path) -> DomainResult<PathBuf>;
}

// ═══════════════════════════════════════════════════════════════════════════
// RENDERING + STAMPING SERVICE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    template: String,
    delimiters: Value,
    data: &'a TemplateData,
}

#[derive(Debug, Serialize)]
struct SignRequest {
    pdf: String,
    text: String,
    page: &'static str,
    x: u32,
    y: u32,
    size: u32,
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DocumentResponse {
    document: String,
}

/// HTTP client of the rendering and stamping sidecar.
pub struct DocumentServiceClient {
    base_url: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl DocumentServiceClient {
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        DocumentServiceClient {
            base_url,
            client: build_client(timeout_secs),
            timeout_secs,
        }
    }

    async fn call<T: Serialize + Sync>(&self, route: &str, body: &T) -> DomainResult<Vec<u8>> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, route))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, self.timeout_secs, e))?;
        let payload: DocumentResponse = ensure_success(SERVICE, response)
            .await?
            .json()
            .await
            .map_err(|e| DomainError::external(SERVICE, format!("invalid response: {}", e)))?;
        STANDARD
            .decode(payload.document)
            .map_err(|e| DomainError::external(SERVICE, format!("invalid base64 document: {}", e)))
    }
}

#[async_trait]
impl TemplateRenderer for DocumentServiceClient {
    async fn render(
        &self,
        template: Vec<u8>,
        syntax: TemplateSyntax,
        data: &TemplateData,
    ) -> DomainResult<Vec<u8>> {
        let (start, end) = syntax.delimiters();
        let request = RenderRequest {
            template: STANDARD.encode(template),
            delimiters: json!({ "start": start, "end": end }),
            data,
        };
        let rendered = self.call("/render", &request).await?;
        info!(fields = data.len(), size = rendered.len(), "template rendered");
        Ok(rendered)
    }
}

#[async_trait]
impl DocumentSigner for DocumentServiceClient {
    async fn sign(&self, pdf: Vec<u8>, mark: &SignatureMark) -> DomainResult<Vec<u8>> {
        let request = SignRequest {
            pdf: STANDARD.encode(pdf),
            text: mark.text(),
            page: "last",
            x: SignatureMark::X,
            y: mark.y(),
            size: SignatureMark::FONT_SIZE,
            ip: mark.ip.clone(),
        };
        let signed = self.call("/sign", &request).await?;
        info!(role = mark.role.as_str(), signer = %mark.signer_id, "pdf signed");
        Ok(signed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONVERSION SUBPROCESS
// ═══════════════════════════════════════════════════════════════════════════

/// Headless office suite invoked as a subprocess with a hard deadline.
pub struct LibreOfficeConverter {
    binary: String,
    timeout: Duration,
}

impl LibreOfficeConverter {
    pub fn new(binary: String, timeout_secs: u64) -> Self {
        LibreOfficeConverter {
            binary,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    async fn run(&self, source: &Path, out_dir: &Path) -> DomainResult<PathBuf> {
        let mut command = Command::new(&self.binary);
        command
            .arg("--headless")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(out_dir)
            .arg(source)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| DomainError::Timeout {
                operation: "document conversion",
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| DomainError::external("converter", format!("spawn failed: {}", e)))?;

        if !output.status.success() {
            return Err(DomainError::external(
                "converter",
                format!(
                    "exit {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        let stem = source
            .file_stem()
            .ok_or_else(|| DomainError::InvalidInput(format!("no file name in {}", source.display())))?;
        let produced = out_dir.join(format!("{}.pdf", stem.to_string_lossy()));
        if !tokio::fs::try_exists(&produced).await.unwrap_or(false) {
            return Err(DomainError::external(
                "converter",
                format!("expected output {} was not produced", produced.display()),
            ));
        }
        Ok(produced)
    }
}

#[async_trait]
impl DocumentConverter for LibreOfficeConverter {
    async fn convert(&self, source: &Path, out_dir: &Path) -> DomainResult<PathBuf> {
        let started = Instant::now();
        let result = self.run(source, out_dir).await;
        let elapsed = started.elapsed().as_secs_f64();
        metrics::observe_conversion(result.is_ok(), elapsed);

        match &result {
            Ok(pdf) => info!(source = %source.display(), pdf = %pdf.display(), elapsed, "document converted"),
            Err(err) => error!(source = %source.display(), error = %err, elapsed, "document conversion failed"),
        }
        result
    }
}
