use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use shared::{DomainError, DomainResult};
use tracing::info;

use crate::config::MailConfig;
use crate::http::{build_client, ensure_success, transport_error};

const SERVICE: &str = "email";

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</li>|</h[1-6]>").expect("valid regex"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").expect("valid regex"));
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").expect("valid regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
    pub attachments: Vec<Attachment>,
}

impl Email {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, html: impl Into<String>) -> Self {
        Email {
            to: vec![to.into()],
            subject: subject.into(),
            html: html.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, filename: impl Into<String>, content: Vec<u8>) -> Self {
        self.attachments.push(Attachment {
            filename: filename.into(),
            content,
        });
        self
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> DomainResult<()>;
}

/// Usable recipient from an optional contact column; blank values count as missing.
pub fn contact_address(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_string)
}

/// Plain-text alternative of an HTML body.
pub fn html_to_text(html: &str) -> String {
    let with_breaks = BREAK.replace_all(html, "\n");
    let stripped = TAG.replace_all(&with_breaks, "");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&#39;", "'")
        .replace("&quot;", "\"");
    let collapsed = SPACES.replace_all(&decoded, " ");
    let lines: Vec<&str> = collapsed.lines().map(str::trim).collect();
    BLANK_LINES
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

#[derive(Serialize)]
struct ResendAttachment<'a> {
    filename: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ResendPayload<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    html: &'a str,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<ResendAttachment<'a>>,
}

/// Transactional email over the Resend REST API.
pub struct ResendMailer {
    api_url: String,
    api_key: String,
    from: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl ResendMailer {
    pub fn new(config: &MailConfig, timeout_secs: u64) -> Self {
        ResendMailer {
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            from: config.from.clone(),
            client: build_client(timeout_secs),
            timeout_secs,
        }
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: &Email) -> DomainResult<()> {
        if email.to.iter().all(|r| r.trim().is_empty()) {
            return Err(DomainError::InvalidInput("email without recipient".into()));
        }

        let payload = ResendPayload {
            from: &self.from,
            to: &email.to,
            subject: &email.subject,
            html: &email.html,
            text: html_to_text(&email.html),
            attachments: email
                .attachments
                .iter()
                .map(|a| ResendAttachment {
                    filename: &a.filename,
                    content: STANDARD.encode(&a.content),
                })
                .collect(),
        };

        let response = self
            .client
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, self.timeout_secs, e))?;
        ensure_success(SERVICE, response).await?;

        info!(
            to = ?email.to,
            subject = %email.subject,
            attachments = email.attachments.len(),
            "email sent"
        );
        Ok(())
    }
}
