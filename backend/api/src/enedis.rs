/// Grid operator metering API client
/// OAuth2 client-credentials, definitive active energy series, participant integration

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{DomainError, DomainResult};
use tracing::{debug, info};

use crate::config::EnedisConfig;
use crate::http::{build_client, ensure_success, transport_error};

const SERVICE: &str = "metering api";
const AGREEMENTS_PATH: &str = "/collective_self_consumption/v4/agreements";

/// Per-operation API credentials.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Volumes of the five distributor bands; absent bands stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandValues {
    pub peak: Option<f64>,
    pub hph: Option<f64>,
    pub hch: Option<f64>,
    pub hpb: Option<f64>,
    pub hcb: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedQuantity {
    pub name: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuantityGroup {
    #[serde(rename = "type")]
    pub kind: String,
    pub calendar_type: String,
    #[serde(default)]
    pub quantities: Vec<NamedQuantity>,
}

/// One meter point's definitive active energy over a period.
#[derive(Debug, Clone, Deserialize)]
pub struct EnergySeries {
    pub cons_id: String,
    #[serde(rename = "startDate")]
    pub start_date: DateTime<Utc>,
    #[serde(rename = "endDate")]
    pub end_date: DateTime<Utc>,
    pub unit: Option<String>,
    #[serde(default)]
    pub quantities: Vec<QuantityGroup>,
}

impl EnergySeries {
    /// Distributor-calendar bands of one quantity type (`cons`, `autocons`, `complement`).
    pub fn distributor_bands(&self, kind: &str) -> BandValues {
        let group = self
            .quantities
            .iter()
            .find(|g| g.kind == kind && g.calendar_type == "DISTRIB");
        let value = |name: &str| {
            group.and_then(|g| g.quantities.iter().find(|q| q.name == name).and_then(|q| q.value))
        };
        BandValues {
            peak: value("P"),
            hph: value("HPH"),
            hch: value("HCH"),
            hpb: value("HPB"),
            hcb: value("HCB"),
        }
    }
}

/// Request to admit a consumer meter point into a commissioned operation.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationRequest {
    pub consumer_prm: String,
    pub installation_prm: String,
    pub consumer_rank: Option<i32>,
    pub requested_at: DateTime<Utc>,
}

#[async_trait]
pub trait MeteringApi: Send + Sync {
    async fn access_token(&self, credentials: &ClientCredentials) -> DomainResult<String>;

    /// `start`/`end` use the API's compact `YYYYMMDDTHHMMSSZ` form.
    async fn definitive_active_energy(
        &self,
        token: &str,
        agreement: &str,
        prm: &str,
        start: &str,
        end: &str,
    ) -> DomainResult<EnergySeries>;

    async fn submit_integration(
        &self,
        token: &str,
        agreement: &str,
        request: &IntegrationRequest,
    ) -> DomainResult<()>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct EnedisClient {
    token_url: String,
    api_base: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl EnedisClient {
    pub fn new(config: &EnedisConfig, timeout_secs: u64) -> Self {
        EnedisClient {
            token_url: config.token_url.clone(),
            api_base: config.api_base.clone(),
            client: build_client(timeout_secs),
            timeout_secs,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> DomainResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, self.timeout_secs, e))?;
        ensure_success(SERVICE, response).await
    }
}

#[async_trait]
impl MeteringApi for EnedisClient {
    async fn access_token(&self, credentials: &ClientCredentials) -> DomainResult<String> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
        ];
        let response = self.send(self.client.post(&self.token_url).form(&form)).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DomainError::external(SERVICE, format!("invalid token response: {}", e)))?;
        debug!(client_id = %credentials.client_id, "metering token obtained");
        Ok(token.access_token)
    }

    async fn definitive_active_energy(
        &self,
        token: &str,
        agreement: &str,
        prm: &str,
        start: &str,
        end: &str,
    ) -> DomainResult<EnergySeries> {
        let url = format!(
            "{}{}/{}/definitive_active_energy/cons/{}",
            self.api_base, AGREEMENTS_PATH, agreement, prm
        );
        let response = self
            .send(self.client.get(&url).bearer_auth(token).query(&[
                ("start", start),
                ("end", end),
                ("type", "cons,autocons,complement"),
            ]))
            .await?;
        let series: EnergySeries = response
            .json()
            .await
            .map_err(|e| DomainError::external(SERVICE, format!("invalid energy series: {}", e)))?;
        debug!(agreement, prm, groups = series.quantities.len(), "energy series fetched");
        Ok(series)
    }

    async fn submit_integration(
        &self,
        token: &str,
        agreement: &str,
        request: &IntegrationRequest,
    ) -> DomainResult<()> {
        let url = format!("{}{}/{}/participants", self.api_base, AGREEMENTS_PATH, agreement);
        self.send(self.client.post(&url).bearer_auth(token).json(request))
            .await?;
        info!(agreement, prm = %request.consumer_prm, "integration request accepted");
        Ok(())
    }
}
