/// Outbound HTTP helpers shared by every REST adapter
/// One client per adapter, one timeout for every call it makes

use shared::{DomainError, DomainResult};
use std::time::Duration;
use tracing::error;

pub fn build_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Classify a transport failure.
pub fn transport_error(service: &'static str, timeout_secs: u64, err: reqwest::Error) -> DomainError {
    if err.is_timeout() {
        DomainError::Timeout {
            operation: service,
            seconds: timeout_secs,
        }
    } else {
        DomainError::external(service, err.to_string())
    }
}

/// Turn a non-2xx response into `ExternalService` carrying the body text.
pub async fn ensure_success(
    service: &'static str,
    response: reqwest::Response,
) -> DomainResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(service, %status, body = %body, "remote call rejected");
    Err(DomainError::external(
        service,
        format!("HTTP {}: {}", status, body),
    ))
}
