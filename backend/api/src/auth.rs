use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use shared::{DomainError, DomainResult};
use tracing::warn;
use uuid::Uuid;

use crate::config::SupabaseConfig;
use crate::http::{build_client, transport_error};

const SERVICE: &str = "auth";

/// Resolves a caller's bearer token to the authenticated user id.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn user_id(&self, token: &str) -> DomainResult<Uuid>;
}

/// Extract the token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> DomainResult<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DomainError::Unauthorized("missing bearer token".into()))
}

pub struct SupabaseAuth {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: Uuid,
}

impl SupabaseAuth {
    pub fn new(config: &SupabaseConfig, timeout_secs: u64) -> Self {
        SupabaseAuth {
            base_url: config.url.clone(),
            api_key: config.service_role_key.clone(),
            client: build_client(timeout_secs),
            timeout_secs,
        }
    }
}

#[async_trait]
impl Authenticator for SupabaseAuth {
    async fn user_id(&self, token: &str) -> DomainResult<Uuid> {
        let response = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .bearer_auth(token)
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, self.timeout_secs, e))?;

        let status = response.status();
        if status.is_client_error() {
            warn!(%status, "token rejected");
            return Err(DomainError::Unauthorized("invalid or expired token".into()));
        }
        if !status.is_success() {
            return Err(DomainError::external(SERVICE, format!("HTTP {}", status)));
        }

        let user: UserResponse = response
            .json()
            .await
            .map_err(|e| DomainError::external(SERVICE, format!("invalid user payload: {}", e)))?;
        Ok(user.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert!(matches!(bearer_token(&headers), Err(DomainError::Unauthorized(_))));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_err());

        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        assert_eq!(bearer_token(&headers).unwrap(), "tok");
    }

    #[tokio::test]
    async fn resolves_user_and_rejects_bad_tokens() {
        let server = MockServer::start().await;
        let user = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": user, "email": "p@x.fr"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer bad"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let auth = SupabaseAuth::new(
            &SupabaseConfig {
                url: server.uri(),
                service_role_key: "k".into(),
            },
            5,
        );
        assert_eq!(auth.user_id("good").await.unwrap(), user);
        assert!(matches!(
            auth.user_id("bad").await,
            Err(DomainError::Unauthorized(_))
        ));
    }
}
