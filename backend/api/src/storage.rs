/// Object storage adapter
/// Talks to the managed backend's storage REST API with the service-role key

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use shared::{DomainError, DomainResult};
use tracing::{debug, info};

use crate::config::SupabaseConfig;
use crate::http::{build_client, ensure_success, transport_error};

const SERVICE: &str = "storage";
const PUBLIC_SEGMENT: &str = "/storage/v1/object/public/";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `bucket/path` and return the object's public URL.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> DomainResult<String>;

    async fn download(&self, bucket: &str, path: &str) -> DomainResult<Vec<u8>>;

    async fn remove(&self, bucket: &str, paths: &[String]) -> DomainResult<()>;

    async fn move_object(&self, bucket: &str, from: &str, to: &str) -> DomainResult<()>;

    /// Short-lived download URL.
    async fn signed_url(&self, bucket: &str, path: &str, ttl_secs: u64) -> DomainResult<String>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}

/// Path of an object inside `bucket`, recovered from its public URL.
///
/// Accepts both `.../public/{bucket}/{path}` and the bucket-less
/// `.../public/{path}` shape; query strings are dropped.
pub fn object_path_from_public_url(url: &str, bucket: &str) -> Option<String> {
    let (_, tail) = url.split_once(PUBLIC_SEGMENT)?;
    let tail = tail.split('?').next().unwrap_or(tail);
    let path = tail
        .strip_prefix(bucket)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(tail);
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

pub struct SupabaseStorage {
    base_url: String,
    service_key: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl SupabaseStorage {
    pub fn new(config: &SupabaseConfig, timeout_secs: u64) -> Self {
        SupabaseStorage {
            base_url: config.url.clone(),
            service_key: config.service_role_key.clone(),
            client: build_client(timeout_secs),
            timeout_secs,
        }
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> DomainResult<reqwest::Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, self.timeout_secs, e))?;
        ensure_success(SERVICE, response).await
    }
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> DomainResult<String> {
        let size = bytes.len();
        self.send(
            self.client
                .post(self.object_url(bucket, path))
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .header("x-upsert", upsert.to_string())
                .body(bytes),
        )
        .await?;
        info!(bucket, path, size, "object uploaded");
        Ok(self.public_url(bucket, path))
    }

    async fn download(&self, bucket: &str, path: &str) -> DomainResult<Vec<u8>> {
        let response = self
            .send(self.client.get(self.object_url(bucket, path)))
            .await
            .map_err(|err| match err {
                DomainError::ExternalService { message, .. } if message.starts_with("HTTP 404") => {
                    DomainError::not_found("storage object", format!("{}/{}", bucket, path))
                }
                other => other,
            })?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(SERVICE, self.timeout_secs, e))?;
        debug!(bucket, path, size = bytes.len(), "object downloaded");
        Ok(bytes.to_vec())
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> DomainResult<()> {
        self.send(
            self.client
                .delete(format!("{}/storage/v1/object/{}", self.base_url, bucket))
                .json(&json!({ "prefixes": paths })),
        )
        .await?;
        debug!(bucket, count = paths.len(), "objects removed");
        Ok(())
    }

    async fn move_object(&self, bucket: &str, from: &str, to: &str) -> DomainResult<()> {
        self.send(
            self.client
                .post(format!("{}/storage/v1/object/move", self.base_url))
                .json(&json!({
                    "bucketId": bucket,
                    "sourceKey": from,
                    "destinationKey": to,
                })),
        )
        .await?;
        info!(bucket, from, to, "object moved");
        Ok(())
    }

    async fn signed_url(&self, bucket: &str, path: &str, ttl_secs: u64) -> DomainResult<String> {
        let response = self
            .send(
                self.client
                    .post(format!(
                        "{}/storage/v1/object/sign/{}/{}",
                        self.base_url, bucket, path
                    ))
                    .json(&json!({ "expiresIn": ttl_secs })),
            )
            .await?;
        let body: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| DomainError::external(SERVICE, format!("invalid sign response: {}", e)))?;
        Ok(format!("{}/storage/v1{}", self.base_url, body.signed_url))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}{}{}/{}", self.base_url, PUBLIC_SEGMENT, bucket, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage(server: &MockServer) -> SupabaseStorage {
        SupabaseStorage::new(
            &SupabaseConfig {
                url: server.uri(),
                service_role_key: "service-key".into(),
            },
            5,
        )
    }

    #[test]
    fn parses_public_urls() {
        let url = "https://x.supabase.co/storage/v1/object/public/contrats/consommateurs/CPV_A_B_cons.pdf";
        assert_eq!(
            object_path_from_public_url(url, "contrats").as_deref(),
            Some("consommateurs/CPV_A_B_cons.pdf")
        );
        assert_eq!(
            object_path_from_public_url("https://x/storage/v1/object/public/annexes21/operations/a.xlsx?t=1", "annexes21")
                .as_deref(),
            Some("operations/a.xlsx")
        );
        assert_eq!(object_path_from_public_url("https://x/other", "contrats"), None);
    }

    #[tokio::test]
    async fn upload_returns_public_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/contrats/finalises/a_prod.pdf"))
            .and(header("x-upsert", "true"))
            .and(header("authorization", "Bearer service-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Key": "x"})))
            .expect(1)
            .mount(&server)
            .await;

        let url = storage(&server)
            .upload("contrats", "finalises/a_prod.pdf", b"%PDF".to_vec(), "application/pdf", true)
            .await
            .unwrap();
        assert_eq!(
            url,
            format!("{}/storage/v1/object/public/contrats/finalises/a_prod.pdf", server.uri())
        );
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/object/factures/missing.docx"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = storage(&server).download("factures", "missing.docx").await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound { .. }));
    }

    #[tokio::test]
    async fn move_and_sign() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/move"))
            .and(body_json(json!({
                "bucketId": "annexes21",
                "sourceKey": "operations/a_20250101.xlsx",
                "destinationKey": "operations/a_20250601.xlsx",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/v1/object/sign/factures/op/2025/05/FA-1_000001.pdf"))
            .and(body_json(json!({"expiresIn": 300})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"signedURL": "/object/sign/factures/op/2025/05/FA-1_000001.pdf?token=t"})),
            )
            .mount(&server)
            .await;

        let store = storage(&server);
        store
            .move_object("annexes21", "operations/a_20250101.xlsx", "operations/a_20250601.xlsx")
            .await
            .unwrap();
        let url = store
            .signed_url("factures", "op/2025/05/FA-1_000001.pdf", 300)
            .await
            .unwrap();
        assert!(url.ends_with("/storage/v1/object/sign/factures/op/2025/05/FA-1_000001.pdf?token=t"));
    }

    #[tokio::test]
    async fn server_error_is_external() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/object/contrats"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = storage(&server)
            .remove("contrats", &["finalises/a.docx".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
