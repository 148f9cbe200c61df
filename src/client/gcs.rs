use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::{header, Client, Response, StatusCode, Url};
use serde::Deserialize;
use tokio_util::io::StreamReader;

use super::{ClientError, CompletedPart, StorageClient};
use crate::object_store::ObjectReader;

const JSON_API: &str = "https://storage.googleapis.com/storage/v1";
const XML_API: &str = "https://storage.googleapis.com";

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// Google Cloud Storage client.
///
/// Buckets and plain object operations go through the JSON API; multipart
/// uploads use the S3-compatible XML API.
pub struct GcsClient {
    client: Client,
    project: Option<String>,
    credentials: Option<ServiceAccountKey>,
    access_token: tokio::sync::RwLock<Option<AccessToken>>,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
    #[serde(default)]
    project_id: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        Utc::now() + chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) < self.expires_at
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectItem {
    name: String,
}

impl GcsClient {
    /// Connect using a service-account key file, or the metadata server when
    /// no file is given. `project` is only needed to create buckets and
    /// defaults to the key file's project.
    pub async fn new(
        credentials_file: Option<&str>,
        project: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        let credentials = match credentials_file {
            Some(path) => {
                let key_json = tokio::fs::read_to_string(path).await?;
                Some(serde_json::from_str::<ServiceAccountKey>(&key_json)?)
            }
            None => None,
        };

        let project = project
            .map(|p| p.to_string())
            .or_else(|| credentials.as_ref().and_then(|c| c.project_id.clone()));

        let store = Self {
            client,
            project,
            credentials,
            access_token: tokio::sync::RwLock::new(None),
        };

        // Fail fast on bad credentials
        store.refresh_token().await?;
        Ok(store)
    }

    async fn token(&self) -> Result<String, ClientError> {
        if let Some(token) = self.access_token.read().await.as_ref() {
            if token.is_fresh() {
                return Ok(token.value.clone());
            }
        }

        self.refresh_token()
            .await
            .map_err(|e| ClientError::Backend(format!("GCS token refresh failed: {e}")))
    }

    async fn refresh_token(&self) -> Result<String, anyhow::Error> {
        let mut lock = self.access_token.write().await;
        if let Some(token) = lock.as_ref() {
            if token.is_fresh() {
                return Ok(token.value.clone());
            }
        }

        let resp = match self.credentials {
            Some(ref key) => self.token_from_service_account(key).await?,
            None => self.token_from_metadata_server().await?,
        };

        tracing::debug!(expires_in = resp.expires_in, "Refreshed GCS access token");
        let token = AccessToken {
            value: resp.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(resp.expires_in),
        };
        let value = token.value.clone();
        *lock = Some(token);
        Ok(value)
    }

    async fn token_from_service_account(
        &self,
        key: &ServiceAccountKey,
    ) -> Result<TokenResponse, anyhow::Error> {
        let now = Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": key.client_email,
            "scope": "https://www.googleapis.com/auth/devstorage.full_control",
            "aud": key.token_uri,
            "iat": now,
            "exp": now + 3600,
        });

        // Build JWT (header.claims.signature)
        let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "alg": "RS256",
            "typ": "JWT"
        }))?);
        let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
        let unsigned = format!("{header}.{payload}");

        let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
        let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

        let resp = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    async fn token_from_metadata_server(&self) -> Result<TokenResponse, anyhow::Error> {
        let resp = self
            .client
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    fn bucket_url(&self, bucket: &str) -> Result<Url, ClientError> {
        build_url(JSON_API, ["b", bucket])
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url, ClientError> {
        build_url(JSON_API, ["b", bucket, "o", key])
    }

}

#[async_trait]
impl StorageClient for GcsClient {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ClientError> {
        let token = self.token().await?;

        let resp = self
            .client
            .get(self.bucket_url(bucket)?)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)?;

        match check(resp, "bucket lookup").await {
            Ok(_) => Ok(true),
            Err(ClientError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), ClientError> {
        let token = self.token().await?;
        let project = self.project.as_deref().ok_or_else(|| {
            ClientError::Backend("GCS project is required to create buckets".to_string())
        })?;

        let mut url = build_url(JSON_API, ["b"])?;
        url.query_pairs_mut().append_pair("project", project);

        let resp = self
            .client
            .post(url)
            .bearer_auth(&token)
            .json(&serde_json::json!({
                "name": bucket,
                "location": region,
            }))
            .send()
            .await
            .map_err(transport_error)?;

        if resp.status() == StatusCode::CONFLICT {
            return Err(ClientError::AlreadyExists(format!("bucket {bucket}")));
        }
        check(resp, "bucket creation").await?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), ClientError> {
        let token = self.token().await?;

        let resp = self
            .client
            .delete(self.bucket_url(bucket)?)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)?;

        check(resp, "bucket deletion").await?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str) -> Result<Vec<String>, ClientError> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.token().await?;
            let mut url = build_url(JSON_API, ["b", bucket, "o"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("fields", "items(name),nextPageToken");
                if let Some(ref page) = page_token {
                    query.append_pair("pageToken", page);
                }
            }

            let resp = self
                .client
                .get(url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(transport_error)?;

            let page: ObjectList = check(resp, "object listing")
                .await?
                .json()
                .await
                .map_err(transport_error)?;

            keys.extend(page.items.into_iter().map(|item| item.name));
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectReader, ClientError> {
        let token = self.token().await?;
        let mut url = self.object_url(bucket, key)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let resp = self
            .client
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)?;

        let stream = Box::pin(
            check(resp, "download")
                .await?
                .bytes_stream()
                .map_err(std::io::Error::other),
        );

        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        let token = self.token().await?;

        let resp = self
            .client
            .delete(self.object_url(bucket, key)?)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)?;

        check(resp, "delete").await?;
        Ok(())
    }

    async fn initiate_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<String, ClientError> {
        let token = self.token().await?;
        let mut url = multipart_url(bucket, key)?;
        url.set_query(Some("uploads"));

        let resp = self
            .client
            .post(url)
            .bearer_auth(&token)
            .header(header::CONTENT_LENGTH, "0")
            .send()
            .await
            .map_err(transport_error)?;

        let body = check(resp, "multipart initiation")
            .await?
            .text()
            .await
            .map_err(transport_error)?;

        xml_element(&body, "UploadId")
            .map(|id| id.to_string())
            .ok_or_else(|| {
                ClientError::Backend(format!("GCS multipart initiation returned no UploadId: {body}"))
            })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, ClientError> {
        let token = self.token().await?;
        let mut url = multipart_url(bucket, key)?;
        url.query_pairs_mut()
            .append_pair("partNumber", &part_number.to_string())
            .append_pair("uploadId", upload_id);

        let resp = self
            .client
            .put(url)
            .bearer_auth(&token)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(transport_error)?;

        let resp = check(resp, "part upload").await?;
        resp.headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| {
                ClientError::Backend(format!("GCS part {part_number} upload returned no ETag"))
            })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), ClientError> {
        let token = self.token().await?;
        let mut url = multipart_url(bucket, key)?;
        url.query_pairs_mut().append_pair("uploadId", upload_id);

        let resp = self
            .client
            .post(url)
            .bearer_auth(&token)
            .header(header::CONTENT_TYPE, "application/xml")
            .body(complete_body(parts))
            .send()
            .await
            .map_err(transport_error)?;

        let body = check(resp, "multipart completion")
            .await?
            .text()
            .await
            .map_err(transport_error)?;

        // Completion can fail after the 200 status line has been sent
        if body.contains("<Error>") {
            return Err(ClientError::Backend(format!(
                "GCS multipart completion failed: {body}"
            )));
        }
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ClientError> {
        let token = self.token().await?;
        let mut url = multipart_url(bucket, key)?;
        url.query_pairs_mut().append_pair("uploadId", upload_id);

        let resp = self
            .client
            .delete(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)?;

        check(resp, "multipart abort").await?;
        Ok(())
    }
}

/// Pass successful responses through; turn the rest into a [`ClientError`].
async fn check(resp: Response, operation: &str) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(format!("GCS {operation}: {body}")));
    }
    Err(ClientError::Backend(format!(
        "GCS {operation} failed ({status}): {body}"
    )))
}

fn transport_error(e: reqwest::Error) -> ClientError {
    ClientError::Backend(e.to_string())
}

/// `base` followed by `segments`, each percent-encoded as a single segment.
fn build_url<'a, I>(base: &str, segments: I) -> Result<Url, ClientError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut url =
        Url::parse(base).map_err(|e| ClientError::Backend(format!("invalid URL {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| ClientError::Backend(format!("URL {base} cannot have a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// XML API object URL; each key segment becomes a path segment.
///
/// URL normalization would resolve `.` and `..` segments (encoded or not)
/// into a different key, so those are refused.
fn multipart_url(bucket: &str, key: &str) -> Result<Url, ClientError> {
    if key.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(ClientError::InvalidKey(format!(
            "'{key}' has dot segments the XML API cannot address"
        )));
    }
    build_url(XML_API, std::iter::once(bucket).chain(key.split('/')))
}

/// Text of the first `<tag>` element in `body`.
fn xml_element<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = start + body[start..].find(&close)?;
    Some(&body[start..end])
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn complete_body(parts: &[CompletedPart]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            xml_escape(&part.tag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    // Strip PEM headers and decode base64
    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, der_b64.trim())?;

    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign: {e}"))?;

    Ok(signature)
}
