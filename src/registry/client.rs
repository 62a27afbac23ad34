//! Registry-v2 protocol client (§4.8): blob existence, monolithic/chunked
//! upload, manifest push/pull, and challenge-response bearer auth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, StatusCode};
use tokio::sync::{Mutex, Semaphore};

use crate::auth::{AuthChain, AuthCredential};
use crate::config::BuildPlan;
use crate::digest::HashingWriter;
use crate::error::{BuildError, Result};
use crate::oci::Digest;
use crate::output::OutputManager;
use crate::registry::auth_challenge::{self, Challenge};
use crate::retry;

pub const DEFAULT_CONCURRENCY: usize = 4;
const CHUNK_SIZE: usize = 5 * 1024 * 1024;
const MONOLITHIC_THRESHOLD: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const BODY_TIMEOUT: Duration = Duration::from_secs(300);

fn is_local_host(host: &str) -> bool {
    host == "localhost" || host.starts_with("localhost:") || host.starts_with("127.0.0.1")
}

pub struct RegistryClient {
    http: reqwest::Client,
    scheme: &'static str,
    host: String,
    plan: BuildPlan,
    output: OutputManager,
    bearer_tokens: Mutex<HashMap<String, String>>,
    upload_semaphore: Arc<Semaphore>,
    download_semaphore: Arc<Semaphore>,
}

fn repo_scope(repo: &str, actions: &str) -> String {
    format!("repository:{repo}:{actions}")
}

impl RegistryClient {
    pub fn new(host: &str, plan: &BuildPlan, output: &OutputManager) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(BODY_TIMEOUT)
            .build()?;
        let scheme = if is_local_host(host) { "http" } else { "https" };
        Ok(Self {
            http,
            scheme,
            host: host.to_string(),
            plan: plan.clone(),
            output: output.clone(),
            bearer_tokens: Mutex::new(HashMap::new()),
            upload_semaphore: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            download_semaphore: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.host, path)
    }

    async fn cached_token(&self, scope: &str) -> Option<String> {
        self.bearer_tokens.lock().await.get(scope).cloned()
    }

    async fn cache_token(&self, scope: &str, token: String) {
        self.bearer_tokens.lock().await.insert(scope.to_string(), token);
    }

    /// Perform the token exchange for `challenge`, caching the result under
    /// `scope`. At most one exchange happens per call; the caller is
    /// responsible for not looping (§8 invariant 8).
    async fn exchange_token(&self, challenge: &Challenge, scope: &str) -> Result<()> {
        let credential = AuthChain::new(&self.plan, &self.output).resolve(&self.host).await;
        let auth_scope = challenge.scope.as_deref().unwrap_or(scope);
        let mut request = self
            .http
            .get(&challenge.realm)
            .query(&[("service", challenge.service.as_str()), ("scope", auth_scope)]);

        if let Some(AuthCredential::Basic { user, secret }) = &credential {
            request = request.basic_auth(user, Some(secret));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BuildError::AuthFailure(self.host.clone()));
        }
        let token_response: auth_challenge::TokenResponse = response.json().await?;
        let token = token_response
            .into_token()
            .ok_or_else(|| BuildError::AuthFailure(self.host.clone()))?;
        self.cache_token(scope, token).await;
        Ok(())
    }

    /// Send a request (rebuilt fresh on every attempt, since a
    /// `RequestBuilder` is consumed by `send`), retrying 5xx with backoff
    /// and performing at most one challenge-response auth upgrade.
    async fn dispatch(
        &self,
        mut build: impl FnMut() -> reqwest::RequestBuilder,
        scope: &str,
        endpoint: &str,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;
        let mut did_auth_retry = false;
        loop {
            let mut request = build();
            if let Some(token) = self.cached_token(scope).await {
                request = request.bearer_auth(token);
            }

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt + 1 < retry::MAX_ATTEMPTS {
                        tokio::time::sleep(retry::backoff_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(e.into());
                }
            };

            let status = response.status();
            if status.is_server_error() && attempt + 1 < retry::MAX_ATTEMPTS {
                self.output
                    .verbose_msg(&format!("{endpoint} returned {status}; retrying"));
                tokio::time::sleep(retry::backoff_delay(attempt)).await;
                attempt += 1;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED && !did_auth_retry {
                if let Some(header_value) = response.headers().get(header::WWW_AUTHENTICATE) {
                    let header_str = header_value.to_str().unwrap_or_default().to_string();
                    let challenge = auth_challenge::parse(&header_str)?;
                    self.exchange_token(&challenge, scope).await?;
                    did_auth_retry = true;
                    continue;
                }
            }
            if status == StatusCode::UNAUTHORIZED {
                return Err(BuildError::AuthFailure(self.host.clone()));
            }

            return Ok(response);
        }
    }

    pub async fn exists_blob(&self, repo: &str, digest: &Digest) -> Result<bool> {
        let endpoint = format!("/v2/{repo}/blobs/{digest}");
        let url = self.url(&endpoint);
        let scope = repo_scope(repo, "pull");
        let response = self
            .dispatch(|| self.http.head(&url), &scope, &endpoint)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(BuildError::RegistryHttpError { status: status.as_u16(), endpoint }),
        }
    }

    pub async fn exists_manifest(&self, repo: &str, reference: &str) -> Result<bool> {
        let endpoint = format!("/v2/{repo}/manifests/{reference}");
        let url = self.url(&endpoint);
        let scope = repo_scope(repo, "pull");
        let accept = crate::oci::MEDIA_TYPE_MANIFEST;
        let response = self
            .dispatch(|| self.http.head(&url).header(header::ACCEPT, accept), &scope, &endpoint)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(BuildError::RegistryHttpError { status: status.as_u16(), endpoint }),
        }
    }

    pub async fn put_blob(&self, repo: &str, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let _permit = self.upload_semaphore.acquire().await;
        if self.exists_blob(repo, digest).await? {
            return Ok(());
        }

        let scope = repo_scope(repo, "pull,push");
        if bytes.len() <= MONOLITHIC_THRESHOLD {
            match self.try_monolithic_upload(repo, digest, bytes, &scope).await {
                Ok(()) => return Ok(()),
                Err(BuildError::RegistryHttpError { status: 413, .. }) => {
                    self.output.verbose_msg("monolithic upload too large; falling back to chunked");
                }
                Err(e) => return Err(e),
            }
        }
        self.chunked_upload(repo, digest, bytes, &scope).await
    }

    async fn start_upload_session(&self, repo: &str, scope: &str) -> Result<String> {
        let endpoint = format!("/v2/{repo}/blobs/uploads/");
        let url = self.url(&endpoint);
        let response = self.dispatch(|| self.http.post(&url), scope, &endpoint).await?;
        if response.status() != StatusCode::ACCEPTED && response.status() != StatusCode::CREATED {
            return Err(BuildError::RegistryHttpError {
                status: response.status().as_u16(),
                endpoint,
            });
        }
        location_of(&response, &endpoint)
    }

    async fn try_monolithic_upload(&self, repo: &str, digest: &Digest, bytes: &[u8], scope: &str) -> Result<()> {
        let upload_url = self.start_upload_session(repo, scope).await?;
        let final_url = with_digest_query(&upload_url, digest);
        let endpoint = format!("/v2/{repo}/blobs/uploads/ (monolithic PUT)");
        let body = bytes.to_vec();
        let response = self
            .dispatch(
                || {
                    self.http
                        .put(&final_url)
                        .header(header::CONTENT_TYPE, "application/octet-stream")
                        .body(body.clone())
                },
                scope,
                &endpoint,
            )
            .await?;
        self.verify_upload_response(response, digest, &endpoint).await
    }

    async fn chunked_upload(&self, repo: &str, digest: &Digest, bytes: &[u8], scope: &str) -> Result<()> {
        let mut location = self.start_upload_session(repo, scope).await?;
        let mut start: usize = 0;

        while start < bytes.len() {
            let end = (start + CHUNK_SIZE).min(bytes.len());
            let chunk = bytes[start..end].to_vec();
            let endpoint = format!("/v2/{repo}/blobs/uploads/ (PATCH {start}-{end})");
            let content_range = format!("{start}-{}", end.saturating_sub(1));
            let url = location.clone();
            let chunk_for_request = chunk.clone();
            let response = self
                .dispatch(
                    || {
                        self.http
                            .patch(&url)
                            .header(header::CONTENT_TYPE, "application/octet-stream")
                            .header(header::CONTENT_RANGE, content_range.clone())
                            .body(chunk_for_request.clone())
                    },
                    scope,
                    &endpoint,
                )
                .await?;

            match response.status() {
                StatusCode::ACCEPTED => {
                    location = location_of(&response, &endpoint)?;
                    start = end;
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    let next_start = response
                        .headers()
                        .get(header::RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.rsplit('-').next())
                        .and_then(|v| v.parse::<usize>().ok())
                        .map(|end| end + 1)
                        .unwrap_or(start);
                    location = location_of(&response, &endpoint)?;
                    start = next_start;
                }
                status => {
                    return Err(BuildError::RegistryHttpError { status: status.as_u16(), endpoint });
                }
            }
        }

        let final_url = with_digest_query(&location, digest);
        let endpoint = format!("/v2/{repo}/blobs/uploads/ (final PUT)");
        let response = self
            .dispatch(|| self.http.put(&final_url).header(header::CONTENT_LENGTH, "0"), scope, &endpoint)
            .await?;
        self.verify_upload_response(response, digest, &endpoint).await
    }

    async fn verify_upload_response(&self, response: reqwest::Response, digest: &Digest, endpoint: &str) -> Result<()> {
        if response.status() != StatusCode::CREATED {
            return Err(BuildError::RegistryHttpError {
                status: response.status().as_u16(),
                endpoint: endpoint.to_string(),
            });
        }
        if let Some(returned) = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
        {
            let returned = Digest::parse(returned)?;
            if &returned != digest {
                return Err(BuildError::DigestMismatch {
                    expected: digest.clone(),
                    actual: returned,
                });
            }
        }
        Ok(())
    }

    pub async fn put_manifest(&self, repo: &str, reference: &str, bytes: &[u8], media_type: &str) -> Result<Digest> {
        let endpoint = format!("/v2/{repo}/manifests/{reference}");
        let url = self.url(&endpoint);
        let scope = repo_scope(repo, "pull,push");
        let media_type = media_type.to_string();
        let body = bytes.to_vec();
        let response = self
            .dispatch(
                || {
                    self.http
                        .put(&url)
                        .header(header::CONTENT_TYPE, media_type.clone())
                        .body(body.clone())
                },
                &scope,
                &endpoint,
            )
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(BuildError::RegistryHttpError {
                status: response.status().as_u16(),
                endpoint,
            });
        }
        let local_digest = crate::digest::digest_bytes(bytes);
        if let Some(returned) = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
        {
            let returned = Digest::parse(returned)?;
            if returned != local_digest {
                return Err(BuildError::DigestMismatch { expected: local_digest, actual: returned });
            }
        }
        Ok(local_digest)
    }

    pub async fn get_manifest(&self, repo: &str, reference: &str, accept: &[&str]) -> Result<(Vec<u8>, String, Digest)> {
        let endpoint = format!("/v2/{repo}/manifests/{reference}");
        let url = self.url(&endpoint);
        let scope = repo_scope(repo, "pull");
        let accept_header = accept.join(", ");
        let response = self
            .dispatch(
                || self.http.get(&url).header(header::ACCEPT, accept_header.clone()),
                &scope,
                &endpoint,
            )
            .await?;
        if !response.status().is_success() {
            return Err(BuildError::RegistryHttpError {
                status: response.status().as_u16(),
                endpoint,
            });
        }
        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(crate::oci::MEDIA_TYPE_MANIFEST)
            .to_string();
        let bytes = response.bytes().await?.to_vec();
        let digest = crate::digest::digest_bytes(&bytes);
        Ok((bytes, media_type, digest))
    }

    pub async fn get_blob(&self, repo: &str, digest: &Digest) -> Result<Vec<u8>> {
        let _permit = self.download_semaphore.acquire().await;
        let endpoint = format!("/v2/{repo}/blobs/{digest}");
        let url = self.url(&endpoint);
        let scope = repo_scope(repo, "pull");
        let response = self.dispatch(|| self.http.get(&url), &scope, &endpoint).await?;
        if !response.status().is_success() {
            return Err(BuildError::RegistryHttpError {
                status: response.status().as_u16(),
                endpoint,
            });
        }

        let mut hashing = HashingWriter::new(Vec::new());
        let mut stream = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            std::io::Write::write_all(&mut hashing, &chunk[..]).map_err(|e| crate::error::io_err(&endpoint, e))?;
        }
        let (bytes, actual) = hashing.finish();
        if &actual != digest {
            return Err(BuildError::DigestMismatch { expected: digest.clone(), actual });
        }
        Ok(bytes)
    }
}

fn location_of(response: &reqwest::Response, endpoint: &str) -> Result<String> {
    let raw = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| BuildError::RegistryHttpError { status: response.status().as_u16(), endpoint: endpoint.to_string() })?;
    let resolved = response
        .url()
        .join(raw)
        .map_err(|e| BuildError::InvalidConfig(format!("invalid upload location: {e}")))?;
    Ok(resolved.to_string())
}

fn with_digest_query(url: &str, digest: &Digest) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}digest={}", digest.canonical())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_digest_query_appends_correctly() {
        let digest = Digest::new("a".repeat(64));
        assert_eq!(
            with_digest_query("https://reg/v2/x/blobs/uploads/1?x=1", &digest),
            format!("https://reg/v2/x/blobs/uploads/1?x=1&digest=sha256:{}", "a".repeat(64))
        );
        assert_eq!(
            with_digest_query("https://reg/v2/x/blobs/uploads/1", &digest),
            format!("https://reg/v2/x/blobs/uploads/1?digest=sha256:{}", "a".repeat(64))
        );
    }

    #[test]
    fn repo_scope_formats_correctly() {
        assert_eq!(repo_scope("demo", "pull,push"), "repository:demo:pull,push");
    }

    #[test]
    fn local_host_uses_plaintext_http() {
        assert!(is_local_host("localhost:5000"));
        assert!(is_local_host("127.0.0.1:5000"));
        assert!(!is_local_host("ghcr.io"));
    }
}
