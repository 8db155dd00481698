//! The drive client and its configuration.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use secrecy::SecretString;
use tracing::{debug, instrument};
use url::Url;

use crate::auth::TokenCache;
use crate::error::DriveError;
use crate::http_client::{HttpClient, HttpRequest, HttpResponse};
use crate::models::{FileInfo, FolderRequest, ListResponse};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for one drive directory.
#[derive(Debug)]
pub struct ClientConfig {
    /// Base URL of the drive API, e.g. `https://drive.example.com`.
    pub base_url: String,
    /// OAuth client identifier.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: SecretString,
    /// Identifier of the remote directory tree to operate on.
    pub directory_id: String,
}

/// Builder for [`DriveClient`].
#[derive(Debug)]
pub struct ClientBuilder {
    config: ClientConfig,
    timeout: Duration,
}

impl ClientBuilder {
    /// Start from a configuration with the default timeout.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build a client on top of a caller-provided transport.
    ///
    /// The timeout set on this builder only applies to the bundled backends; a custom transport is
    /// expected to enforce its own.
    pub fn build_with<C: HttpClient>(self, http: C) -> Result<DriveClient<C>, DriveError> {
        let parsed = Url::parse(&self.config.base_url).map_err(|_| DriveError::InvalidBaseUrl {
            url: self.config.base_url.clone(),
        })?;
        if parsed.cannot_be_a_base() {
            return Err(DriveError::InvalidBaseUrl {
                url: self.config.base_url.clone(),
            });
        }

        let base = self.config.base_url.trim_end_matches('/').to_owned();
        Ok(DriveClient {
            http,
            base,
            config: self.config,
            tokens: TokenCache::new(),
        })
    }

    /// Build a client on the reqwest backend.
    #[cfg(feature = "reqwest-client")]
    pub fn build(self) -> Result<Drive, DriveError> {
        let http = crate::ReqwestClient::new(self.timeout);
        self.build_with(http)
    }
}

/// A [`DriveClient`] on the default reqwest backend.
#[cfg(feature = "reqwest-client")]
pub type Drive = DriveClient<crate::ReqwestClient>;

/// Client for a single drive directory.
///
/// Each call is one HTTP round trip (plus a token request when the cached token has expired).
/// Nothing is retried.
pub struct DriveClient<C: HttpClient> {
    http: C,
    base: String,
    config: ClientConfig,
    tokens: TokenCache,
}

impl<C: HttpClient> std::fmt::Debug for DriveClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveClient")
            .field("base", &self.base)
            .field("directory_id", &self.config.directory_id)
            .finish_non_exhaustive()
    }
}

impl<C: HttpClient> DriveClient<C> {
    /// List the direct children of `dir`.
    #[instrument(name = "DriveClient::list", skip(self))]
    pub async fn list(&self, dir: &str) -> Result<Vec<FileInfo>, DriveError> {
        let mut url = self.files_url();
        if !dir.is_empty() && dir != "/" {
            url.push_str("?path=");
            url.push_str(&escape(dir));
        }

        let response = self
            .execute(HttpRequest::new(Method::GET, url), dir, &[StatusCode::OK])
            .await?;
        let listing: ListResponse = serde_json::from_slice(&response.body)?;
        debug!(entries = listing.files.len(), "listed directory");
        Ok(listing.files)
    }

    /// Download the whole object at `path`.
    #[instrument(name = "DriveClient::read", skip(self))]
    pub async fn read(&self, path: &str) -> Result<Bytes, DriveError> {
        let url = self.content_url(path);
        let response = self
            .execute(HttpRequest::new(Method::GET, url), path, &[StatusCode::OK])
            .await?;
        Ok(response.body)
    }

    /// Replace the object at `path` with `data`, creating it if needed.
    #[instrument(name = "DriveClient::write", skip(self, data), fields(len = data.len()))]
    pub async fn write(&self, path: &str, data: Bytes) -> Result<(), DriveError> {
        let url = self.content_url(path);
        let request =
            HttpRequest::new(Method::PUT, url).body("application/octet-stream", data);
        self.execute(request, path, &[StatusCode::OK, StatusCode::CREATED])
            .await?;
        Ok(())
    }

    /// Delete the object or folder at `path`.
    #[instrument(name = "DriveClient::delete", skip(self))]
    pub async fn delete(&self, path: &str) -> Result<(), DriveError> {
        let url = format!("{}/{}", self.files_url(), escape(path));
        self.execute(
            HttpRequest::new(Method::DELETE, url),
            path,
            &[StatusCode::OK, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(())
    }

    /// Create a folder at `path`.
    #[instrument(name = "DriveClient::make_directory", skip(self))]
    pub async fn make_directory(&self, path: &str) -> Result<(), DriveError> {
        let url = format!(
            "{}/api/v1/directories/{}/folders",
            self.base, self.config.directory_id
        );
        let body = serde_json::to_vec(&FolderRequest { path })?;
        let request = HttpRequest::new(Method::POST, url).body("application/json", body.into());
        self.execute(request, path, &[StatusCode::OK, StatusCode::CREATED])
            .await?;
        Ok(())
    }

    fn files_url(&self) -> String {
        format!(
            "{}/api/v1/directories/{}/files",
            self.base, self.config.directory_id
        )
    }

    fn content_url(&self, path: &str) -> String {
        format!("{}/{}/content", self.files_url(), escape(path))
    }

    /// Authorize and send `request`, turning any status outside `accepted` into an error.
    async fn execute(
        &self,
        request: HttpRequest,
        path: &str,
        accepted: &[StatusCode],
    ) -> Result<HttpResponse, DriveError> {
        let token_url = format!("{}/oauth/token", self.base);
        let bearer = self
            .tokens
            .bearer(&self.http, &token_url, &self.config)
            .await?;

        let response = self.http.send(request.bearer(&bearer)).await?;
        if accepted.contains(&response.status) {
            return Ok(response);
        }

        match response.status {
            StatusCode::NOT_FOUND => Err(DriveError::NotFound {
                path: path.to_owned(),
            }),
            status => {
                if status == StatusCode::UNAUTHORIZED {
                    self.tokens.invalidate().await;
                }
                Err(DriveError::Status {
                    status,
                    body: String::from_utf8_lossy(&response.body).into_owned(),
                })
            }
        }
    }
}

/// Escape a drive path for use as a single URL component.
fn escape(path: &str) -> String {
    url::form_urlencoded::byte_serialize(path.as_bytes()).collect()
}
