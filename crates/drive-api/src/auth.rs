//! OAuth client-credentials token cache.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Method, StatusCode};
use secrecy::{ExposeSecret as _, SecretString};
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::ClientConfig;
use crate::error::DriveError;
use crate::http_client::{HttpClient, HttpRequest};
use crate::models::{TokenRequest, TokenResponse};

/// Tokens are treated as expired this long before the server says they are.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

struct CachedToken {
    value: SecretString,
    expires_at: Instant,
}

/// Holds at most one access token; concurrent callers share a single refresh.
pub(crate) struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Return a valid bearer token, fetching a new one when the cached token is missing or stale.
    pub(crate) async fn bearer<C: HttpClient>(
        &self,
        http: &C,
        token_url: &str,
        config: &ClientConfig,
    ) -> Result<String, DriveError> {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref()
            && Instant::now() < token.expires_at
        {
            return Ok(token.value.expose_secret().to_owned());
        }

        debug!(client_id = %config.client_id, "requesting access token");
        let fresh = fetch(http, token_url, config).await?;
        let bearer = fresh.value.expose_secret().to_owned();
        *slot = Some(fresh);
        Ok(bearer)
    }

    /// Forget the cached token so the next call authenticates again.
    pub(crate) async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

async fn fetch<C: HttpClient>(
    http: &C,
    token_url: &str,
    config: &ClientConfig,
) -> Result<CachedToken, DriveError> {
    let payload = serde_json::to_vec(&TokenRequest {
        client_id: &config.client_id,
        client_secret: config.client_secret.expose_secret(),
        grant_type: "client_credentials",
    })?;
    let request =
        HttpRequest::new(Method::POST, token_url).body("application/json", Bytes::from(payload));

    let response = http.send(request).await?;
    if response.status != StatusCode::OK {
        return Err(DriveError::Auth {
            status: response.status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        });
    }

    let token: TokenResponse = serde_json::from_slice(&response.body)?;
    let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
    Ok(CachedToken {
        value: SecretString::from(token.access_token),
        expires_at: Instant::now() + lifetime,
    })
}
