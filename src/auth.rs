use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Config;

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";
pub const SCOPES: &str =
    "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/pubsub";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("could not read keyfile {}", path.display()))?;
        let key: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("could not parse keyfile {}", path.display()))?;

        match key.kind.as_deref() {
            None | Some("service_account") => Ok(key),
            Some(other) => bail!(
                "keyfile {} holds `{}` credentials, expected a service account",
                path.display(),
                other
            ),
        }
    }

    fn assertion(&self, now: i64) -> Result<String> {
        let claims = Claims {
            iss: &self.client_email,
            scope: SCOPES,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let signing_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("invalid service account private key")?;

        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &signing_key,
        )?)
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Where bearer tokens come from, in order of precedence: an explicit keyfile,
/// the emulator (no authentication), then ambient credentials.
#[derive(Clone, Debug, PartialEq)]
pub enum Credentials {
    ServiceAccount(ServiceAccountKey),
    Emulator { host: String },
    Metadata,
}

impl Credentials {
    pub fn resolve(config: &Config) -> Result<Self> {
        if let Some(path) = config.keyfile() {
            return Ok(Self::ServiceAccount(ServiceAccountKey::from_file(path)?));
        }
        if let Some(host) = config.emulator_host() {
            return Ok(Self::Emulator {
                host: host.to_owned(),
            });
        }
        if let Some(path) = config.application_credentials() {
            return Ok(Self::ServiceAccount(ServiceAccountKey::from_file(path)?));
        }
        Ok(Self::Metadata)
    }

    pub fn endpoint(&self) -> String {
        match self {
            Self::Emulator { host } => format!("http://{}", host.trim_end_matches('/')),
            _ => DEFAULT_ENDPOINT.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

fn default_token_lifetime() -> u64 {
    DEFAULT_TOKEN_LIFETIME_SECS
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }
}

/// Hands out bearer tokens, refreshing them shortly before they expire.
pub struct TokenSource {
    credentials: Credentials,
    http: reqwest::Client,
    cached: Mutex<Option<AccessToken>>,
}

impl TokenSource {
    pub fn new(credentials: Credentials, http: reqwest::Client) -> Self {
        Self {
            credentials,
            http,
            cached: Mutex::new(None),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// `None` when requests go out unauthenticated.
    pub async fn token(&self) -> Result<Option<String>> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Instant::now())) {
            return Ok(Some(token.value.clone()));
        }

        let response = match &self.credentials {
            Credentials::Emulator { .. } => return Ok(None),
            Credentials::ServiceAccount(key) => self.exchange_assertion(key).await?,
            Credentials::Metadata => self.metadata_token().await?,
        };

        tracing::debug!(expires_in = response.expires_in, "refreshed access token");
        let token = AccessToken {
            value: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        };
        let value = token.value.clone();
        *cached = Some(token);

        Ok(Some(value))
    }

    async fn exchange_assertion(&self, key: &ServiceAccountKey) -> Result<TokenResponse> {
        let assertion = key.assertion(chrono::Utc::now().timestamp())?;

        let response = self
            .http
            .post(key.token_uri.as_str())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .context("token exchange failed")?
            .error_for_status()
            .context("token exchange rejected")?;

        Ok(response.json().await?)
    }

    async fn metadata_token(&self) -> Result<TokenResponse> {
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("no ambient credentials: metadata server unreachable")?
            .error_for_status()
            .context("metadata server refused to issue a token")?;

        Ok(response.json().await?)
    }
}
