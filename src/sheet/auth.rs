// Service account login for the spreadsheet API
//
// Implements the OAuth 2.0 JWT bearer grant: a self-signed RS256 assertion
// is exchanged at the key's token endpoint for a short-lived access token.
// Tokens are cached and refreshed shortly before they expire.

use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use ring::signature::RsaKeyPair;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{truncate_body, SheetError};

/// Read/write access to spreadsheets
const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Assertion lifetime; the token endpoint caps this at one hour
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Refresh this long before the cached token expires
const REFRESH_MARGIN_SECS: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The parts of a service account JSON key this program needs
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Serialize)]
struct JwtHeader {
    alg: &'static str,
    typ: &'static str,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl ServiceAccountKey {
    /// Loads a key file downloaded from the cloud console
    pub fn load(path: &Path) -> Result<Self, SheetError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SheetError::Credentials(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, SheetError> {
        serde_json::from_str(raw).map_err(|e| SheetError::Credentials(e.to_string()))
    }

    /// `<header>.<claims>` part of the assertion, base64url encoded
    fn signing_input(&self, now: DateTime<Utc>) -> Result<String, SheetError> {
        let header = JwtHeader {
            alg: "RS256",
            typ: "JWT",
        };
        let claims = JwtClaims {
            iss: &self.client_email,
            scope: SPREADSHEETS_SCOPE,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };

        let header_b64 = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let claims_b64 = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        Ok(format!("{}.{}", header_b64, claims_b64))
    }

    fn key_pair(&self) -> Result<RsaKeyPair, SheetError> {
        let mut reader = std::io::Cursor::new(self.private_key.as_bytes());
        let item = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| SheetError::Credentials(format!("invalid PEM private key: {}", e)))?;

        match item {
            Some(rustls_pemfile::Item::Pkcs8Key(der)) => {
                RsaKeyPair::from_pkcs8(der.secret_pkcs8_der())
                    .map_err(|e| SheetError::Credentials(format!("rejected pkcs8 key: {}", e)))
            }
            Some(rustls_pemfile::Item::Pkcs1Key(der)) => {
                RsaKeyPair::from_der(der.secret_pkcs1_der())
                    .map_err(|e| SheetError::Credentials(format!("rejected pkcs1 key: {}", e)))
            }
            _ => Err(SheetError::Credentials("no RSA private key in key file".to_string())),
        }
    }

    /// Builds a signed RS256 assertion valid from `now`
    pub fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, SheetError> {
        let signing_input = self.signing_input(now)?;
        let key_pair = self.key_pair()?;

        let mut signature = vec![0; key_pair.public().modulus_len()];
        key_pair
            .sign(
                &ring::signature::RSA_PKCS1_SHA256,
                &ring::rand::SystemRandom::new(),
                signing_input.as_bytes(),
                &mut signature,
            )
            .map_err(|_| SheetError::Credentials("failed to sign assertion".to_string()))?;

        Ok(format!(
            "{}.{}",
            signing_input,
            BASE64_URL_SAFE_NO_PAD.encode(&signature)
        ))
    }
}

/// Classifies a non-2xx answer from the token endpoint
///
/// OAuth reports a rejected assertion (`invalid_grant`, `invalid_client`)
/// as 400 or 401. Only those mean the credentials are bad; anything else is
/// an ordinary request failure and the next attempt may succeed.
fn token_error(status: StatusCode, body: String) -> SheetError {
    let body = truncate_body(body);
    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
        SheetError::Auth(format!("{}: {}", status, body))
    } else {
        SheetError::Status { status, body }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(REFRESH_MARGIN_SECS) < self.expires_at
    }
}

/// Hands out access tokens, fetching a new one only when needed
pub struct TokenProvider {
    key: ServiceAccountKey,
    client: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(key: ServiceAccountKey, client: Client) -> Self {
        TokenProvider {
            key,
            client,
            cached: Mutex::new(None),
        }
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    /// Returns a valid access token
    ///
    /// # Errors
    /// * `SheetError::Transport` - the token endpoint could not be reached
    /// * `SheetError::Auth` - the token endpoint refused the assertion (400/401)
    /// * `SheetError::Status` - any other non-2xx answer, e.g. a 503 during an outage
    /// * `SheetError::Credentials` - the key cannot sign
    pub async fn access_token(&self) -> Result<String, SheetError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();

        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh(now)) {
            return Ok(token.value.clone());
        }

        debug!("Requesting access token for {}", self.key.client_email);
        let assertion = self.key.signed_assertion(now)?;
        let params = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", assertion.as_str()),
        ];

        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(token_error(status, body));
        }

        let token: TokenResponse = serde_json::from_str(&body)?;
        let fresh = CachedToken {
            value: token.access_token,
            expires_at: now + Duration::seconds(token.expires_in),
        };

        info!(
            "Obtained spreadsheet access token, valid until {}",
            fresh.expires_at.format("%H:%M:%S")
        );

        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}
