// Metrics API client
//
// Issues one GET per metric against the metrics query endpoint. Every
// failure is reported as a `FetchError`; none of them are retried.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::{EntityScope, MetricSource};
use crate::config::TimeWindow;

/// Errors that can occur while fetching one metric
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request to metrics API failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Metrics API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Metrics API returned malformed JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors that can occur while building the client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid metrics API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("API token contains characters not allowed in a header")]
    InvalidToken,

    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Longest response body quoted in a `FetchError::Status`
const MAX_ERROR_BODY: usize = 512;

/// Builds the query parameters for one metric request
///
/// `entitySelector` is only present for entity-scoped metrics.
pub fn build_query(
    selector: &str,
    entity: &EntityScope,
    window: &TimeWindow,
) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("metricSelector", selector.to_string()),
        ("from", window.from.clone()),
        ("to", window.to.clone()),
    ];

    if let Some(entity_selector) = entity.selector() {
        params.push(("entitySelector", entity_selector));
    }

    params
}

/// Value for the `Authorization` header
///
/// A token that already carries a scheme (`Api-Token abc`, `Bearer abc`) is
/// sent as-is; a bare token is sent as a bearer token.
pub fn authorization_value(token: &str) -> String {
    let token = token.trim();
    if token.contains(char::is_whitespace) {
        token.to_string()
    } else {
        format!("Bearer {}", token)
    }
}

/// reqwest-backed `MetricSource`
pub struct ApiClient {
    client: Client,
    base_url: Url,
    window: TimeWindow,
}

impl ApiClient {
    /// Creates a client for the given endpoint
    ///
    /// # Arguments
    /// * `base_url` - full query endpoint, e.g. `https://host/api/v2/metrics/query`
    /// * `token` - API token (see `authorization_value`)
    /// * `window` - query window sent with every request
    /// * `timeout` - per-request timeout
    pub fn new(
        base_url: &str,
        token: &str,
        window: TimeWindow,
        timeout: std::time::Duration,
    ) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)?;

        let mut auth = HeaderValue::from_str(&authorization_value(token))
            .map_err(|_| ClientError::InvalidToken)?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json; charset=utf-8"));
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(ApiClient {
            client,
            base_url,
            window,
        })
    }
}

#[async_trait]
impl MetricSource for ApiClient {
    async fn fetch(&self, selector: &str, entity: &EntityScope) -> Result<Value, FetchError> {
        let params = build_query(selector, entity, &self.window);
        debug!("Querying metrics API: {} ({})", selector, entity);

        let response = self
            .client
            .get(self.base_url.clone())
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        let mut body = response.text().await?;

        if !status.is_success() {
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(FetchError::Status { status, body });
        }

        Ok(serde_json::from_str(&body)?)
    }
}
