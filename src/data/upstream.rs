//! Upstream statistics API client
//!
//! Fetches raw JSON payloads from the disease.sh-compatible API and
//! classifies every failure into a `FetchError`. The client never caches and
//! never retries; both concerns belong to the orchestrator.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use super::Query;
use crate::error::FetchError;

/// Default base URL for the statistics API
pub const DEFAULT_BASE_URL: &str = "https://disease.sh/v3/covid-19";

/// A source of raw payloads for cache queries
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Fetch the current payload for `query`
    async fn fetch(&self, query: &Query) -> Result<Value, FetchError>;
}

/// Client for the statistics API over HTTP
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpUpstream {
    /// Create a new client rooted at `base_url`
    ///
    /// `timeout` bounds each whole request, connect through body.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("statcache/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Builds the request URL for a query
    ///
    /// Country names are pushed as path segments so spaces and other
    /// reserved characters are percent-encoded.
    pub fn endpoint(&self, query: &Query) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                FetchError::Unreachable(format!("base URL cannot be a base: {}", self.base_url))
            })?;
            segments.pop_if_empty();
            match query {
                Query::Global => {
                    segments.push("all");
                }
                Query::AllCountries => {
                    segments.push("countries");
                }
                Query::History { country, .. } => {
                    segments.extend(["historical", country.trim()]);
                }
                Query::Vaccination { country, .. } => {
                    segments.extend(["vaccine", "coverage", "countries", country.trim()]);
                }
            }
        }
        if let Query::History { lookback, .. } | Query::Vaccination { lookback, .. } = query {
            url.query_pairs_mut()
                .append_pair("lastdays", &lookback.to_string());
        }
        Ok(url)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, query: &Query) -> Result<Value, FetchError> {
        let url = self.endpoint(query)?;
        debug!(%url, "fetching upstream");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(query, status));
        }

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Unreachable(e.to_string())
            }
        })?;

        parse_body(query, &text)
    }
}

/// Maps a non-success status to a fetch error
///
/// A 404 on a per-country resource means upstream does not know the
/// country; on a zero-key resource it is just a bad status.
fn classify_status(query: &Query, status: StatusCode) -> FetchError {
    match (status, query.country()) {
        (StatusCode::NOT_FOUND, Some(country)) => FetchError::NotFound(format!(
            "Country '{}' not found or has no {} data",
            country,
            query.category().label().to_lowercase()
        )),
        _ => FetchError::BadStatus(status.as_u16()),
    }
}

/// Parses a response body and checks it has the shape the category expects
fn parse_body(query: &Query, text: &str) -> Result<Value, FetchError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FetchError::MalformedPayload(e.to_string()))?;

    let shape_ok = match query {
        Query::AllCountries => value.is_array(),
        _ => value.is_object(),
    };
    if !shape_ok {
        return Err(FetchError::MalformedPayload(format!(
            "unexpected JSON shape for {}",
            query.category()
        )));
    }

    // The API reports some errors as 200 with only a message body
    if let Some(message) = value.get("message").and_then(Value::as_str) {
        if value.as_object().is_some_and(|obj| obj.len() == 1) {
            return Err(match query.country() {
                Some(_) => FetchError::NotFound(message.to_string()),
                None => FetchError::MalformedPayload(message.to_string()),
            });
        }
    }

    Ok(value)
}
