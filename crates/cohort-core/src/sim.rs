//! Client for the external city-simulation service.
//!
//! [`SimService`] is the seam every component talks to; [`HttpSimClient`]
//! is the REST implementation and tests substitute in-memory fakes.

use crate::config::SimConfig;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

pub const USER_AGENT: &str = "IntentExperiment/1.0";

#[derive(Debug, Error)]
pub enum SimError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("rate limited by {url} after {attempts} attempts")]
    RateLimited { url: String, attempts: u32 },

    #[error("response from {url} has no {field}")]
    MissingField { url: String, field: &'static str },

    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Other(String),
}

/// Point-in-time state of one city. Unknown fields are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CityStats {
    #[serde(default)]
    pub population: Option<serde_json::Number>,
    #[serde(default)]
    pub score: Option<serde_json::Number>,
    #[serde(default)]
    pub funds: Option<serde_json::Number>,
    #[serde(default)]
    pub game_year: Option<serde_json::Number>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[async_trait]
pub trait SimService: Send + Sync {
    /// Provision a new API key.
    async fn provision_key(&self) -> Result<String, SimError>;

    /// Allocate a city under `key` and return its id.
    async fn create_city(&self, key: &str, seed: Option<u64>) -> Result<String, SimError>;

    /// Release a city, freeing its slot on the key.
    async fn retire_city(&self, key: &str, city_id: &str) -> Result<(), SimError>;

    async fn city_stats(&self, key: &str, city_id: &str) -> Result<CityStats, SimError>;

    /// Advance a city's simulated clock.
    async fn advance(&self, key: &str, city_id: &str, months: u32) -> Result<(), SimError>;
}

// ---------------------------------------------------------------------------
// HttpSimClient
// ---------------------------------------------------------------------------

pub struct HttpSimClient {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    create_timeout: Duration,
    max_retries: u32,
    backoff_base_secs: f64,
}

impl HttpSimClient {
    pub fn new(config: &SimConfig) -> Result<Self, SimError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SimError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
            create_timeout: config.create_timeout(),
            max_retries: config.max_retries.max(1),
            backoff_base_secs: config.backoff_base_secs,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let secs = self.backoff_base_secs * 2f64.powi(attempt.saturating_sub(1) as i32);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    /// Send one request, retrying on 429. An empty body reads as `{}`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        key: Option<&str>,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, SimError> {
        let url = self.url(path);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let mut req = self
                .client
                .request(method.clone(), &url)
                .header(reqwest::header::ACCEPT, "application/json")
                .timeout(timeout);
            if let Some(key) = key {
                req = req.bearer_auth(key);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = req.send().await.map_err(|source| SimError::Http {
                url: url.clone(),
                source,
            })?;
            let status = resp.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt < self.max_retries {
                    let wait = self.backoff(attempt);
                    tracing::warn!(
                        url = %url,
                        attempt,
                        max_retries = self.max_retries,
                        wait_secs = wait.as_secs_f64(),
                        "rate limited; backing off"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
                return Err(SimError::RateLimited { url, attempts: attempt });
            }

            let text = resp.text().await.map_err(|source| SimError::Http {
                url: url.clone(),
                source,
            })?;
            if !status.is_success() {
                return Err(SimError::Status {
                    method: method.to_string(),
                    url,
                    status: status.as_u16(),
                    body: text,
                });
            }
            if text.trim().is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            return serde_json::from_str(&text).map_err(|source| SimError::Decode { url, source });
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// First non-empty string among `fields`.
fn string_field(data: &Value, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .filter_map(|f| data.get(*f).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl SimService for HttpSimClient {
    async fn provision_key(&self) -> Result<String, SimError> {
        let data = self
            .request(Method::POST, "/v1/keys", None, None, self.request_timeout)
            .await?;
        string_field(&data, &["key", "api_key"]).ok_or_else(|| SimError::MissingField {
            url: self.url("/v1/keys"),
            field: "key",
        })
    }

    async fn create_city(&self, key: &str, seed: Option<u64>) -> Result<String, SimError> {
        let body = match seed {
            Some(seed) => json!({ "seed": seed }),
            None => json!({}),
        };
        let data = self
            .request(Method::POST, "/v1/cities", Some(key), Some(&body), self.create_timeout)
            .await?;
        string_field(&data, &["id", "city_id"]).ok_or_else(|| SimError::MissingField {
            url: self.url("/v1/cities"),
            field: "id",
        })
    }

    async fn retire_city(&self, key: &str, city_id: &str) -> Result<(), SimError> {
        let path = format!("/v1/cities/{city_id}");
        self.request(Method::DELETE, &path, Some(key), None, self.request_timeout)
            .await?;
        Ok(())
    }

    async fn city_stats(&self, key: &str, city_id: &str) -> Result<CityStats, SimError> {
        let path = format!("/v1/cities/{city_id}");
        let data = self
            .request(Method::GET, &path, Some(key), None, self.request_timeout)
            .await?;
        serde_json::from_value(data).map_err(|source| SimError::Decode {
            url: self.url(&path),
            source,
        })
    }

    async fn advance(&self, key: &str, city_id: &str, months: u32) -> Result<(), SimError> {
        let path = format!("/v1/cities/{city_id}/advance");
        let body = json!({ "months": months });
        self.request(Method::POST, &path, Some(key), Some(&body), self.request_timeout)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
