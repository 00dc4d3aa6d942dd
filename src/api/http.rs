//! REST client for the todo backend
//!
//! Every response is wrapped in `{ code, message, data, attribute? }`.
//! Paginated endpoints put `{ total, page, pageSize, totalPages }` in
//! `attribute`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use super::TaskSource;
use crate::cache::Fetch;
use crate::config::ApiConfig;
use crate::task::{Task, TaskId, TaskStatus, TodoStats};
use crate::{Error, Result};

/// Response envelope used by every endpoint
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    /// `0` on success
    pub code: i64,
    /// Human-readable status
    #[serde(default)]
    pub message: String,
    /// Payload
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    /// Pagination info
    #[serde(default)]
    pub attribute: Option<PageAttribute>,
}

/// Pagination metadata
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageAttribute {
    /// Total matching rows
    pub total: u64,
    /// Current page (1-based)
    pub page: u32,
    /// Rows per page
    pub page_size: u32,
    /// Number of pages
    pub total_pages: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// HTTP client for the todo backend
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base_url: Url,
    page_size: u32,
}

impl HttpApi {
    /// Build a client from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be constructed.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            match (key.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
                (Ok(k), Ok(v)) => {
                    headers.insert(k, v);
                }
                _ => warn!(header = %key, "Skipping invalid header"),
            }
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        // Url::join drops the last path segment without a trailing slash
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).map_err(|e| Error::Config(format!("Invalid api.base_url '{}': {e}", config.base_url)))?;

        Ok(Self {
            client,
            base_url,
            page_size: config.page_size.max(1),
        })
    }

    /// Base URL requests are resolved against
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> Result<Url> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| Error::Internal(format!("Invalid endpoint '{endpoint}': {e}")))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Envelope<T>> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("Request failed").to_string());
            return Err(Error::api(status.as_u16(), message));
        }

        let envelope: Envelope<T> = serde_json::from_slice(&body)?;
        if envelope.code != 0 {
            return Err(Error::api(status.as_u16(), envelope.message));
        }
        Ok(envelope)
    }

    /// `GET endpoint` with `params` as query string, returning `data`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] for non-success responses and transport errors
    /// as-is.
    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str, params: &Value) -> Result<T> {
        let mut request = self.client.get(self.url(endpoint)?);
        if let Value::Object(map) = params {
            let query: Vec<(&str, String)> = map
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.as_str(), v)
                })
                .collect();
            request = request.query(&query);
        }

        self.send::<T>(request)
            .await?
            .data
            .ok_or_else(|| Error::Internal(format!("Response from {endpoint} has no data")))
    }

    /// Task counts from `GET /todo/stats`
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn stats(&self) -> Result<TodoStats> {
        self.get("/todo/stats", &json!({})).await
    }
}

#[async_trait]
impl TaskSource for HttpApi {
    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let url = self.url("/todo")?;
        let mut tasks = Vec::new();
        let mut page: u32 = 1;

        loop {
            let request = self
                .client
                .get(url.clone())
                .query(&[("page", page), ("pageSize", self.page_size)]);
            let envelope = self.send::<Vec<Task>>(request).await?;
            let batch = envelope.data.unwrap_or_default();
            let received = batch.len();
            tasks.extend(batch);

            let total_pages = envelope.attribute.map_or(1, |a| a.total_pages);
            if received == 0 || page >= total_pages {
                break;
            }
            page += 1;
        }

        tasks.retain(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Done));
        debug!(count = tasks.len(), pages = page, "Fetched tasks");
        Ok(tasks)
    }

    async fn mark_notified(&self, id: TaskId) -> Result<()> {
        let request = self
            .client
            .patch(self.url(&format!("/todo/{id}"))?)
            .json(&json!({ "isReminded": true }));
        self.send::<Value>(request).await?;
        Ok(())
    }
}

#[async_trait]
impl<T> Fetch<T> for HttpApi
where
    T: DeserializeOwned + Send + 'static,
{
    async fn fetch(&self, endpoint: &str, params: &Value) -> Result<T> {
        self.get(endpoint, params).await
    }
}
