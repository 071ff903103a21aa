//! Metrics document sources.
//!
//! The pipeline only needs "give me the current metrics document"; the HTTP
//! transport sits behind [`MetricsSource`] so tests can script responses.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::config::MetricsConfig;
use crate::error::{Error, FetchError, Result};

pub type FetchFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<Value, FetchError>> + Send + 'a>>;

/// Something that can produce the current metrics document.
pub trait MetricsSource: Send + Sync {
    /// Fetch one document. Every call is independent.
    fn fetch(&self) -> FetchFuture<'_>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

/// Polls a JSON metrics endpoint over HTTP.
pub struct HttpMetricsSource {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpMetricsSource {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let timeout = config.fetch_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Fetch(FetchError::Transport(e.to_string())))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            timeout,
        })
    }

    async fn fetch_document(&self) -> std::result::Result<Value, FetchError> {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout(timeout_ms)
            } else {
                FetchError::Transport(e.to_string())
            }
        };

        let response = self
            .client
            .get(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(map_err)?;
        debug!(endpoint = %self.endpoint, bytes = body.len(), "Fetched metrics document");
        serde_json::from_str(&body).map_err(|e| FetchError::InvalidBody(e.to_string()))
    }
}

impl MetricsSource for HttpMetricsSource {
    fn fetch(&self) -> FetchFuture<'_> {
        Box::pin(self.fetch_document())
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}
