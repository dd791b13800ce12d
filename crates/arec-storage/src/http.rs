use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json body from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin JSON transport. Deadlines come from the client timeout; there is no retry loop,
/// a failed call is reported once and the caller decides how to degrade.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    bearer_token: Option<String>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            bearer_token: config.bearer_token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Option<JsonValue>, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let resp = self.authorize(request).send().await?;
        let status = resp.status();
        let url = resp.url().to_string();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body = resp.bytes().await?;
        if body.is_empty() {
            return Ok(Some(JsonValue::Null));
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|source| FetchError::Body { url, source })
    }

    /// `Ok(None)` on 404; every other non-success status is an error.
    pub async fn get_json(&self, url: &str) -> Result<Option<JsonValue>, FetchError> {
        let span = info_span!("http_get", url);
        self.send(self.client.get(url)).instrument(span).await
    }

    pub async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_post", url);
        let response = self
            .send(self.client.post(url).json(body))
            .instrument(span)
            .await?;
        response.ok_or_else(|| FetchError::HttpStatus {
            status: StatusCode::NOT_FOUND.as_u16(),
            url: url.to_string(),
        })
    }
}
