use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use tracing::{debug, error, info, warn};

use crate::config::FetchConfig;
use crate::parser::FeedParser;
use crate::retry::{retry, RetryPolicy};
use crate::types::{FetchError, FetchFailure, FetchFailureKind, RawItemBatch, Result, Source};

/// The network half of a fetch: one GET, no retries, no parsing.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn get(&self, endpoint: &str) -> std::result::Result<Vec<u8>, FetchError>;
}

pub struct HttpTransport {
    client: Client,
    max_payload_bytes: usize,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            client,
            max_payload_bytes: config.max_payload_bytes,
        })
    }
}

fn classify(e: &reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::new(FetchFailureKind::Timeout, e.to_string())
    } else if e.is_redirect() || e.is_builder() {
        FetchError::malformed(e.to_string())
    } else {
        FetchError::unreachable(e.to_string())
    }
}

fn classify_status(status: StatusCode) -> FetchError {
    let message = format!("HTTP {}: {}", status.as_u16(), status.canonical_reason().unwrap_or("Unknown"));
    if status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::new(FetchFailureKind::RateLimited, message)
    } else if status.is_server_error() {
        FetchError::unreachable(message)
    } else {
        FetchError::malformed(message)
    }
}

#[async_trait]
impl FeedTransport for HttpTransport {
    async fn get(&self, endpoint: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let mut response = self.client.get(endpoint).send().await.map_err(|e| classify(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_payload_bytes {
                return Err(FetchError::malformed(format!(
                    "declared payload of {length} bytes exceeds limit of {}",
                    self.max_payload_bytes
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(&e))? {
            if body.len() + chunk.len() > self.max_payload_bytes {
                return Err(FetchError::malformed(format!(
                    "payload exceeds limit of {} bytes",
                    self.max_payload_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Retrieves one source: bounded attempts with backoff, then parsing.
pub struct Fetcher {
    transport: Arc<dyn FeedTransport>,
    parser: FeedParser,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn FeedTransport>, retry: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            transport,
            parser: FeedParser::new(),
            retry,
            attempt_timeout,
        }
    }

    pub fn from_config(config: &FetchConfig, retry: RetryPolicy) -> Result<Self> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::new(Arc::new(transport), retry, config.timeout()))
    }

    pub async fn fetch(&self, source: &Source) -> std::result::Result<RawItemBatch, FetchFailure> {
        let fetched_at = Utc::now();
        debug!("Fetching feed: {} ({})", source.endpoint, source.id);

        let (result, attempts) = retry(&self.retry, source.id.as_str(), |_| self.attempt(source)).await;

        let failure = |e: FetchError| FetchFailure {
            source_id: source.id.clone(),
            kind: e.kind,
            attempts,
            message: e.message,
        };

        let content = result.map_err(|e| {
            if e.kind == FetchFailureKind::MalformedResponse {
                error!(source = %source.id, attempts, error = %e, "malformed response, not retrying");
            } else {
                warn!(source = %source.id, attempts, error = %e, "fetch failed");
            }
            failure(e)
        })?;

        let items = self.parser.parse(&content, &source.id, fetched_at).map_err(|e| {
            error!(source = %source.id, error = %e, "feed document could not be parsed");
            failure(e)
        })?;

        info!("Fetched {} entries from {} ({} bytes, {} attempt(s))", items.len(), source.id, content.len(), attempts);
        Ok(RawItemBatch {
            source_id: source.id.clone(),
            fetched_at,
            items,
            attempts,
        })
    }

    async fn attempt(&self, source: &Source) -> std::result::Result<Vec<u8>, FetchError> {
        match tokio::time::timeout(self.attempt_timeout, self.transport.get(&source.endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::new(
                FetchFailureKind::Timeout,
                format!("no response within {:?}", self.attempt_timeout),
            )),
        }
    }
}
