//! HTTP delivery of envelopes.
//!
//! [`HttpSender`] POSTs serialized envelopes to an ingestion endpoint and maps
//! the response onto a [`SendOutcome`]. It blocks; the dispatcher calls it
//! from its blocking pool.

use postbox::{EnvelopeSender, RateLimitHeaders, SendOutcome};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Content type of the envelope wire format
pub const ENVELOPE_CONTENT_TYPE: &str = "application/x-sentry-envelope";

/// Response header carrying per-category rate limits
pub const RATE_LIMITS_HEADER: &str = "x-sentry-rate-limits";

const AUTH_HEADER: &str = "x-sentry-auth";

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    /// Full URL of the envelope endpoint.
    pub endpoint: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Public key sent in the auth header, if the endpoint requires one.
    pub auth_key: Option<String>,
}

impl HttpSenderConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout_secs: 30,
            auth_key: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum HttpSenderError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("Invalid auth key: {0}")]
    InvalidAuthKey(#[from] reqwest::header::InvalidHeaderValue),
}

/// Blocking HTTP implementation of [`EnvelopeSender`]
pub struct HttpSender {
    config: HttpSenderConfig,
    client: Client,
}

impl HttpSender {
    pub fn new(config: HttpSenderConfig) -> Result<Self, HttpSenderError> {
        if !(config.endpoint.starts_with("http://") || config.endpoint.starts_with("https://")) {
            return Err(HttpSenderError::InvalidEndpoint(config.endpoint));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(ENVELOPE_CONTENT_TYPE));
        if let Some(key) = &config.auth_key {
            let value = format!(
                "Sentry sentry_version=7, sentry_client=postbox/{}, sentry_key={}",
                env!("CARGO_PKG_VERSION"),
                key
            );
            headers.insert(AUTH_HEADER, HeaderValue::from_str(&value)?);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self { config, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }
}

impl EnvelopeSender for HttpSender {
    fn send(&self, body: &[u8]) -> SendOutcome {
        debug!(url = %self.config.endpoint, bytes = body.len(), "Sending envelope");

        let response = match self.client.post(&self.config.endpoint).body(body.to_vec()).send() {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %self.config.endpoint, error = %e, "Envelope request failed");
                return SendOutcome::Failure {
                    retryable: !e.is_builder(),
                };
            }
        };

        let status = response.status().as_u16();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let outcome = classify(status, header(RATE_LIMITS_HEADER), header("retry-after"));

        if !matches!(outcome, SendOutcome::Success) {
            warn!(url = %self.config.endpoint, status, "Envelope not accepted");
        }
        outcome
    }
}

/// Map a response onto a send outcome.
///
/// 2xx is success, 429 carries its rate limit headers, any other 4xx or 5xx
/// is final. Anything else is retried.
pub fn classify(status: u16, rate_limits: Option<String>, retry_after: Option<String>) -> SendOutcome {
    match status {
        200..=299 => SendOutcome::Success,
        429 => SendOutcome::RateLimited(RateLimitHeaders {
            status,
            rate_limits,
            retry_after,
        }),
        _ if status >= 400 => SendOutcome::Failure { retryable: false },
        _ => SendOutcome::Failure { retryable: true },
    }
}
