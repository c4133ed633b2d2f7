use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use thiserror::Error;

use crate::config::HttpConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request never produced an HTTP status (DNS, connect, timeout, truncated body).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// A single blocking GET. Non-2xx statuses are returned, not raised.
pub trait Transport {
    fn get(&mut self, url: &str, query: &[(String, String)])
    -> Result<HttpResponse, TransportError>;
}

pub trait Clock {
    fn sleep(&mut self, duration: Duration);
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&mut self, duration: Duration) {
        sleep(duration);
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
        self.retry_delay.saturating_mul(2u32.saturating_pow(exponent))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&HttpConfig::default())
    }
}

/// Caller-owned context shared by both engines: one transport, one clock.
pub struct HttpSession<T, C> {
    transport: T,
    clock: C,
    request_count: usize,
}

impl<T: Transport, C: Clock> HttpSession<T, C> {
    pub fn new(transport: T, clock: C) -> Self {
        Self {
            transport,
            clock,
            request_count: 0,
        }
    }

    pub fn get(
        &mut self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, TransportError> {
        self.request_count += 1;
        self.transport.get(url, query)
    }

    pub fn pause(&mut self, duration: Duration) {
        if !duration.is_zero() {
            self.clock.sleep(duration);
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

pub struct ReqwestTransport {
    client: Client,
    user_agent: String,
}

impl ReqwestTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
        })
    }
}

impl Transport for ReqwestTransport {
    fn get(
        &mut self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, TransportError> {
        let mut request = self
            .client
            .get(url)
            .header("User-Agent", self.user_agent.clone())
            .header("Accept", "application/json, text/plain;q=0.9, */*;q=0.1");
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send().map_err(|error| TransportError {
            retryable: is_retryable_error(&error),
            message: error.to_string(),
        })?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|error| TransportError::retryable(format!("failed to read body: {error}")))?;
        Ok(HttpResponse { status, body })
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}
