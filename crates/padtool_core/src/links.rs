//! Link-usage crawl: pages through `list=exturlusage` once per protocol and
//! folds every citation into an [`EtherpadIndex`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_LINK_LIMIT, DEFAULT_LINK_QUERY, ToolConfig};
use crate::error::{IndexError, TransientApiError};
use crate::http::{Clock, HttpSession, RetryPolicy, Transport, is_retryable_status};
use crate::index::{EtherpadIndex, IndexSource, LinkRecord};
use crate::wikis::WikiTarget;

const TRANSIENT_API_CODES: &[&str] = &["ratelimited", "maxlag", "readonly"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::Http, Protocol::Https];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Server-issued continuation cursor, passed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinueToken(Vec<(String, String)>);

impl ContinueToken {
    fn from_map(continuation: BTreeMap<String, Value>) -> Result<Option<Self>, String> {
        let mut params = Vec::with_capacity(continuation.len());
        for (key, item) in continuation {
            let rendered = match item {
                Value::String(text) => text,
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                _ => return Err(format!("`continue.{key}` is not a scalar")),
            };
            params.push((key, rendered));
        }
        if params.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self(params)))
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct LinkQueryOptions {
    pub target: WikiTarget,
    pub query: String,
    pub limit: usize,
    pub page_delay: Duration,
    pub retry: RetryPolicy,
}

impl LinkQueryOptions {
    pub fn new(target: WikiTarget) -> Self {
        Self {
            target,
            query: DEFAULT_LINK_QUERY.to_string(),
            limit: DEFAULT_LINK_LIMIT,
            page_delay: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(target: WikiTarget, config: &ToolConfig) -> Self {
        Self {
            target,
            query: config.links.query.clone(),
            limit: config.links.limit.max(1),
            page_delay: Duration::from_millis(config.links.page_delay_ms),
            retry: RetryPolicy::from_config(&config.http),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkUsagePage {
    pub records: Vec<LinkRecord>,
    pub next: Option<ContinueToken>,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    warnings: Option<Value>,
    #[serde(default)]
    query: Option<UsageQuery>,
    #[serde(default, rename = "continue")]
    continuation: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    info: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    #[serde(default)]
    exturlusage: Option<Vec<UsageRow>>,
}

#[derive(Debug, Deserialize)]
struct UsageRow {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

enum RequestFailure {
    Transient(TransientApiError),
    Fatal(IndexError),
}

/// Crawl both protocol variants to exhaustion. Any failure discards the
/// partial index.
pub fn build_index<T: Transport, C: Clock>(
    session: &mut HttpSession<T, C>,
    options: &LinkQueryOptions,
) -> Result<EtherpadIndex, IndexError> {
    let mut index = EtherpadIndex::new(IndexSource {
        api_url: options.target.api_url.clone(),
        wiki_base_url: options.target.wiki_base_url.clone(),
        wiki_label: options.target.wiki_label.clone(),
        query: options.query.clone(),
    });
    let mut first_request = true;

    for protocol in Protocol::ALL {
        let mut cursor: Option<ContinueToken> = None;
        let mut page_number = 0usize;
        loop {
            if !first_request {
                session.pause(options.page_delay);
            }
            first_request = false;

            let page = fetch_usage_page(session, options, protocol, cursor.as_ref())?;
            page_number += 1;
            let fetched = page.records.len();
            let added = page
                .records
                .iter()
                .filter(|record| index.insert(record))
                .count();
            info!(
                protocol = protocol.as_str(),
                page = page_number,
                fetched,
                added,
                unique_urls = index.stats().unique_etherpad_urls,
                "fetched link-usage page"
            );

            match page.next {
                Some(next) => {
                    if cursor.as_ref() == Some(&next) {
                        return Err(IndexError::malformed(
                            &options.target.api_url,
                            "continuation cursor did not advance",
                        ));
                    }
                    cursor = Some(next);
                }
                None => break,
            }
        }
    }

    Ok(index)
}

/// One page of results, retrying transient failures of the same request.
pub fn fetch_usage_page<T: Transport, C: Clock>(
    session: &mut HttpSession<T, C>,
    options: &LinkQueryOptions,
    protocol: Protocol,
    cursor: Option<&ContinueToken>,
) -> Result<LinkUsagePage, IndexError> {
    let api_url = options.target.api_url.as_str();
    let mut params = vec![
        ("action".to_string(), "query".to_string()),
        ("list".to_string(), "exturlusage".to_string()),
        ("euquery".to_string(), options.query.clone()),
        ("euprotocol".to_string(), protocol.as_str().to_string()),
        ("eulimit".to_string(), options.limit.to_string()),
        ("euprop".to_string(), "title|url".to_string()),
        ("format".to_string(), "json".to_string()),
        ("formatversion".to_string(), "2".to_string()),
    ];
    if let Some(token) = cursor {
        params.extend(token.params().iter().cloned());
    }

    let max_retries = options.retry.max_retries;
    for attempt in 0..=max_retries {
        match request_once(session, api_url, &params) {
            Ok(payload) => return parse_usage_page(&options.target, api_url, payload),
            Err(RequestFailure::Fatal(error)) => return Err(error),
            Err(RequestFailure::Transient(error)) => {
                if attempt < max_retries {
                    let backoff = options.retry.backoff(attempt);
                    warn!(
                        protocol = protocol.as_str(),
                        attempt = attempt + 1,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "{error}; retrying"
                    );
                    session.pause(backoff);
                    continue;
                }
                return Err(error.escalate(api_url, options.retry.attempts()));
            }
        }
    }

    Err(IndexError::api(api_url, "link-usage request exhausted retry budget"))
}

fn request_once<T: Transport, C: Clock>(
    session: &mut HttpSession<T, C>,
    api_url: &str,
    params: &[(String, String)],
) -> Result<UsageResponse, RequestFailure> {
    let response = session.get(api_url, params).map_err(|error| {
        if error.retryable {
            RequestFailure::Transient(TransientApiError::new(error.message))
        } else {
            RequestFailure::Fatal(IndexError::api(api_url, error.message))
        }
    })?;

    if !response.is_success() {
        let reason = format!("HTTP {}", response.status);
        return Err(if is_retryable_status(response.status) {
            RequestFailure::Transient(TransientApiError::new(reason))
        } else {
            RequestFailure::Fatal(IndexError::api(api_url, reason))
        });
    }

    let payload: UsageResponse = serde_json::from_str(&response.body).map_err(|error| {
        RequestFailure::Fatal(IndexError::malformed(
            api_url,
            format!("unexpected response shape: {error}"),
        ))
    })?;

    if let Some(error) = &payload.error {
        let code = error.code.as_deref().unwrap_or("unknown_error");
        let info = error.info.as_deref().unwrap_or("unknown info");
        let reason = format!("API error [{code}]: {info}");
        return Err(if is_transient_api_code(code) {
            RequestFailure::Transient(TransientApiError::new(reason))
        } else {
            RequestFailure::Fatal(IndexError::api(api_url, reason))
        });
    }
    if let Some(warnings) = &payload.warnings {
        debug!(%warnings, "link-usage API returned warnings");
    }

    Ok(payload)
}

fn parse_usage_page(
    target: &WikiTarget,
    api_url: &str,
    payload: UsageResponse,
) -> Result<LinkUsagePage, IndexError> {
    let rows = payload
        .query
        .and_then(|query| query.exturlusage)
        .ok_or_else(|| IndexError::malformed(api_url, "missing query.exturlusage array"))?;

    let mut records = Vec::with_capacity(rows.len());
    for (position, row) in rows.into_iter().enumerate() {
        let (Some(title), Some(url)) = (row.title, row.url) else {
            return Err(IndexError::malformed(
                api_url,
                format!("exturlusage row {position} lacks title or url"),
            ));
        };
        records.push(LinkRecord {
            page_url: target.page_url(&title),
            etherpad_url: url,
            page_title: title,
        });
    }

    let next = match payload.continuation {
        Some(continuation) => ContinueToken::from_map(continuation)
            .map_err(|reason| IndexError::malformed(api_url, reason))?,
        None => None,
    };

    Ok(LinkUsagePage { records, next })
}

fn is_transient_api_code(code: &str) -> bool {
    TRANSIENT_API_CODES.contains(&code) || code.starts_with("internal_api_error")
}
