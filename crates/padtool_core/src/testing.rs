use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::http::{Clock, HttpResponse, Transport, TransportError};

type Scripted = Result<HttpResponse, TransportError>;

/// Replays scripted responses per URL in push order and records every request.
#[derive(Default)]
pub struct FakeTransport {
    routes: BTreeMap<String, VecDeque<Scripted>>,
    pub requests: Vec<(String, Vec<(String, String)>)>,
}

impl FakeTransport {
    pub fn push(&mut self, url: &str, response: Scripted) {
        self.routes
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn push_text(&mut self, url: &str, status: u16, body: &str) {
        self.push(
            url,
            Ok(HttpResponse {
                status,
                body: body.to_string(),
            }),
        );
    }

    pub fn push_json(&mut self, url: &str, body: Value) {
        self.push_text(url, 200, &body.to_string());
    }

    pub fn requests_to(&self, url: &str) -> usize {
        self.requests.iter().filter(|(target, _)| target == url).count()
    }

    pub fn query_param(&self, index: usize, key: &str) -> Option<String> {
        self.requests.get(index).and_then(|(_, query)| {
            query
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone())
        })
    }
}

impl Transport for FakeTransport {
    fn get(
        &mut self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, TransportError> {
        self.requests.push((url.to_string(), query.to_vec()));
        self.routes
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(TransportError::fatal(format!("no scripted response for {url}"))))
    }
}

#[derive(Debug)]
pub struct FakeClock {
    start: DateTime<Utc>,
    pub sleeps: Vec<Duration>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self {
            start: DateTime::from_timestamp(1_767_225_600, 0).expect("valid timestamp"),
            sleeps: Vec::new(),
        }
    }
}

impl Clock for FakeClock {
    fn sleep(&mut self, duration: Duration) {
        self.sleeps.push(duration);
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed: Duration = self.sleeps.iter().sum();
        self.start + chrono::Duration::from_std(elapsed).expect("elapsed fits")
    }
}

/// One `list=exturlusage` response page; `next` becomes the `eucontinue` cursor.
pub fn usage_page(rows: &[(&str, &str)], next: Option<&str>) -> Value {
    let rows = rows
        .iter()
        .map(|(title, url)| json!({ "ns": 0, "title": title, "url": url }))
        .collect::<Vec<_>>();
    let mut page = json!({
        "batchcomplete": true,
        "query": { "exturlusage": rows },
    });
    if let Some(cursor) = next {
        page["continue"] = json!({ "eucontinue": cursor, "continue": "-||" });
    }
    page
}
