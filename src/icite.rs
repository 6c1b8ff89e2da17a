//! NIH iCite citation adapter
//!
//! Batch lookup of citation counts by PMID.
//!
//! API Details:
//! - Endpoint: GET /api/pubs?pmids=1,2,3
//! - Max 500 PMIDs per request (rejected above 1000)
//! - PMIDs iCite does not know are simply absent from `data`

use crate::citation::{CitationReport, CitationSource, SourceKind};
use crate::config::{ICITE_BATCH_SIZE, ICITE_RATE};
use crate::error::{HarvestError, Result};
use crate::http::{get_text, RateLimiter};
use crate::retry::{with_backoff, AttemptCounter, RetryPolicy};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct ICiteResponse {
    data: Option<Vec<ICitePub>>,
}

#[derive(Debug, Deserialize)]
struct ICitePub {
    pmid: Option<PmidValue>,
    citation_count: Option<i64>,
    cited_by: Option<CitedBy>,
}

/// iCite reports PMIDs as numbers, some mirrors as strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PmidValue {
    Number(u64),
    Text(String),
}

/// `cited_by` is a list of citing PMIDs in the current API and a bare
/// count in older exports
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CitedBy {
    Count(u64),
    List(Vec<serde_json::Value>),
}

/// iCite API client
pub struct ICiteClient {
    client: Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
    attempts: AttemptCounter,
}

impl ICiteClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            limiter: Arc::new(RateLimiter::per_second(ICITE_RATE)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            batch_size: ICITE_BATCH_SIZE,
            concurrency: 1,
            retry: RetryPolicy::default(),
            attempts: AttemptCounter::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, ICITE_BATCH_SIZE);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy, attempts: AttemptCounter) -> Self {
        self.retry = retry;
        self.attempts = attempts;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    async fn fetch_batch(&self, pmids: &[String]) -> Result<HashMap<String, Option<u64>>> {
        let url = format!("{}/api/pubs", self.base_url);
        let params = [("pmids", pmids.join(","))];

        debug!(count = pmids.len(), "Fetching iCite batch");

        let body = with_backoff(&self.retry, &self.attempts, "icite", || {
            get_text(&self.client, &self.limiter, &url, &params)
        })
        .await?;

        parse_response(&body)
    }
}

#[async_trait]
impl CitationSource for ICiteClient {
    fn kind(&self) -> SourceKind {
        SourceKind::ICite
    }

    async fn lookup(&self, ids: &[String]) -> CitationReport {
        let mut report = CitationReport::empty(SourceKind::ICite, ids);
        if ids.is_empty() {
            return report;
        }

        let results: Vec<(usize, Result<HashMap<String, Option<u64>>>)> =
            stream::iter(ids.chunks(self.batch_size).map(<[String]>::to_vec).enumerate())
                .map(|(idx, chunk)| async move { (idx, self.fetch_batch(&chunk).await) })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        for (idx, result) in results {
            match result {
                Ok(counts) => {
                    for (pmid, count) in counts {
                        if let Some(slot) = report.counts.get_mut(&pmid) {
                            *slot = count;
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = idx + 1, error = %e, "iCite batch failed, marking unavailable");
                    report.failed_batches += 1;
                }
            }
        }

        info!(
            requested = ids.len(),
            found = report.found(),
            failed_batches = report.failed_batches,
            "iCite lookup complete"
        );
        report
    }
}

/// Parse an iCite `/api/pubs` payload into PMID → count
fn parse_response(json_str: &str) -> Result<HashMap<String, Option<u64>>> {
    let response: ICiteResponse = serde_json::from_str(json_str).map_err(|e| {
        HarvestError::MalformedResponse(format!("Failed to parse iCite response: {}", e))
    })?;

    let counts = response
        .data
        .unwrap_or_default()
        .into_iter()
        .filter_map(|record| {
            let pmid = match record.pmid? {
                PmidValue::Number(n) => n.to_string(),
                PmidValue::Text(s) => s.trim().to_string(),
            };
            if pmid.is_empty() {
                return None;
            }
            let count = record
                .citation_count
                .and_then(|c| u64::try_from(c).ok())
                .or(match record.cited_by {
                    Some(CitedBy::Count(n)) => Some(n),
                    Some(CitedBy::List(list)) => Some(list.len() as u64),
                    None => None,
                });
            Some((pmid, count))
        })
        .collect();

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;

    fn test_client(base_url: &str) -> ICiteClient {
        let http = crate::http::build_client("rustharvest-test", Duration::from_secs(5))
            .expect("client");
        ICiteClient::new(http, base_url)
            .with_limiter(Arc::new(RateLimiter::per_second(0)))
            .with_retry(RetryPolicy::none(), AttemptCounter::new())
    }

    #[test]
    fn test_parse_response_variants() {
        let body = json!({
            "data": [
                {"pmid": 111, "citation_count": 10, "cited_by": [1, 2, 3]},
                {"pmid": "222", "cited_by": [5, 6]},
                {"pmid": 333, "cited_by": 4},
                {"pmid": 444},
                {"citation_count": 7}
            ]
        })
        .to_string();

        let counts = parse_response(&body).expect("parses");
        assert_eq!(counts.len(), 4);
        assert_eq!(counts["111"], Some(10));
        assert_eq!(counts["222"], Some(2));
        assert_eq!(counts["333"], Some(4));
        assert_eq!(counts["444"], None);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_response("{\"data\": 12}"),
            Err(HarvestError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_batches_and_marks_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/api/pubs")
            .match_query(Matcher::UrlEncoded("pmids".to_string(), "1,2".to_string()))
            .with_status(200)
            .with_body(json!({"data": [{"pmid": 1, "citation_count": 10}]}).to_string())
            .create_async()
            .await;
        let second = server
            .mock("GET", "/api/pubs")
            .match_query(Matcher::UrlEncoded("pmids".to_string(), "3".to_string()))
            .with_status(200)
            .with_body(json!({"data": [{"pmid": 3, "citation_count": 0}]}).to_string())
            .create_async()
            .await;

        let client = test_client(&server.url()).with_batch_size(2);
        let ids = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let report = client.lookup(&ids).await;

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(report.counts["1"], Some(10));
        assert_eq!(report.counts["2"], None);
        assert_eq!(report.counts["3"], Some(0));
        assert_eq!(report.found(), 2);
    }

    #[tokio::test]
    async fn test_lookup_survives_malformed_batch() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/pubs")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("not json at all")
            .create_async()
            .await;

        let client = test_client(&server.url());
        let report = client.lookup(&["9".to_string()]).await;

        assert_eq!(report.counts["9"], None);
        assert_eq!(report.failed_batches, 1);
    }

    #[tokio::test]
    async fn test_concurrent_batches_share_retry_counter() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/pubs")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(6)
            .create_async()
            .await;

        let attempts = AttemptCounter::new();
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        let client = test_client(&server.url())
            .with_batch_size(1)
            .with_concurrency(2)
            .with_retry(retry, attempts.clone());
        let ids = vec!["1".to_string(), "2".to_string(), "3".to_string()];

        // Runs on a spawned task, so the lookup future must be Send
        let report = tokio::spawn(async move { client.lookup(&ids).await })
            .await
            .expect("task joins");

        mock.assert_async().await;
        assert_eq!(report.failed_batches, 3);
        assert_eq!(report.found(), 0);
        assert_eq!(attempts.get(), 3);
    }
}
