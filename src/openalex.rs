//! OpenAlex citation adapter
//!
//! Looks up works by PMID through the `ids.pmid` filter and returns their
//! `cited_by_count`, plus the OpenAlex id, DOI, retraction flag, concepts
//! and institutions as enrichment.
//!
//! API Best Practices (per OpenAlex docs):
//! - Use `mailto:email` parameter for polite pool (10 req/s vs 1 req/s)
//! - OR-filters accept at most 100 values
//! - Implement exponential backoff for retries

use crate::citation::{push_unique, CitationReport, CitationSource, SourceKind, WorkEnrichment};
use crate::config::{OPENALEX_BATCH_SIZE, OPENALEX_RATE};
use crate::error::{HarvestError, Result};
use crate::http::{get_text, RateLimiter};
use crate::retry::{with_backoff, AttemptCounter, RetryPolicy};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fields requested from the works endpoint
const SELECT_FIELDS: &str = "id,doi,ids,cited_by_count,is_retracted,concepts,authorships";

/// Maximum concepts kept per work
const MAX_CONCEPTS: usize = 10;

/// A work matched back to the PMID it was requested by
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAlexCitation {
    pub pmid: String,
    pub cited_by_count: Option<u64>,
    pub enrichment: WorkEnrichment,
}

/// OpenAlex API response structures
#[derive(Debug, Deserialize)]
struct OpenAlexResponse {
    results: Option<Vec<OpenAlexWork>>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexWork {
    id: Option<String>,
    doi: Option<String>,
    ids: Option<OpenAlexIds>,
    cited_by_count: Option<i64>,
    is_retracted: Option<bool>,
    concepts: Option<Vec<OpenAlexConcept>>,
    authorships: Option<Vec<OpenAlexAuthorship>>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexIds {
    pmid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexConcept {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexAuthorship {
    institutions: Option<Vec<OpenAlexInstitution>>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexInstitution {
    display_name: Option<String>,
}

/// OpenAlex client with polite-pool identification and rate limiting
pub struct OpenAlexClient {
    client: Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
    mailto: String,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
    attempts: AttemptCounter,
}

impl OpenAlexClient {
    /// Create a new OpenAlexClient
    ///
    /// # Arguments
    ///
    /// * `client` - Shared HTTP client
    /// * `base_url` - API base, e.g. `https://api.openalex.org`
    /// * `mailto` - Contact e-mail for the polite pool
    pub fn new(client: Client, base_url: impl Into<String>, mailto: impl Into<String>) -> Self {
        Self {
            client,
            limiter: Arc::new(RateLimiter::per_second(OPENALEX_RATE)),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            mailto: mailto.into(),
            batch_size: OPENALEX_BATCH_SIZE,
            concurrency: 1,
            retry: RetryPolicy::default(),
            attempts: AttemptCounter::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, OPENALEX_BATCH_SIZE);
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

    /// Fetch one batch, retrying transient failures
    async fn fetch_batch(&self, pmids: &[String]) -> Result<Vec<OpenAlexCitation>> {
        let url = format!("{}/works", self.base_url);
        let params = [
            ("filter", format!("ids.pmid:{}", pmids.join("|"))),
            ("per-page", pmids.len().to_string()),
            ("select", SELECT_FIELDS.to_string()),
            ("mailto", self.mailto.clone()),
        ];

        debug!(count = pmids.len(), "Fetching OpenAlex batch");

        let body = with_backoff(&self.retry, &self.attempts, "openalex", || {
            get_text(&self.client, &self.limiter, &url, &params)
        })
        .await?;

        parse_response(&body)
    }
}

#[async_trait]
impl CitationSource for OpenAlexClient {
    fn kind(&self) -> SourceKind {
        SourceKind::OpenAlex
    }

    async fn lookup(&self, ids: &[String]) -> CitationReport {
        let mut report = CitationReport::empty(SourceKind::OpenAlex, ids);
        if ids.is_empty() {
            return report;
        }

        let results: Vec<(usize, Result<Vec<OpenAlexCitation>>)> =
            stream::iter(ids.chunks(self.batch_size).map(<[String]>::to_vec).enumerate())
                .map(|(idx, chunk)| async move { (idx, self.fetch_batch(&chunk).await) })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        for (idx, result) in results {
            match result {
                Ok(works) => {
                    for work in works {
                        // Only accept ids we asked for
                        if let Some(slot) = report.counts.get_mut(&work.pmid) {
                            *slot = work.cited_by_count;
                            report.enrichment.insert(work.pmid, work.enrichment);
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = idx + 1, error = %e, "OpenAlex batch failed, marking unavailable");
                    report.failed_batches += 1;
                }
            }
        }

        info!(
            requested = ids.len(),
            found = report.found(),
            failed_batches = report.failed_batches,
            "OpenAlex lookup complete"
        );
        report
    }
}

fn pmid_pattern() -> Result<Regex> {
    Regex::new(r"(\d+)/?$").map_err(|e| HarvestError::Parse(e.to_string()))
}

/// Extract the numeric PMID from an OpenAlex `ids.pmid` URL
fn extract_pmid(pmid_regex: &Regex, value: &str) -> Option<String> {
    pmid_regex
        .captures(value.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse OpenAlex API response
fn parse_response(json_str: &str) -> Result<Vec<OpenAlexCitation>> {
    let response: OpenAlexResponse = serde_json::from_str(json_str).map_err(|e| {
        HarvestError::MalformedResponse(format!("Failed to parse OpenAlex response: {}", e))
    })?;

    let pmid_regex = pmid_pattern()?;
    let mut results = Vec::new();

    for work in response.results.unwrap_or_default() {
        // Works without a PMID cannot be joined back
        let Some(pmid) = work
            .ids
            .and_then(|ids| ids.pmid)
            .and_then(|p| extract_pmid(&pmid_regex, &p))
        else {
            continue;
        };

        let mut enrichment = WorkEnrichment {
            provider_id: work.id,
            // DOI (clean format without https://doi.org/ prefix)
            doi: work
                .doi
                .map(|d| d.replace("https://doi.org/", ""))
                .filter(|d| !d.is_empty()),
            is_retracted: work.is_retracted,
            ..Default::default()
        };

        enrichment.concepts = work
            .concepts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| c.display_name)
            .take(MAX_CONCEPTS)
            .collect();

        for authorship in work.authorships.unwrap_or_default() {
            for institution in authorship.institutions.unwrap_or_default() {
                if let Some(name) = institution.display_name {
                    push_unique(&mut enrichment.institutions, &name);
                }
            }
        }

        results.push(OpenAlexCitation {
            pmid,
            cited_by_count: work.cited_by_count.and_then(|c| u64::try_from(c).ok()),
            enrichment,
        });
    }

    Ok(results)
}
