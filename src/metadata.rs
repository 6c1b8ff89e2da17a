//! Metadata fetching with detailed-record fallback.
//!
//! Summaries are fetched in fixed-size batches. When a summary lacks a DOI,
//! one detailed-record request scoped to exactly those identifiers fills it
//! in. Identifiers that fail are skipped and counted, never retried
//! indefinitely.

use crate::citation::push_unique;
use crate::error::Result;
use crate::retry::{with_backoff, AttemptCounter, RetryPolicy};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Descriptive metadata for one record, as returned by the search provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleMeta {
    pub id: String,
    pub title: String,
    pub journal: String,
    pub year: Option<i32>,
    pub doi: Option<String>,
    /// Author names in authorship order
    pub authors: Vec<String>,
    pub institutions: Vec<String>,
}

/// Fields only available from the detailed record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailedRecord {
    pub doi: Option<String>,
    pub affiliations: Vec<String>,
}

/// Metadata API as seen by the fetcher
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Summary metadata for `ids`; may return fewer records than requested
    async fn summaries(&self, ids: &[String]) -> Result<Vec<ArticleMeta>>;

    /// Detailed records for `ids`, keyed by id
    async fn details(&self, ids: &[String]) -> Result<HashMap<String, DetailedRecord>>;
}

/// Output of one fetch
#[derive(Debug, Clone, Default)]
pub struct MetadataBatch {
    /// One record per successfully fetched id, in request order
    pub records: Vec<ArticleMeta>,
    /// Requested ids with no record
    pub skipped: usize,
    /// Records whose DOI came from the detailed fallback
    pub doi_backfilled: usize,
}

/// Batched, retrying metadata fetcher
pub struct MetadataFetcher<'a> {
    backend: &'a dyn MetadataBackend,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
    attempts: AttemptCounter,
}

impl<'a> MetadataFetcher<'a> {
    pub fn new(
        backend: &'a dyn MetadataBackend,
        batch_size: usize,
        concurrency: usize,
        retry: RetryPolicy,
        attempts: AttemptCounter,
    ) -> Self {
        Self {
            backend,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            retry,
            attempts,
        }
    }

    /// Fetch metadata for `ids`, best effort.
    pub async fn fetch(&self, ids: &[String]) -> MetadataBatch {
        if ids.is_empty() {
            return MetadataBatch::default();
        }

        let results: Vec<(usize, Result<Vec<ArticleMeta>>)> =
            stream::iter(ids.chunks(self.batch_size).enumerate())
                .map(|(idx, chunk)| async move { (idx, self.fetch_chunk(chunk).await) })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut by_id: HashMap<String, ArticleMeta> = HashMap::new();

        for (idx, result) in results {
            match result {
                Ok(records) => {
                    for record in records {
                        if requested.contains(record.id.as_str()) {
                            by_id.entry(record.id.clone()).or_insert(record);
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = idx + 1, error = %e, "Metadata batch skipped");
                }
            }
        }

        let doi_backfilled = self.backfill_dois(&mut by_id).await;

        let records: Vec<ArticleMeta> = ids.iter().filter_map(|id| by_id.remove(id)).collect();
        let skipped = ids.len() - records.len();

        if skipped > 0 {
            warn!(requested = ids.len(), skipped = skipped, "Some identifiers returned no metadata");
        }
        info!(
            fetched = records.len(),
            skipped = skipped,
            doi_backfilled = doi_backfilled,
            "Metadata batch complete"
        );

        MetadataBatch {
            records,
            skipped,
            doi_backfilled,
        }
    }

    async fn fetch_chunk(&self, chunk: &[String]) -> Result<Vec<ArticleMeta>> {
        debug!(count = chunk.len(), "Fetching summaries");
        with_backoff(&self.retry, &self.attempts, "summaries", || {
            self.backend.summaries(chunk)
        })
        .await
    }

    /// Fill missing DOIs from detailed records, returns how many were filled
    async fn backfill_dois(&self, by_id: &mut HashMap<String, ArticleMeta>) -> usize {
        let mut missing: Vec<String> = by_id
            .values()
            .filter(|r| r.doi.is_none())
            .map(|r| r.id.clone())
            .collect();
        if missing.is_empty() {
            return 0;
        }
        missing.sort();

        info!(count = missing.len(), "Supplementing missing DOIs from detailed records");

        let mut filled = 0;
        for chunk in missing.chunks(self.batch_size) {
            let details = match with_backoff(&self.retry, &self.attempts, "details", || {
                self.backend.details(chunk)
            })
            .await
            {
                Ok(details) => details,
                Err(e) => {
                    warn!(count = chunk.len(), error = %e, "Detailed-record fallback failed");
                    continue;
                }
            };

            for (id, detail) in details {
                let Some(record) = by_id.get_mut(&id) else {
                    continue;
                };
                if record.doi.is_none() && detail.doi.is_some() {
                    record.doi = detail.doi;
                    filled += 1;
                }
                for affiliation in &detail.affiliations {
                    push_unique(&mut record.institutions, affiliation);
                }
            }
        }

        filled
    }
}
