//! Paged search cursor.
//!
//! The initial search registers the result set on the server (a query-scope
//! handle plus an opaque cursor key) and reports the total hit count. Pages
//! of identifiers are then pulled lazily by offset, so a cursor can resume
//! where a previous one stopped instead of re-running the query.

use crate::error::Result;
use crate::retry::{with_backoff, AttemptCounter, RetryPolicy};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

/// Server-side handle for a registered result set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHandle {
    /// Total hits for the query
    pub count: u64,
    /// Query-scope handle (PubMed `WebEnv`)
    pub web_env: String,
    /// Cursor key inside that scope (PubMed `query_key`)
    pub query_key: String,
}

/// Literature search API as seen by the cursor
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Run `term` once and register the result set
    async fn open(&self, term: &str) -> Result<SearchHandle>;

    /// Identifiers `offset .. offset + limit` of a registered result set
    async fn fetch_ids(&self, handle: &SearchHandle, offset: u64, limit: u64) -> Result<Vec<String>>;

    /// Hit count for `term` without registering it
    async fn count(&self, term: &str) -> Result<u64>;
}

/// Build the search term for a query restricted to a publication-year range.
///
/// A missing start year opens the range at 1800, a missing end year closes it
/// at the current year.
pub fn build_term(query: &str, start_year: Option<i32>, end_year: Option<i32>) -> String {
    let base = format!("({}[Title/Abstract])", query.trim());
    match year_bounds(start_year, end_year) {
        Some((start, end)) => format!("{} AND (\"{}\"[dp] : \"{}\"[dp])", base, start, end),
        None => base,
    }
}

/// Concrete year range for an optional filter, `None` when neither bound is set.
///
/// Defaults match [`build_term`]: start at 1800, end at the current year.
pub fn year_bounds(start_year: Option<i32>, end_year: Option<i32>) -> Option<(i32, i32)> {
    if start_year.is_none() && end_year.is_none() {
        return None;
    }
    Some((start_year.unwrap_or(1800), end_year.unwrap_or_else(current_year)))
}

fn current_year() -> i32 {
    use chrono::Datelike;
    chrono::Utc::now().year()
}

/// Hit counts per publication year, one search per year.
///
/// A year whose count cannot be fetched is reported as 0.
pub async fn year_histogram(
    backend: &dyn SearchBackend,
    query: &str,
    start_year: i32,
    end_year: i32,
    retry: &RetryPolicy,
    attempts: &AttemptCounter,
) -> BTreeMap<i32, u64> {
    let mut counts = BTreeMap::new();

    for year in start_year..=end_year {
        let term = build_term(query, Some(year), Some(year));
        let count = match with_backoff(retry, attempts, "year count", || backend.count(&term)).await {
            Ok(count) => count,
            Err(e) => {
                warn!(year = year, error = %e, "Failed to get count for year");
                0
            }
        };
        debug!(year = year, count = count, "Year count");
        counts.insert(year, count);
    }

    counts
}

/// Lazy, resumable sequence of identifier pages
pub struct SearchCursor<'a> {
    backend: &'a dyn SearchBackend,
    handle: SearchHandle,
    retry: RetryPolicy,
    attempts: AttemptCounter,
    page_size: u64,
    target: u64,
    offset: u64,
    seen: HashSet<String>,
    exhausted: bool,
    stopped_early: bool,
    pages_fetched: usize,
}

impl<'a> SearchCursor<'a> {
    /// Register the query and position the cursor at offset 0.
    ///
    /// # Arguments
    ///
    /// * `backend` - Search API
    /// * `term` - Full search term (see [`build_term`])
    /// * `max_records` - Cap on identifiers this cursor will yield
    /// * `page_size` - Identifiers per page request
    /// * `retry` / `attempts` - Backoff schedule and shared retry counter
    ///
    /// # Errors
    ///
    /// Fails if the search cannot be registered after retries.
    pub async fn open(
        backend: &'a dyn SearchBackend,
        term: &str,
        max_records: usize,
        page_size: usize,
        retry: RetryPolicy,
        attempts: AttemptCounter,
    ) -> Result<Self> {
        let handle = with_backoff(&retry, &attempts, "search", || backend.open(term)).await?;
        let target = handle.count.min(max_records as u64);

        info!(
            total = handle.count,
            target = target,
            page_size = page_size,
            "Search registered"
        );

        Ok(Self {
            backend,
            handle,
            retry,
            attempts,
            page_size: page_size.max(1) as u64,
            target,
            offset: 0,
            seen: HashSet::new(),
            exhausted: false,
            stopped_early: false,
            pages_fetched: 0,
        })
    }

    /// Continue from `offset` instead of the start
    pub fn resume_from(mut self, offset: u64) -> Self {
        self.offset = offset.min(self.target);
        self
    }

    /// Next page of previously unseen identifiers, `None` when done.
    ///
    /// A page that still fails after retries ends the cursor early; the
    /// identifiers already yielded stay valid.
    pub async fn next_page(&mut self) -> Option<Vec<String>> {
        if self.exhausted || self.offset >= self.target {
            return None;
        }

        let limit = self.page_size.min(self.target - self.offset);
        let offset = self.offset;
        let backend = self.backend;
        let handle = &self.handle;

        let result = with_backoff(&self.retry, &self.attempts, "search page", || {
            backend.fetch_ids(handle, offset, limit)
        })
        .await;

        let mut ids = match result {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    offset = offset,
                    fetched = self.seen.len(),
                    error = %e,
                    "Search page failed, stopping early"
                );
                self.exhausted = true;
                self.stopped_early = true;
                return None;
            }
        };

        self.pages_fetched += 1;

        if ids.is_empty() {
            self.exhausted = true;
            return None;
        }

        if ids.len() as u64 > limit {
            warn!(
                offset = offset,
                limit = limit,
                returned = ids.len(),
                "Search page larger than requested, truncating"
            );
            ids.truncate(limit as usize);
        }

        self.offset += ids.len() as u64;
        if (ids.len() as u64) < limit {
            // Server ran out before the reported count
            self.exhausted = true;
        }

        let page: Vec<String> = ids
            .into_iter()
            .filter(|id| self.seen.insert(id.clone()))
            .collect();

        debug!(offset = self.offset, page = page.len(), "Search page");
        Some(page)
    }

    /// Drain the cursor into one ordered list
    pub async fn collect_all(&mut self) -> Vec<String> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await {
            all.extend(page);
        }
        all
    }

    pub fn total_found(&self) -> u64 {
        self.handle.count
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn stopped_early(&self) -> bool {
        self.stopped_early
    }

    pub fn handle(&self) -> &SearchHandle {
        &self.handle
    }
}
