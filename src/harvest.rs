//! Harvest pipeline driver.
//!
//! Search Cursor → Metadata Fetcher → citation adapters (concurrently) →
//! reconciliation → dataset assembly, one cursor page at a time. A
//! [`CancelFlag`] is checked before every page; a cancelled run keeps the
//! batches already assembled and is marked incomplete.

use crate::citation::{CitationReport, CitationSource, WorkEnrichment};
use crate::config::{HarvestConfig, HarvestRequest, Tuning, REQUEST_TIMEOUT};
use crate::cursor::{build_term, year_bounds, year_histogram, SearchBackend, SearchCursor};
use crate::dataset::{DatasetAssembler, Run, RunMeta, YearRange};
use crate::error::Result;
use crate::http::{build_client, RateLimiter};
use crate::icite::ICiteClient;
use crate::metadata::{MetadataBackend, MetadataFetcher};
use crate::openalex::OpenAlexClient;
use crate::pubmed::PubMedClient;
use crate::reconcile::reconcile_batch;
use crate::retry::AttemptCounter;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cooperative cancellation, shared between the driver and whoever stops it
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wires the backends together and runs harvests
pub struct Harvester {
    search: Arc<dyn SearchBackend>,
    metadata: Arc<dyn MetadataBackend>,
    openalex: Option<Arc<dyn CitationSource>>,
    icite: Option<Arc<dyn CitationSource>>,
    tuning: Tuning,
    attempts: AttemptCounter,
}

impl Harvester {
    pub fn new(search: Arc<dyn SearchBackend>, metadata: Arc<dyn MetadataBackend>) -> Self {
        Self {
            search,
            metadata,
            openalex: None,
            icite: None,
            tuning: Tuning::default(),
            attempts: AttemptCounter::new(),
        }
    }

    pub fn with_openalex(mut self, source: Arc<dyn CitationSource>) -> Self {
        self.openalex = Some(source);
        self
    }

    pub fn with_icite(mut self, source: Arc<dyn CitationSource>) -> Self {
        self.icite = Some(source);
        self
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Share a retry counter with adapters built elsewhere
    pub fn with_attempts(mut self, attempts: AttemptCounter) -> Self {
        self.attempts = attempts;
        self
    }

    /// Build the production clients for `config`.
    ///
    /// Only the citation sources selected in the request are created.
    pub fn from_config(config: &HarvestConfig) -> Result<Self> {
        config.validate()?;

        let user_agent = format!(
            "{}/{} (mailto:{})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            config.credentials.email
        );
        let client = build_client(&user_agent, REQUEST_TIMEOUT)?;
        let tuning = config.tuning.clone();
        let attempts = AttemptCounter::new();

        let ncbi_limiter = Arc::new(RateLimiter::per_second(config.credentials.ncbi_rate()));
        let pubmed = Arc::new(
            PubMedClient::new(client.clone(), &config.endpoints.pubmed, &config.credentials.email)
                .with_api_key(config.credentials.ncbi_api_key.clone())
                .with_limiter(ncbi_limiter),
        );

        let mut harvester = Harvester::new(pubmed.clone(), pubmed)
            .with_tuning(tuning.clone())
            .with_attempts(attempts.clone());

        let source = config.request.citations_source;
        if source.uses_openalex() {
            let openalex = OpenAlexClient::new(
                client.clone(),
                &config.endpoints.openalex,
                config.credentials.openalex_mailto(),
            )
            .with_batch_size(tuning.openalex_batch_size)
            .with_concurrency(tuning.concurrency)
            .with_retry(tuning.retry.clone(), attempts.clone());
            harvester = harvester.with_openalex(Arc::new(openalex));
        }
        if source.uses_icite() {
            let icite = ICiteClient::new(client, &config.endpoints.icite)
                .with_batch_size(tuning.icite_batch_size)
                .with_concurrency(tuning.concurrency)
                .with_retry(tuning.retry.clone(), attempts.clone());
            harvester = harvester.with_icite(Arc::new(icite));
        }

        info!(
            citations_source = %source,
            ncbi_rate = config.credentials.ncbi_rate(),
            "Harvester configured"
        );
        Ok(harvester)
    }

    /// Run one harvest.
    ///
    /// # Errors
    ///
    /// Fails on an invalid request or when the search cannot be opened.
    /// Everything after that degrades to partial data.
    pub async fn run(&self, request: &HarvestRequest, cancel: &CancelFlag) -> Result<Run> {
        request.validate()?;

        let meta = RunMeta::new(
            request.query.clone(),
            YearRange {
                start: request.start_year,
                end: request.end_year,
            },
            request.citations_source,
            request.citations_policy,
        );

        let year_counts = match year_bounds(request.start_year, request.end_year) {
            Some((start, end)) => {
                year_histogram(
                    self.search.as_ref(),
                    &request.query,
                    start,
                    end,
                    &self.tuning.retry,
                    &self.attempts,
                )
                .await
            }
            None => BTreeMap::new(),
        };

        let term = build_term(&request.query, request.start_year, request.end_year);
        info!(term = %term, max_records = request.max_records, "Starting harvest");

        let mut cursor = SearchCursor::open(
            self.search.as_ref(),
            &term,
            request.max_records,
            self.tuning.page_size,
            self.tuning.retry.clone(),
            self.attempts.clone(),
        )
        .await?;

        let mut assembler = DatasetAssembler::new(meta, cursor.total_found());
        assembler.set_year_counts(year_counts);

        let fetcher = MetadataFetcher::new(
            self.metadata.as_ref(),
            self.tuning.metadata_batch_size,
            self.tuning.concurrency,
            self.tuning.retry.clone(),
            self.attempts.clone(),
        );

        let openalex = self
            .openalex
            .as_deref()
            .filter(|_| request.citations_source.uses_openalex());
        let icite = self
            .icite
            .as_deref()
            .filter(|_| request.citations_source.uses_icite());

        let mut batch_no = 0usize;
        loop {
            if cancel.is_cancelled() {
                warn!(batches = batch_no, records = assembler.len(), "Harvest cancelled");
                assembler.mark_incomplete();
                break;
            }

            let Some(ids) = cursor.next_page().await else {
                break;
            };
            batch_no += 1;
            if ids.is_empty() {
                continue;
            }

            let metadata = fetcher.fetch(&ids).await;
            let fetched: Vec<String> = metadata.records.iter().map(|r| r.id.clone()).collect();

            let (openalex_report, icite_report) =
                tokio::join!(lookup(openalex, &fetched), lookup(icite, &fetched));

            let mut enrichment: HashMap<String, WorkEnrichment> = HashMap::new();
            let mut openalex_counts = HashMap::new();
            let mut icite_counts = HashMap::new();

            if let Some(report) = openalex_report {
                assembler.add_failed_citation_batches(report.failed_batches);
                openalex_counts = report.counts;
                enrichment = report.enrichment;
            }
            if let Some(report) = icite_report {
                assembler.add_failed_citation_batches(report.failed_batches);
                icite_counts = report.counts;
            }

            let rows = reconcile_batch(&openalex_counts, &icite_counts, request.citations_policy);
            let appended = assembler.append_batch(&ids, metadata, &rows, &enrichment);

            info!(
                batch = batch_no,
                offset = cursor.offset(),
                total = cursor.total_found(),
                appended = appended,
                records = assembler.len(),
                "Batch complete"
            );
        }

        if cursor.stopped_early() {
            assembler.mark_cursor_stopped_early();
        }
        debug!(pages = cursor.pages_fetched(), offset = cursor.offset(), "Cursor closed");
        assembler.set_retry_attempts(self.attempts.get());

        let run = assembler.finish();
        info!(
            records = run.records.len(),
            incomplete = run.incomplete,
            coverage_pct = run.kpis.coverage_pct,
            "Harvest finished"
        );
        Ok(run)
    }
}

async fn lookup(source: Option<&dyn CitationSource>, ids: &[String]) -> Option<CitationReport> {
    match source {
        Some(source) if !ids.is_empty() => {
            debug!(source = %source.kind(), ids = ids.len(), "Citation lookup");
            Some(source.lookup(ids).await)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CitationsSource, Credentials, Endpoints};
    use std::path::PathBuf;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    fn config(source: CitationsSource) -> HarvestConfig {
        let mut request = HarvestRequest::new("corona");
        request.citations_source = source;
        HarvestConfig {
            request,
            credentials: Credentials {
                email: "someone@example.org".to_string(),
                ncbi_api_key: None,
                openalex_mailto: None,
            },
            endpoints: Endpoints::default(),
            tuning: Tuning::default(),
            outfile: PathBuf::from("results.json"),
            csv_out: None,
        }
    }

    #[test]
    fn test_from_config_builds_selected_sources() {
        let harvester = Harvester::from_config(&config(CitationsSource::ICite)).expect("builds");
        assert!(harvester.openalex.is_none());
        assert!(harvester.icite.is_some());

        let harvester = Harvester::from_config(&config(CitationsSource::Both)).expect("builds");
        assert!(harvester.openalex.is_some() && harvester.icite.is_some());
    }

    #[test]
    fn test_from_config_rejects_missing_email() {
        let mut cfg = config(CitationsSource::Both);
        cfg.credentials.email = "nobody".to_string();
        assert!(Harvester::from_config(&cfg).is_err());
    }
}
