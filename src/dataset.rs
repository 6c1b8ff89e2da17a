//! Dataset assembly and persistence.
//!
//! Joins metadata with reconciled citation rows, keeps the search ranking
//! order, derives the run KPIs and writes the persisted dataset (JSON) plus
//! an optional flat CSV export.

use crate::citation::{push_unique, WorkEnrichment};
use crate::config::CitationsSource;
use crate::error::Result;
use crate::metadata::{ArticleMeta, MetadataBatch};
use crate::reconcile::{CitationPolicy, CitationRow, Provenance};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Relative discrepancy above which a record counts as a high discrepancy
pub const HIGH_DISCREPANCY_PCT: f64 = 10.0;

/// One harvested literature item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub title: String,
    pub journal: String,
    pub year: Option<i32>,
    pub doi: Option<String>,
    pub authors: Vec<String>,
    pub institutions: Vec<String>,
    pub citations_openalex: Option<u64>,
    pub citations_icite: Option<u64>,
    pub citations_unified: Option<u64>,
    pub citation_provenance: Provenance,
    pub citation_discrepancy: Option<u64>,
    #[serde(default)]
    pub openalex_id: Option<String>,
    #[serde(default)]
    pub is_retracted: Option<bool>,
    #[serde(default)]
    pub concepts: Vec<String>,
}

impl Record {
    fn from_parts(meta: ArticleMeta, row: &CitationRow, enrichment: Option<&WorkEnrichment>) -> (Self, bool) {
        let mut doi = meta.doi;
        let mut doi_from_provider = false;
        let mut institutions = Vec::new();
        let mut openalex_id = None;
        let mut is_retracted = None;
        let mut concepts = Vec::new();

        if let Some(extra) = enrichment {
            if doi.is_none() && extra.doi.is_some() {
                doi = extra.doi.clone();
                doi_from_provider = true;
            }
            for institution in &extra.institutions {
                push_unique(&mut institutions, institution);
            }
            openalex_id = extra.provider_id.clone();
            is_retracted = extra.is_retracted;
            concepts = extra.concepts.clone();
        }
        for institution in &meta.institutions {
            push_unique(&mut institutions, institution);
        }

        let record = Self {
            id: meta.id,
            title: meta.title,
            journal: meta.journal,
            year: meta.year,
            doi,
            authors: meta.authors,
            institutions,
            citations_openalex: row.openalex,
            citations_icite: row.icite,
            citations_unified: row.reconciled.unified,
            citation_provenance: row.reconciled.provenance,
            citation_discrepancy: row.reconciled.discrepancy,
            openalex_id,
            is_retracted,
            concepts,
        };
        (record, doi_from_provider)
    }

    /// Both providers reported a count
    pub fn is_dual_source(&self) -> bool {
        self.citations_openalex.is_some() && self.citations_icite.is_some()
    }

    /// `|a - b| / max(a, b) * 100` for dual-source records, 0 when both are 0
    pub fn relative_discrepancy_pct(&self) -> Option<f64> {
        let (a, b) = (self.citations_openalex?, self.citations_icite?);
        let max = a.max(b);
        if max == 0 {
            return Some(0.0);
        }
        Some(a.abs_diff(b) as f64 / max as f64 * 100.0)
    }
}

/// Inclusive publication-year filter of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearRange {
    pub start: Option<i32>,
    pub end: Option<i32>,
}

/// Run parameters fixed at harvest start
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub query: String,
    pub year_range: YearRange,
    pub citations_source: CitationsSource,
    pub citations_policy: CitationPolicy,
    /// RFC 3339, UTC
    pub harvested_at: String,
}

impl RunMeta {
    pub fn new(
        query: impl Into<String>,
        year_range: YearRange,
        citations_source: CitationsSource,
        citations_policy: CitationPolicy,
    ) -> Self {
        Self {
            query: query.into(),
            year_range,
            citations_source,
            citations_policy,
            harvested_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }
}

/// Aggregate indicators for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Kpis {
    pub total_found: u64,
    pub total_fetched: u64,
    pub records: u64,
    pub skipped: u64,
    pub excluded: u64,
    pub doi_backfilled: u64,
    pub coverage_pct: f64,
    pub dual_source_count: u64,
    pub dual_source_pct: f64,
    pub discrepancy_count: u64,
    pub discrepancy_pct: f64,
    pub high_discrepancy_count: u64,
    pub mean_discrepancy_pct: f64,
    pub median_discrepancy_pct: f64,
    pub retry_attempts: u64,
    pub failed_citation_batches: u64,
    pub cursor_stopped_early: bool,
}

/// A finished harvest, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub query: String,
    pub year_range: YearRange,
    pub citations_source: CitationsSource,
    pub citations_policy: CitationPolicy,
    pub harvested_at: String,
    /// Cancelled, or the cursor stopped before the target
    pub incomplete: bool,
    pub year_counts: BTreeMap<i32, u64>,
    pub kpis: Kpis,
    pub records: Vec<Record>,
}

/// Flat CSV row
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    id: &'a str,
    title: &'a str,
    journal: &'a str,
    year: Option<i32>,
    doi: Option<&'a str>,
    authors: String,
    institutions: String,
    citations_openalex: Option<u64>,
    citations_icite: Option<u64>,
    citations_unified: Option<u64>,
    citation_provenance: Provenance,
    citation_discrepancy: Option<u64>,
    openalex_id: Option<&'a str>,
    is_retracted: Option<bool>,
    concepts: String,
}

impl<'a> From<&'a Record> for CsvRow<'a> {
    fn from(r: &'a Record) -> Self {
        Self {
            id: &r.id,
            title: &r.title,
            journal: &r.journal,
            year: r.year,
            doi: r.doi.as_deref(),
            authors: r.authors.join("; "),
            institutions: r.institutions.join("; "),
            citations_openalex: r.citations_openalex,
            citations_icite: r.citations_icite,
            citations_unified: r.citations_unified,
            citation_provenance: r.citation_provenance,
            citation_discrepancy: r.citation_discrepancy,
            openalex_id: r.openalex_id.as_deref(),
            is_retracted: r.is_retracted,
            concepts: r.concepts.join("; "),
        }
    }
}

impl Run {
    /// Write the dataset as pretty JSON, creating parent directories
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!(path = %path.display(), records = self.records.len(), "Dataset saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Flat export, one row per record; list fields joined with `"; "`
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut wtr = csv::WriterBuilder::new().has_headers(true).from_path(path)?;
        for record in &self.records {
            wtr.serialize(CsvRow::from(record))?;
        }
        wtr.flush()?;
        info!(path = %path.display(), rows = self.records.len(), "CSV export saved");
        Ok(())
    }

    /// Records per publication year (records without a year are left out)
    pub fn records_per_year(&self) -> BTreeMap<i32, u64> {
        let mut counts = BTreeMap::new();
        for year in self.records.iter().filter_map(|r| r.year) {
            *counts.entry(year).or_insert(0) += 1;
        }
        counts
    }

    /// Records with a relative discrepancy above [`HIGH_DISCREPANCY_PCT`]
    pub fn high_discrepancy_records(&self) -> impl Iterator<Item = &Record> {
        self.records
            .iter()
            .filter(|r| r.relative_discrepancy_pct().is_some_and(|d| d > HIGH_DISCREPANCY_PCT))
    }
}

/// Builds a [`Run`] batch by batch
#[derive(Debug)]
pub struct DatasetAssembler {
    meta: RunMeta,
    total_found: u64,
    year_counts: BTreeMap<i32, u64>,
    records: Vec<Record>,
    seen: HashSet<String>,
    total_fetched: u64,
    skipped: u64,
    excluded: u64,
    doi_backfilled: u64,
    retry_attempts: u64,
    failed_citation_batches: u64,
    cursor_stopped_early: bool,
    incomplete: bool,
}

impl DatasetAssembler {
    pub fn new(meta: RunMeta, total_found: u64) -> Self {
        Self {
            meta,
            total_found,
            year_counts: BTreeMap::new(),
            records: Vec::new(),
            seen: HashSet::new(),
            total_fetched: 0,
            skipped: 0,
            excluded: 0,
            doi_backfilled: 0,
            retry_attempts: 0,
            failed_citation_batches: 0,
            cursor_stopped_early: false,
            incomplete: false,
        }
    }

    /// Join one batch and append it in `order` (search ranking).
    ///
    /// Only ids with both metadata and a citation row become records.
    /// Metadata without a citation row, and ids already appended, count as
    /// excluded. Citation rows without metadata are dropped.
    ///
    /// Returns the number of records appended.
    pub fn append_batch(
        &mut self,
        order: &[String],
        metadata: MetadataBatch,
        citations: &HashMap<String, CitationRow>,
        enrichment: &HashMap<String, WorkEnrichment>,
    ) -> usize {
        self.skipped += metadata.skipped as u64;
        self.doi_backfilled += metadata.doi_backfilled as u64;
        self.total_fetched += metadata.records.len() as u64;

        let mut by_id: HashMap<String, ArticleMeta> = metadata
            .records
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        let before = self.records.len();

        for id in order {
            let Some(meta) = by_id.remove(id) else {
                continue;
            };
            if self.seen.contains(id) {
                debug!(id = %id, "Duplicate record dropped");
                self.excluded += 1;
                continue;
            }
            let Some(row) = citations.get(id) else {
                debug!(id = %id, "No citation row, record excluded");
                self.excluded += 1;
                continue;
            };

            let (record, doi_from_provider) = Record::from_parts(meta, row, enrichment.get(id));
            if doi_from_provider {
                self.doi_backfilled += 1;
            }
            self.seen.insert(record.id.clone());
            self.records.push(record);
        }

        // Metadata for ids outside the ranking order
        self.excluded += by_id.len() as u64;

        let appended = self.records.len() - before;
        debug!(appended = appended, total = self.records.len(), "Batch appended");
        appended
    }

    pub fn set_year_counts(&mut self, year_counts: BTreeMap<i32, u64>) {
        self.year_counts = year_counts;
    }

    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }

    pub fn mark_cursor_stopped_early(&mut self) {
        self.cursor_stopped_early = true;
        self.incomplete = true;
    }

    pub fn add_failed_citation_batches(&mut self, failed: usize) {
        self.failed_citation_batches += failed as u64;
    }

    pub fn set_retry_attempts(&mut self, attempts: u32) {
        self.retry_attempts = u64::from(attempts);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish(self) -> Run {
        let kpis = self.kpis();
        Run {
            query: self.meta.query,
            year_range: self.meta.year_range,
            citations_source: self.meta.citations_source,
            citations_policy: self.meta.citations_policy,
            harvested_at: self.meta.harvested_at,
            incomplete: self.incomplete,
            year_counts: self.year_counts,
            kpis,
            records: self.records,
        }
    }

    fn kpis(&self) -> Kpis {
        let records = self.records.len() as u64;

        let mut relative: Vec<f64> = self
            .records
            .iter()
            .filter_map(Record::relative_discrepancy_pct)
            .collect();
        let dual_source_count = relative.len() as u64;
        let discrepancy_count = self
            .records
            .iter()
            .filter(|r| r.citation_discrepancy.is_some_and(|d| d > 0))
            .count() as u64;
        let high_discrepancy_count = relative.iter().filter(|&&d| d > HIGH_DISCREPANCY_PCT).count() as u64;

        let mean = if relative.is_empty() {
            0.0
        } else {
            relative.iter().sum::<f64>() / relative.len() as f64
        };
        relative.sort_by(|a, b| a.total_cmp(b));

        Kpis {
            total_found: self.total_found,
            total_fetched: self.total_fetched,
            records,
            skipped: self.skipped,
            excluded: self.excluded,
            doi_backfilled: self.doi_backfilled,
            coverage_pct: coverage_pct(self.total_fetched, self.total_found),
            dual_source_count,
            dual_source_pct: percent(dual_source_count, records),
            discrepancy_count,
            discrepancy_pct: percent(discrepancy_count, dual_source_count),
            high_discrepancy_count,
            mean_discrepancy_pct: round2(mean),
            median_discrepancy_pct: round2(median(&relative)),
            retry_attempts: self.retry_attempts,
            failed_citation_batches: self.failed_citation_batches,
            cursor_stopped_early: self.cursor_stopped_early,
        }
    }
}

/// Two decimals, half away from zero
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 / whole as f64 * 100.0)
}

/// Fetched over found, in [0, 100]
pub fn coverage_pct(fetched: u64, found: u64) -> f64 {
    percent(fetched, found).clamp(0.0, 100.0)
}

/// Median of an ascending slice, 0 when empty
fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => sorted[n / 2],
        _ => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{reconcile, CitationPolicy};

    fn meta(id: &str, year: i32) -> ArticleMeta {
        ArticleMeta {
            id: id.to_string(),
            title: format!("Paper {}", id),
            journal: "Journal".to_string(),
            year: Some(year),
            doi: None,
            authors: vec!["Doe J".to_string(), "Roe R".to_string()],
            institutions: vec!["MIT".to_string()],
        }
    }

    fn row(openalex: Option<u64>, icite: Option<u64>) -> CitationRow {
        CitationRow {
            openalex,
            icite,
            reconciled: reconcile(openalex, icite, CitationPolicy::Reconcile),
        }
    }

    fn run_meta() -> RunMeta {
        RunMeta::new(
            "corona",
            YearRange {
                start: Some(2020),
                end: Some(2020),
            },
            CitationsSource::Both,
            CitationPolicy::Reconcile,
        )
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_join_keeps_ranking_order_and_drops_orphans() {
        let mut assembler = DatasetAssembler::new(run_meta(), 10);
        let batch = MetadataBatch {
            records: vec![meta("3", 2020), meta("1", 2020), meta("2", 2020)],
            skipped: 1,
            doi_backfilled: 0,
        };
        let citations: HashMap<String, CitationRow> = [
            ("1".to_string(), row(Some(1), Some(1))),
            ("2".to_string(), row(Some(2), None)),
            ("3".to_string(), row(None, Some(3))),
            // Citation-only, no metadata
            ("99".to_string(), row(Some(5), Some(5))),
        ]
        .into_iter()
        .collect();

        let appended = assembler.append_batch(&ids(&["2", "3", "1", "4"]), batch, &citations, &HashMap::new());
        let run = assembler.finish();

        assert_eq!(appended, 3);
        let got: Vec<&str> = run.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(got, vec!["2", "3", "1"]);
        assert!(run.records.iter().all(|r| r.id != "99"));
        assert_eq!(run.kpis.skipped, 1);
    }

    #[test]
    fn test_duplicates_and_missing_rows_are_excluded() {
        let mut assembler = DatasetAssembler::new(run_meta(), 10);
        let citations: HashMap<String, CitationRow> =
            [("1".to_string(), row(Some(1), Some(1)))].into_iter().collect();

        let first = MetadataBatch {
            records: vec![meta("1", 2020), meta("2", 2020)],
            ..Default::default()
        };
        assembler.append_batch(&ids(&["1", "2"]), first, &citations, &HashMap::new());
        let second = MetadataBatch {
            records: vec![meta("1", 2020)],
            ..Default::default()
        };
        assembler.append_batch(&ids(&["1"]), second, &citations, &HashMap::new());

        let run = assembler.finish();
        assert_eq!(run.records.len(), 1);
        assert_eq!(run.kpis.excluded, 2);
    }

    #[test]
    fn test_enrichment_fills_doi_and_merges_institutions() {
        let mut assembler = DatasetAssembler::new(run_meta(), 1);
        let enrichment: HashMap<String, WorkEnrichment> = [(
            "1".to_string(),
            WorkEnrichment {
                provider_id: Some("https://openalex.org/W1".to_string()),
                doi: Some("10.1/one".to_string()),
                is_retracted: Some(false),
                concepts: vec!["Virology".to_string()],
                institutions: vec!["Harvard".to_string(), "MIT".to_string()],
            },
        )]
        .into_iter()
        .collect();
        let citations: HashMap<String, CitationRow> =
            [("1".to_string(), row(Some(4), Some(6)))].into_iter().collect();
        let batch = MetadataBatch {
            records: vec![meta("1", 2020)],
            ..Default::default()
        };

        assembler.append_batch(&ids(&["1"]), batch, &citations, &enrichment);
        let run = assembler.finish();
        let record = &run.records[0];

        assert_eq!(record.doi.as_deref(), Some("10.1/one"));
        assert_eq!(record.institutions, vec!["Harvard", "MIT"]);
        assert_eq!(record.concepts, vec!["Virology"]);
        assert_eq!(record.citations_unified, Some(5));
        assert_eq!(record.citation_provenance, Provenance::BothReconciled);
        assert_eq!(run.kpis.doi_backfilled, 1);
    }

    #[test]
    fn test_kpis() {
        let mut assembler = DatasetAssembler::new(run_meta(), 8);
        let batch = MetadataBatch {
            records: vec![meta("1", 2020), meta("2", 2020), meta("3", 2020), meta("4", 2020)],
            skipped: 0,
            doi_backfilled: 0,
        };
        let citations: HashMap<String, CitationRow> = [
            ("1".to_string(), row(Some(10), Some(10))),
            ("2".to_string(), row(Some(5), Some(15))),
            ("3".to_string(), row(Some(95), Some(100))),
            ("4".to_string(), row(Some(8), None)),
        ]
        .into_iter()
        .collect();

        assembler.append_batch(&ids(&["1", "2", "3", "4"]), batch, &citations, &HashMap::new());
        assembler.set_retry_attempts(3);
        let kpis = assembler.finish().kpis;

        assert_eq!(kpis.records, 4);
        assert_eq!(kpis.coverage_pct, 50.0);
        assert_eq!(kpis.dual_source_count, 3);
        assert_eq!(kpis.dual_source_pct, 75.0);
        assert_eq!(kpis.discrepancy_count, 2);
        assert_eq!(kpis.discrepancy_pct, 66.67);
        // Relative: 0, 66.67, 5
        assert_eq!(kpis.high_discrepancy_count, 1);
        assert_eq!(kpis.median_discrepancy_pct, 5.0);
        assert_eq!(kpis.mean_discrepancy_pct, 23.89);
        assert_eq!(kpis.retry_attempts, 3);
    }

    #[test]
    fn test_coverage_bounds() {
        assert_eq!(coverage_pct(0, 0), 0.0);
        assert_eq!(coverage_pct(5, 0), 0.0);
        assert_eq!(coverage_pct(1, 3), 33.33);
        assert_eq!(coverage_pct(2, 3), 66.67);
        assert_eq!(coverage_pct(10, 5), 100.0);
        for found in 0..20u64 {
            for fetched in 0..25u64 {
                let c = coverage_pct(fetched, found);
                assert!((0.0..=100.0).contains(&c));
            }
        }
    }

    #[test]
    fn test_relative_discrepancy() {
        let mut assembler = DatasetAssembler::new(run_meta(), 1);
        let citations: HashMap<String, CitationRow> =
            [("1".to_string(), row(Some(0), Some(0)))].into_iter().collect();
        let batch = MetadataBatch {
            records: vec![meta("1", 2020)],
            ..Default::default()
        };
        assembler.append_batch(&ids(&["1"]), batch, &citations, &HashMap::new());
        let run = assembler.finish();

        assert_eq!(run.records[0].relative_discrepancy_pct(), Some(0.0));
        assert_eq!(run.high_discrepancy_records().count(), 0);
    }

    #[test]
    fn test_persist_load_and_csv() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut assembler = DatasetAssembler::new(run_meta(), 2);
        assembler.set_year_counts([(2020, 2)].into_iter().collect());
        let citations: HashMap<String, CitationRow> = [
            ("1".to_string(), row(Some(3), None)),
            ("2".to_string(), row(None, None)),
        ]
        .into_iter()
        .collect();
        let batch = MetadataBatch {
            records: vec![meta("1", 2020), meta("2", 2019)],
            ..Default::default()
        };
        assembler.append_batch(&ids(&["1", "2"]), batch, &citations, &HashMap::new());
        assembler.mark_cursor_stopped_early();
        let run = assembler.finish();

        let json_path = dir.path().join("nested").join("results.json");
        run.persist(&json_path).expect("persist");
        let loaded = Run::load(&json_path).expect("load");
        assert_eq!(loaded, run);
        assert!(loaded.incomplete);
        assert!(loaded.kpis.cursor_stopped_early);
        assert_eq!(loaded.records[1].citation_provenance, Provenance::Unavailable);
        assert_eq!(loaded.records_per_year().get(&2019), Some(&1));

        let raw = fs::read_to_string(&json_path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["citations_policy"], "reconcile");
        assert_eq!(value["year_range"]["start"], 2020);
        assert_eq!(value["records"][0]["citation_provenance"], "openalex_only");
        assert!(value["records"][1]["citations_unified"].is_null());

        let csv_path = dir.path().join("results.csv");
        run.write_csv(&csv_path).expect("csv");
        let csv_text = fs::read_to_string(&csv_path).expect("read csv");
        let mut lines = csv_text.lines();
        assert!(lines.next().is_some_and(|h| h.starts_with("id,title,journal,year,doi,authors")));
        assert!(lines.next().is_some_and(|l| l.contains("Doe J; Roe R") && l.contains("openalex_only")));
    }
}
