//! Citation source abstraction.
//!
//! OpenAlex and iCite expose the same capability: a bulk lookup from PMIDs to
//! citation counts. Both adapters implement [`CitationSource`], so the
//! reconciliation step only ever sees two optional integers per id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Provider identity, used in logs and KPIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    OpenAlex,
    ICite,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::OpenAlex => f.write_str("openalex"),
            SourceKind::ICite => f.write_str("icite"),
        }
    }
}

/// Extra per-work metadata a provider may return alongside the count
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkEnrichment {
    pub provider_id: Option<String>,
    pub doi: Option<String>,
    pub is_retracted: Option<bool>,
    pub concepts: Vec<String>,
    /// Affiliations in authorship order, de-duplicated
    pub institutions: Vec<String>,
}

/// Result of one bulk lookup.
///
/// `counts` has an entry for every requested id; `None` means the provider
/// has no data for it (or its batch failed).
#[derive(Debug, Clone)]
pub struct CitationReport {
    pub source: SourceKind,
    pub counts: HashMap<String, Option<u64>>,
    pub enrichment: HashMap<String, WorkEnrichment>,
    /// Batches that failed after retries or could not be parsed
    pub failed_batches: usize,
}

impl CitationReport {
    /// Report with every id marked unavailable
    pub fn empty(source: SourceKind, ids: &[String]) -> Self {
        Self {
            source,
            counts: ids.iter().map(|id| (id.clone(), None)).collect(),
            enrichment: HashMap::new(),
            failed_batches: 0,
        }
    }

    /// Ids the provider reported a count for
    pub fn found(&self) -> usize {
        self.counts.values().filter(|c| c.is_some()).count()
    }
}

/// Bulk citation lookup.
///
/// Implementations batch to their provider's limit, retry transient failures,
/// and never fail the whole lookup: failures become unavailable counts.
#[async_trait]
pub trait CitationSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn lookup(&self, ids: &[String]) -> CitationReport;
}

/// Keep the first occurrence of every non-empty string
pub(crate) fn push_unique(target: &mut Vec<String>, value: &str) {
    let value = value.trim();
    if !value.is_empty() && !target.iter().any(|v| v == value) {
        target.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report_marks_all_unavailable() {
        let ids = vec!["1".to_string(), "2".to_string()];
        let report = CitationReport::empty(SourceKind::ICite, &ids);
        assert_eq!(report.counts.len(), 2);
        assert_eq!(report.found(), 0);
        assert!(report.counts.values().all(Option::is_none));
    }

    #[test]
    fn test_push_unique() {
        let mut v = Vec::new();
        push_unique(&mut v, "MIT");
        push_unique(&mut v, " MIT ");
        push_unique(&mut v, "");
        push_unique(&mut v, "ETH Zurich");
        assert_eq!(v, vec!["MIT", "ETH Zurich"]);
    }
}
